use thiserror::Error;

use crate::types::UserId;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance: required={required} available={available}")]
    InsufficientBalance { required: i64, available: i64 },
    #[error("plan not found: {code}")]
    PlanNotFound { code: String },
    #[error("model {model} is not included in plan {plan}")]
    ModelNotAllowed { model: String, plan: String },
    #[error("daily grant already claimed; retry in {retry_after_ms}ms")]
    AlreadyGranted { retry_after_ms: u64 },
    #[error("request too large: limit={limit} actual={actual}")]
    RequestTooLarge { limit: u64, actual: u64 },
    #[error("invalid amount: {amount}")]
    InvalidAmount { amount: i64 },
    #[error("credit package not found: {id}")]
    PackageNotFound { id: i64 },
    #[error("subscription not found: {id}")]
    SubscriptionNotFound { id: i64 },
    #[error("timed out waiting for balance lock of user {user_id}")]
    LockTimeout { user_id: UserId },
    #[error("operation timed out: {operation}")]
    Timeout { operation: &'static str },
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("identity error: {message}")]
    Identity { message: String },
    #[error("model provider error: {message}")]
    Provider { message: String },
}

impl LedgerError {
    /// Transient failures are worth retrying with backoff; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Timeout { .. } | Self::StoreUnavailable { .. }
        )
    }

    /// Text that can be shown to the end user as-is.
    ///
    /// Balance and entitlement failures carry the numbers the user needs to fix them;
    /// transient and internal failures never leak detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientBalance {
                required,
                available,
            } => format!(
                "Not enough credits for this request.\n\nCost: {required} credits\nYour balance: {available} credits\n\nClaim your daily credits with /daily or top up your balance."
            ),
            Self::PlanNotFound { code } => {
                format!("The plan \"{code}\" is not available. See /plans for current options.")
            }
            Self::ModelNotAllowed { model, plan } => format!(
                "The model {model} is not included in your {plan} plan. Upgrade to get access, see /plans."
            ),
            Self::AlreadyGranted { retry_after_ms } => {
                let total_minutes = retry_after_ms.div_ceil(60_000);
                let hours = total_minutes / 60;
                let minutes = total_minutes % 60;
                format!(
                    "You have already claimed today's credits. Next claim available in {hours}h {minutes}m."
                )
            }
            Self::RequestTooLarge { limit, actual } => format!(
                "Your request is too long: {actual} characters, your plan allows {limit}.\n\nShorten it or upgrade to a plan with a larger limit, see /plans."
            ),
            Self::InvalidAmount { .. } => "The requested amount is not valid.".to_string(),
            Self::PackageNotFound { .. } => "That credit package is not available.".to_string(),
            Self::SubscriptionNotFound { .. } => "That subscription was not found.".to_string(),
            Self::Identity { .. } => {
                "We could not register your account. Please try again later.".to_string()
            }
            Self::Provider { .. } => {
                "The model provider failed to answer. You were not charged, please try again later."
                    .to_string()
            }
            Self::LockTimeout { .. }
            | Self::Timeout { .. }
            | Self::StoreUnavailable { .. }
            | Self::Configuration { .. } => {
                "Something went wrong on our side. Please try again later.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
