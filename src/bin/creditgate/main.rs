mod cli;

use std::sync::Arc;

use clap::Parser as _;
use serde::Serialize;

use creditgate::telemetry::{TelemetryOptions, init_tracing};
use creditgate::{
    Clock as _, GatewayConfig, Grant, Services, Spend, SqliteStore, SystemClock,
};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _telemetry = init_tracing(
        "creditgate",
        &TelemetryOptions {
            json_logs: cli.json_logs,
            otel: cli.otel,
            otel_endpoint: cli.otel_endpoint.clone(),
        },
    )?;

    let config = match cli.config.as_ref() {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::default(),
    };
    let store = Arc::new(
        SqliteStore::new(&cli.db).with_lock_timeout(config.ledger.lock_timeout()),
    );
    store.init().await?;
    let clock = Arc::new(SystemClock);
    let services = Services::new(config, store, clock.clone())?;

    match cli.command {
        Command::Init => {
            print_json(&serde_json::json!({ "db": cli.db, "initialized": true }))?;
        }
        Command::Balance { user } => {
            print_json(&services.ledger.balance(user).await?)?;
        }
        Command::Grant {
            user,
            amount,
            kind,
            description,
            correlation_id,
            expiry_days,
        } => {
            let mut grant = Grant::new(amount, kind)
                .description(description)
                .expiry_days(expiry_days);
            if let Some(correlation_id) = correlation_id {
                grant = grant.correlation_id(correlation_id);
            }
            print_json(&services.ledger.grant(user, grant).await?)?;
        }
        Command::Spend {
            user,
            amount,
            kind,
            description,
            correlation_id,
        } => {
            let mut spend = Spend::new(amount, kind).description(description);
            if let Some(correlation_id) = correlation_id {
                spend = spend.correlation_id(correlation_id);
            }
            print_json(&services.ledger.spend(user, spend).await?)?;
        }
        Command::Daily {
            user,
            bonus_percent,
        } => {
            print_json(&services.ledger.grant_daily(user, bonus_percent).await?)?;
        }
        Command::History {
            user,
            limit,
            offset,
        } => {
            print_json(&services.ledger.history(user, limit, offset).await?)?;
        }
        Command::Sweep { now_ms } => {
            let now_ms = now_ms.unwrap_or_else(|| clock.now_millis());
            let report = services.ledger.sweep_expired(now_ms).await?;
            let subscriptions_expired = services.entitlements.expire_subscriptions().await?;
            print_json(&serde_json::json!({
                "credits": report,
                "subscriptions_expired": subscriptions_expired,
            }))?;
        }
        Command::Plans => {
            let catalog = services.entitlements.catalog();
            let plans: Vec<_> = catalog.plans().collect();
            let packages: Vec<_> = catalog.packages().collect();
            print_json(&serde_json::json!({
                "default_plan": catalog.default_code(),
                "plans": plans,
                "packages": packages,
            }))?;
        }
        Command::Subscribe {
            user,
            plan,
            period,
            payment_id,
        } => {
            let subscription = services
                .entitlements
                .subscribe(user, &plan, period, payment_id)
                .await?;
            let bonus = services.ledger.grant_welcome_bonus(&subscription).await?;
            print_json(&serde_json::json!({
                "subscription": subscription,
                "welcome_bonus": bonus,
            }))?;
        }
        Command::Purchase {
            user,
            package,
            payment_id,
        } => {
            print_json(
                &services
                    .ledger
                    .purchase_package(user, package, &payment_id)
                    .await?,
            )?;
        }
        Command::Stats { user, limit } => {
            let per_model = services.meter.usage_statistics(user).await?;
            let recent = services.meter.usage_history(user, limit).await?;
            print_json(&serde_json::json!({
                "requests_per_model": per_model,
                "recent": recent,
            }))?;
        }
        Command::Audit { limit, since_ms } => {
            print_json(&services.ledger.audit_logs(limit, since_ms).await?)?;
        }
    }

    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
