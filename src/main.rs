//! tenant-db command line.
//!
//! Runs ad-hoc SQL against tenant databases, resolves tenant keys and reports
//! pool state. Results are printed to stdout as JSON, logs go to stderr.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::process::ExitCode;
use tenant_db::{Config, DatabaseManager, DbError, DbResult, NamedParams, Value};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "tenant-db", version, about = "Multi-tenant database access tool")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run SELECT 1 against the default database
    TestConnection,
    /// Print the database a tenant key resolves to
    Resolve { key: String },
    /// Run a statement on one database
    Query {
        /// Tenant key (exact code or %pattern%)
        #[arg(long, conflicts_with = "database")]
        tenant: Option<String>,
        /// Physical database name; defaults to DB_DATABASE
        #[arg(long)]
        database: Option<String>,
        /// Named parameter as name=value, repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        sql: String,
    },
    /// Run a statement on every active tenant, continuing past failures
    ForEachTenant {
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        sql: String,
    },
    /// Show cached pools
    Pools,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim().trim_start_matches('@');
    if name.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn named_params(params: &[(String, String)]) -> NamedParams {
    params
        .iter()
        .map(|(name, value)| (name.as_str(), cli_value(value)))
        .collect()
}

/// Integers are bound as integers, `null` as NULL, anything else as text.
fn cli_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(n) = raw.parse::<i64>() {
        Value::Int(n)
    } else {
        Value::String(raw.to_string())
    }
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => error!(error = %e, "Failed to serialize output"),
    }
}

async fn run(manager: &DatabaseManager, command: Command) -> DbResult<bool> {
    match command {
        Command::TestConnection => {
            let ok = manager.test_connection().await;
            print_json(&json!({ "database": manager.default_database(), "ok": ok }));
            Ok(ok)
        }
        Command::Resolve { key } => {
            let database = manager.resolve_tenant_database(&key).await?;
            print_json(&json!({ "tenant_key": key, "database": database }));
            Ok(true)
        }
        Command::Query {
            tenant,
            database,
            params,
            sql,
        } => {
            let database = match tenant {
                Some(key) => Some(manager.resolve_tenant_database(&key).await?),
                None => database,
            };
            let rows = manager
                .execute_query(&sql, &named_params(&params), database.as_deref())
                .await?;
            print_json(&serde_json::to_value(&rows).map_err(|e| DbError::internal(e.to_string()))?);
            Ok(true)
        }
        Command::ForEachTenant { params, sql } => {
            let params = named_params(&params);
            let tenants = manager.active_tenants().await?;
            let mut results = Vec::with_capacity(tenants.len());
            let mut failed = 0usize;

            for tenant in &tenants {
                match manager.execute(&sql, &params, &tenant.database_name).await {
                    Ok(rows) => results.push(json!({
                        "tenant_key": tenant.tenant_key,
                        "database": tenant.database_name,
                        "result": rows,
                    })),
                    Err(DbError::ShutDown) => return Err(DbError::ShutDown),
                    Err(e) => {
                        failed += 1;
                        warn!(
                            tenant_key = %tenant.tenant_key,
                            database = %tenant.database_name,
                            error = %e,
                            "Tenant statement failed, continuing"
                        );
                        results.push(json!({
                            "tenant_key": tenant.tenant_key,
                            "database": tenant.database_name,
                            "error": e.to_response(),
                        }));
                    }
                }
            }

            info!(tenants = tenants.len(), failed, "Finished tenant batch");
            print_json(&json!({ "tenants": results, "failed": failed }));
            Ok(failed == 0)
        }
        Command::Pools => {
            print_json(&json!({ "pools": manager.pool_stats().await }));
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(&cli.config);

    info!(driver = %cli.config.driver, "Starting tenant-db v{}", env!("CARGO_PKG_VERSION"));

    let manager = match cli
        .config
        .connection_settings()
        .and_then(DatabaseManager::init)
    {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Failed to initialize database layer");
            print_json(&e.to_response());
            return ExitCode::FAILURE;
        }
    };

    let outcome = tokio::select! {
        result = run(&manager, cli.command) => result,
        _ = wait_for_signal() => Err(DbError::cancelled("command interrupted by signal")),
    };

    manager.close_connection().await;

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Command failed");
            print_json(&e.to_response());
            ExitCode::FAILURE
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
