//! simple_bank command line
//!
//! ```text
//! simple_bank [--env dev] migrate
//! simple_bank [--env dev] create-account <owner> <currency> [balance]
//! simple_bank [--env dev] get-account <id>
//! simple_bank [--env dev] transfer <from> <to> <amount>
//! ```
//!
//! Results are printed to stdout as JSON. Logs go to the configured file and stderr.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use simple_bank::config::AppConfig;
use simple_bank::db::Database;
use simple_bank::models::{CreateAccountParams, TransferTxParams};
use simple_bank::transfer::TransferService;

const USAGE: &str = "usage: simple_bank [--env <name>] <migrate | create-account <owner> <currency> [balance] | get-account <id> | transfer <from> <to> <amount>>";

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Positional arguments with the `--env <name>` pair removed
fn get_command_args() -> Vec<String> {
    let mut args = std::env::args().skip(1);
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--env" || arg == "-e" {
            args.next();
            continue;
        }
        positional.push(arg);
    }
    positional
}

fn parse_i64(value: &str, name: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("{} must be an integer, got {:?}", name, value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)
        .with_context(|| format!("Failed to load configuration for env {:?}", env))?;
    let _log_guard = simple_bank::logging::init_logging(&app_config);

    tracing::info!("Starting simple_bank in {} mode", env);

    let args = get_command_args();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let db = Database::connect(&app_config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;

    if command == "migrate" {
        db.migrate().await?;
        return print_json(&serde_json::json!({ "migrated": true }));
    }

    let service = TransferService::new(Arc::new(db.store()))
        .with_tx_timeout(app_config.transfer.tx_timeout());

    match (command.as_str(), &args[1..]) {
        ("create-account", [owner, currency, rest @ ..]) if rest.len() <= 1 => {
            let balance = match rest.first() {
                Some(value) => parse_i64(value, "balance")?,
                None => 0,
            };
            let account = service
                .create_account(CreateAccountParams {
                    owner: owner.clone(),
                    balance,
                    currency: currency.to_uppercase(),
                })
                .await?;
            print_json(&account)
        }
        ("get-account", [id]) => {
            let account = service.get_account(parse_i64(id, "id")?).await?;
            print_json(&account)
        }
        ("transfer", [from, to, amount]) => {
            let params = TransferTxParams::new(
                parse_i64(from, "from")?,
                parse_i64(to, "to")?,
                parse_i64(amount, "amount")?,
            );
            let result = service.transfer(params).await?;
            print_json(&result)
        }
        _ => bail!(USAGE),
    }
}
