// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! registry-migration - inspect and change the storage migration state

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use registry_cutover::commands::{self, Cli};
use registry_cutover::config::MigrationConfig;
use registry_cutover::migration::MigrationStateMachine;
use registry_cutover::storage::SqlTransactionManager;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<MigrationConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => MigrationConfig::default(),
    };
    if cli.sql_url.is_some() {
        config.sql_url = cli.sql_url.clone();
    }
    let url = config
        .sql_url
        .as_deref()
        .context("no database configured; pass --sql-url or set REGISTRY_SQL_URL")?;

    let manager = SqlTransactionManager::connect(url, config.sql_max_connections)
        .await
        .context("connecting to the relational database")?
        .with_default_isolation(config.default_isolation);
    let machine = MigrationStateMachine::new(Arc::new(manager));

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout().lock();
    commands::run(&cli.command, &machine, &mut input, &mut out).await?;
    Ok(())
}
