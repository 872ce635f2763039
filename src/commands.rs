// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operator commands for inspecting and moving the migration state.
//!
//! Parsing lives here rather than in the binary so the commands can be
//! driven from tests with scripted input.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::info;

use crate::migration::{MigrationError, MigrationState, MigrationStateMachine};

#[derive(Parser, Debug)]
#[command(name = "registry-migration")]
#[command(author, version, about = "Inspect and change the registry storage migration state")]
pub struct Cli {
    /// SQL connection string holding the migration state record
    #[arg(long, env = "REGISTRY_SQL_URL", global = true)]
    pub sql_url: Option<String>,

    /// JSON migration config; `--sql-url` takes precedence over its `sql_url`
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set the current database migration state
    SetMigrationState {
        /// Exactly one of DOC_ONLY, DOC_PRIMARY, DOC_PRIMARY_READ_ONLY,
        /// REL_PRIMARY, REL_PRIMARY_READ_ONLY, REL_ONLY
        #[arg(num_args = 0..)]
        states: Vec<String>,

        /// Do not ask for confirmation
        #[arg(long, short)]
        force: bool,
    },

    /// Print the current database migration state
    CheckMigrationState,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The single state token of `set-migration-state`.
pub fn parse_target(tokens: &[String]) -> Result<MigrationState, MigrationError> {
    match tokens {
        [token] => token.parse(),
        _ => Err(MigrationError::InvalidArguments(
            "Must provide exactly one migration state to set".into(),
        )),
    }
}

#[must_use]
pub fn prompt(current: MigrationState, target: MigrationState) -> String {
    format!("Attempt to change from migration state {current} to state {target}?")
}

/// Runs `command`, writing its output to `out` and reading any
/// confirmation from `input`.
pub async fn run<R: BufRead, W: Write>(
    command: &Command,
    machine: &MigrationStateMachine,
    input: &mut R,
    out: &mut W,
) -> Result<(), CommandError> {
    match command {
        Command::CheckMigrationState => {
            let state = machine.current().await?;
            writeln!(out, "Current migration state: {state}")?;
        }
        Command::SetMigrationState { states, force } => {
            let target = parse_target(states)?;
            let current = machine.current().await?;
            writeln!(out, "{}", prompt(current, target))?;
            if !force && !confirm(input, out)? {
                writeln!(out, "Aborted.")?;
                return Ok(());
            }
            let transition = machine.set_state(target).await?;
            info!(from = %transition.from, to = %transition.to, "Migration state set by operator");
            writeln!(
                out,
                "Successfully changed from state {} to state {}",
                transition.from, transition.to
            )?;
        }
    }
    Ok(())
}

fn confirm<R: BufRead, W: Write>(input: &mut R, out: &mut W) -> io::Result<bool> {
    write!(out, "Perform this command? (y/N): ")?;
    out.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTransactionManager;
    use std::sync::Arc;

    fn machine() -> MigrationStateMachine {
        MigrationStateMachine::new(Arc::new(MemoryTransactionManager::relational()))
    }

    fn set(states: &[&str], force: bool) -> Command {
        Command::SetMigrationState {
            states: states.iter().map(|s| s.to_string()).collect(),
            force,
        }
    }

    async fn run_with(machine: &MigrationStateMachine, command: Command, answer: &str) -> (Result<(), CommandError>, String) {
        let mut input = answer.as_bytes();
        let mut out = Vec::new();
        let result = run(&command, machine, &mut input, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "registry-migration",
            "--sql-url",
            "sqlite::memory:",
            "set-migration-state",
            "DOC_PRIMARY",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.sql_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(cli.command, set(&["DOC_PRIMARY"], true));

        let cli = Cli::try_parse_from(["registry-migration", "check-migration-state"]).unwrap();
        assert_eq!(cli.command, Command::CheckMigrationState);
        assert!(Cli::try_parse_from(["registry-migration", "frobnicate"]).is_err());
    }

    #[test]
    fn test_token_count_and_spelling() {
        assert!(matches!(parse_target(&[]), Err(MigrationError::InvalidArguments(_))));
        let two = vec!["DOC_PRIMARY".to_string(), "REL_ONLY".to_string()];
        assert!(matches!(parse_target(&two), Err(MigrationError::InvalidArguments(_))));
        assert!(matches!(
            parse_target(&["DOC_PRIMARY_RO".to_string()]),
            Err(MigrationError::UnknownState(_))
        ));
        assert_eq!(
            parse_target(&["REL_ONLY".to_string()]).unwrap(),
            MigrationState::RelOnly
        );
    }

    #[tokio::test]
    async fn test_check_prints_current() {
        let machine = machine();
        let (result, out) = run_with(&machine, Command::CheckMigrationState, "").await;
        result.unwrap();
        assert_eq!(out, "Current migration state: DOC_ONLY\n");
    }

    #[tokio::test]
    async fn test_forced_set() {
        let machine = machine();
        let (result, out) = run_with(&machine, set(&["DOC_PRIMARY"], true), "").await;
        result.unwrap();
        assert_eq!(
            out,
            "Attempt to change from migration state DOC_ONLY to state DOC_PRIMARY?\n\
             Successfully changed from state DOC_ONLY to state DOC_PRIMARY\n"
        );
        assert_eq!(machine.current().await.unwrap(), MigrationState::DocPrimary);
    }

    #[tokio::test]
    async fn test_confirmation() {
        let machine = machine();
        let (result, out) = run_with(&machine, set(&["DOC_PRIMARY"], false), "n\n").await;
        result.unwrap();
        assert!(out.ends_with("Aborted.\n"));
        assert_eq!(machine.current().await.unwrap(), MigrationState::DocOnly);

        let (result, out) = run_with(&machine, set(&["DOC_PRIMARY"], false), "yes\n").await;
        result.unwrap();
        assert!(out.contains("Successfully changed from state DOC_ONLY to state DOC_PRIMARY"));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_an_error() {
        let machine = machine();
        let (result, _) = run_with(&machine, set(&["REL_ONLY"], true), "").await;
        assert!(matches!(
            result,
            Err(CommandError::Migration(MigrationError::IllegalTransition { .. }))
        ));
        let (result, out) = run_with(&machine, set(&[], true), "").await;
        assert!(matches!(
            result,
            Err(CommandError::Migration(MigrationError::InvalidArguments(_)))
        ));
        assert!(out.is_empty());
    }
}
