//! Schema management commands for pgjsonb databases.
//!
//! Exit codes: 0 success, 2 configuration error, 3 database error (clap
//! itself exits 2 on usage errors).

use std::process::ExitCode;

use anyhow::Error;
use clap::{Parser, Subcommand};
use postgres::{Client, Config, NoTls};

#[derive(Parser)]
#[command(name = "pgjsonb", version, about = "pgjsonb storage schema management")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install the storage schema (idempotent).
    InstallSchema {
        /// PostgreSQL connection string.
        dsn: String,
        /// Also create the history tables for point-in-time reads.
        #[arg(long)]
        history_preserving: bool,
    },
    /// Convert a history-preserving database to history-free: drop the
    /// history tables and prune stale blob and transaction rows.
    DropHistory {
        /// PostgreSQL connection string.
        dsn: String,
    },
}

struct CliError {
    code: u8,
    source: Error,
}

impl CliError {
    fn config(source: impl Into<Error>) -> Self {
        CliError {
            code: 2,
            source: source.into(),
        }
    }

    fn db(source: impl Into<Error>) -> Self {
        CliError {
            code: 3,
            source: source.into(),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env().format_timestamp(None).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e.source);
            ExitCode::from(e.code)
        }
    }
}

fn connect(dsn: &str) -> Result<Client, CliError> {
    let config: Config = dsn.parse().map_err(CliError::config)?;
    config.connect(NoTls).map_err(CliError::db)
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::InstallSchema {
            dsn,
            history_preserving,
        } => {
            let mut client = connect(&dsn)?;
            pgjsonb::schema::install(&mut client, history_preserving).map_err(CliError::db)?;
            println!(
                "schema installed ({})",
                if history_preserving { "history-preserving" } else { "history-free" }
            );
        }
        Command::DropHistory { dsn } => {
            let mut client = connect(&dsn)?;
            let report = pgjsonb::schema::drop_history(&mut client).map_err(CliError::db)?;
            println!("history rows removed:      {}", report.history_rows);
            println!("pack rows removed:         {}", report.pack_rows);
            println!("blob-history rows removed: {}", report.blob_history_rows);
            println!("old blob versions removed: {}", report.old_blob_versions);
            println!("orphan transactions:       {}", report.orphan_transactions);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_install_schema_flags() {
        let cli = Cli::parse_from(["pgjsonb", "install-schema", "host=x", "--history-preserving"]);
        match cli.command {
            Command::InstallSchema {
                dsn,
                history_preserving,
            } => {
                assert_eq!(dsn, "host=x");
                assert!(history_preserving);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn bad_dsn_is_a_configuration_error() {
        let err = match connect("this is not a dsn") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code, 2);
    }
}
