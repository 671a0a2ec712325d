// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metered - credit reservation and settlement for metered features.
//!
//! This is the binary entry point for operating the usage ledger.

mod commands;
mod serve;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use metered_core::Credits;

/// Metered - credit reservation and settlement for metered features.
#[derive(Parser, Debug)]
#[command(name = "metered", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the standard locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the retry driver and the reconciler until interrupted.
    Serve,
    /// Show a user's credit balance.
    Balance {
        user: String,
    },
    /// Add credits to a user's balance.
    Grant {
        user: String,
        amount: Credits,
    },
    /// Print an operation record as JSON.
    Operation {
        id: String,
    },
    /// Run one reconciliation sweep.
    Reconcile,
    /// Run one retry driver poll.
    Drive,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => metered_config::load_and_validate_path(path),
        None => metered_config::load_and_validate(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            metered_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    serve::init_tracing(&config.service.log_level);

    let outcome = match cli.command {
        Commands::Serve => serve::run_serve(config).await.map(|()| None),
        Commands::Balance { user } => commands::balance(&config, &user).await.map(Some),
        Commands::Grant { user, amount } => {
            commands::grant(&config, &user, amount).await.map(Some)
        }
        Commands::Operation { id } => commands::operation(&config, &id).await.map(Some),
        Commands::Reconcile => commands::reconcile(&config).await.map(Some),
        Commands::Drive => commands::drive(&config).await.map(Some),
    };

    match outcome {
        Ok(Some(output)) => println!("{output}"),
        Ok(None) => {}
        Err(e) => {
            eprintln!("metered: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn grant_parses_amount() {
        let cli = Cli::try_parse_from(["metered", "grant", "alice", "50"]).unwrap();
        match cli.command {
            Commands::Grant { user, amount } => {
                assert_eq!(user, "alice");
                assert_eq!(amount, 50);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn negative_grant_is_rejected() {
        assert!(Cli::try_parse_from(["metered", "grant", "alice", "-5"]).is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli =
            Cli::try_parse_from(["metered", "reconcile", "--config", "/tmp/m.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/m.toml")));
        assert!(matches!(cli.command, Commands::Reconcile));
    }
}
