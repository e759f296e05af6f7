// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of nc-updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Nextcloud Updater - command line driver
//!
//! Every invocation runs at most one operation and prints its outcome as JSON
//! on stdout. Logs go to stderr.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use nc_updater::{Step, StepOutcome, Updater, UpdaterOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "nc-updater")]
#[command(author, version, about = "Step-wise in-place upgrade of a Nextcloud installation")]
#[command(
    long_about = "Upgrades the installation at --root in nine steps.\n\
    \nStep 1 acquires a lease and prints its owner token to stderr; pass it with\n\
    --owner (or NC_UPDATER_OWNER) to every later step.\n\
    \nExamples:\n  \
    nc-updater status\n  \
    nc-updater step 1\n  \
    nc-updater step 2 --owner <uuid>\n  \
    nc-updater run\n  \
    nc-updater resume --owner <uuid>"
)]
struct Cli {
    /// Install root of the instance to upgrade
    #[arg(long, global = true, env = "NC_UPDATER_ROOT", default_value = ".")]
    root: PathBuf,

    /// Timeout for the update server query and download connection (seconds)
    #[arg(long, global = true, env = "NC_UPDATER_HTTP_TIMEOUT", default_value_t = 30)]
    http_timeout: u64,

    /// Seconds after which an unrenewed lease may be taken over
    #[arg(long, global = true, env = "NC_UPDATER_LEASE_TTL", default_value_t = 86_400)]
    lease_ttl: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct OwnerArg {
    /// Lease owner token printed by step 1
    #[arg(long, env = "NC_UPDATER_OWNER")]
    owner: Option<Uuid>,
}

#[derive(Subcommand)]
enum Command {
    /// Show the installed version, the update server's offer and the lease
    Status,

    /// Run a single step (1-9)
    Step {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=9))]
        number: u8,

        #[command(flatten)]
        owner: OwnerArg,
    },

    /// Run every remaining step in order, stopping at the first failure
    Run {
        #[command(flatten)]
        owner: OwnerArg,
    },

    /// Finish an upgrade interrupted after the entry points were stubbed
    Resume {
        #[command(flatten)]
        owner: OwnerArg,
    },

    /// Release the lease without finishing the upgrade
    Abort {
        #[command(flatten)]
        owner: OwnerArg,

        /// Release a foreign lease or one with stubbed entry points
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nc_updater=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let options = UpdaterOptions {
        http_timeout_secs: cli.http_timeout,
        lease_ttl_secs: cli.lease_ttl,
    };
    let updater = Updater::new(&cli.root, options)
        .with_context(|| format!("could not load installation at {}", cli.root.display()))?;

    let outcome = match cli.command {
        Command::Status => return status(&updater).await,
        Command::Step { number, owner } => {
            let step = Step::from_number(number)
                .with_context(|| format!("invalid step number: {number}"))?;
            let updater = with_owner(updater, &owner);
            let outcome = updater.run_step(step).await;
            if step == Step::CheckExpectedFiles && outcome.proceed {
                announce_owner(&updater);
            }
            outcome
        }
        Command::Run { owner } => {
            let updater = with_owner(updater, &owner);
            announce_owner(&updater);
            let result = updater.run_remaining().await;
            if let Ok(steps) = &result {
                info!("Completed steps {steps:?}");
            }
            StepOutcome::from(result.map(|_| ()))
        }
        Command::Resume { owner } => {
            let updater = with_owner(updater, &owner);
            StepOutcome::from(updater.resume().await.map(|_| ()))
        }
        Command::Abort { owner, force } => {
            StepOutcome::from(with_owner(updater, &owner).abort(force))
        }
    };

    println!("{}", serde_json::to_string(&outcome)?);
    Ok(if outcome.proceed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn with_owner(updater: Updater, owner: &OwnerArg) -> Updater {
    match owner.owner {
        Some(owner) => updater.with_owner(owner),
        None => updater,
    }
}

fn announce_owner(updater: &Updater) {
    eprintln!("Lease owner: {}", updater.owner());
}

async fn status(updater: &Updater) -> anyhow::Result<ExitCode> {
    let lease = updater.lease()?;
    let stage = updater.stage()?;

    let (update, proceed) = match updater.check_for_update().await {
        Ok(status) => (status.text, true),
        Err(e) => (format!("Could not check for updates: {e}"), false),
    };

    let report = serde_json::json!({
        "installedVersion": updater.installed_version(),
        "update": update,
        "stage": format!("{stage:?}"),
        "lease": lease,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if proceed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
