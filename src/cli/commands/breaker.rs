//! Breaker CLI commands: a manual override a running `serve` picks up.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::open_database;
use crate::adapters::sqlite::SqliteControlFlags;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::circuit_breaker::BREAKER_OVERRIDE_FLAG;
use crate::services::BreakerOverride;

#[derive(Args, Debug)]
pub struct BreakerArgs {
    #[command(subcommand)]
    pub command: BreakerCommands,
}

#[derive(Subcommand, Debug)]
pub enum BreakerCommands {
    /// Force the breaker open: no oracle calls until released
    Open,
    /// Force the breaker closed, ignoring failures
    Close,
    /// Return the breaker to automatic operation
    Auto,
    /// Show the persisted override
    Status,
}

#[derive(Debug, serde::Serialize)]
pub struct BreakerOutput {
    #[serde(rename = "override")]
    pub override_mode: BreakerOverride,
    pub changed: bool,
}

impl CommandOutput for BreakerOutput {
    fn to_human(&self) -> String {
        let mode = match self.override_mode {
            BreakerOverride::Auto => "automatic",
            BreakerOverride::ForcedOpen => "forced open",
            BreakerOverride::ForcedClosed => "forced closed",
        };
        if self.changed {
            format!("Breaker override set to {mode}. A running server applies it within a second.")
        } else {
            format!("Breaker override: {mode}")
        }
    }
}

pub async fn execute(args: BreakerArgs, config: Config, json_mode: bool) -> Result<()> {
    let pool = open_database(&config).await?;
    let flags = SqliteControlFlags::new(pool);

    let (override_mode, changed) = match args.command {
        BreakerCommands::Open => (BreakerOverride::ForcedOpen, true),
        BreakerCommands::Close => (BreakerOverride::ForcedClosed, true),
        BreakerCommands::Auto => (BreakerOverride::Auto, true),
        BreakerCommands::Status => {
            let stored = flags.get(BREAKER_OVERRIDE_FLAG).await?;
            let mode = stored
                .as_deref()
                .and_then(BreakerOverride::from_str)
                .unwrap_or(BreakerOverride::Auto);
            (mode, false)
        }
    };

    if changed {
        match override_mode {
            BreakerOverride::Auto => flags.clear(BREAKER_OVERRIDE_FLAG).await,
            mode => flags.set(BREAKER_OVERRIDE_FLAG, mode.as_str()).await,
        }
        .context("Failed to store breaker override")?;
    }

    output(&BreakerOutput { override_mode, changed }, json_mode);
    Ok(())
}
