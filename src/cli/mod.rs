//! Command-line interface for the `portrait` binary.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::breaker::BreakerArgs;
use commands::init::InitArgs;
use commands::outbox::OutboxArgs;
use commands::serve::ServeArgs;
use commands::stage::StageArgs;

#[derive(Parser, Debug)]
#[command(name = "portrait", version, about = "Answer-to-profile pipeline with adaptive question routing")]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to the .portrait hierarchy)
    #[arg(long, global = true, env = "PORTRAIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the project directory, config, corpus and database
    Init(InitArgs),
    /// Run the relay, stage workers, retry coordinator and health reporter
    Serve(ServeArgs),
    /// Inspect and maintain the transactional outbox
    Outbox(OutboxArgs),
    /// Inspect failed stage work and replay it
    Stage(StageArgs),
    /// Override or inspect the oracle circuit breaker
    Breaker(BreakerArgs),
    /// Print a pipeline health snapshot
    Health,
}

/// Report a command failure on stderr (or as JSON on stdout) and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "causes": chain,
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err}");
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["portrait", "health", "--json", "--config", "custom.yaml"]);
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
        assert!(matches!(cli.command, Commands::Health));
    }

    #[test]
    fn test_stage_replay_parses() {
        let cli = Cli::parse_from([
            "portrait",
            "stage",
            "replay",
            "--all",
        ]);
        assert!(matches!(cli.command, Commands::Stage(_)));
    }
}
