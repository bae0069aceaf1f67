//! Portrait CLI entry point.

use clap::Parser;

use portrait::cli::{handle_error, Cli, Commands};
use portrait::infrastructure::config::ConfigLoader;
use portrait::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let config = match ConfigLoader::load_optional(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => handle_error(err, json),
    };
    let _logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, json),
    };

    let result = match cli.command {
        Commands::Init(args) => portrait::cli::commands::init::execute(args, json).await,
        Commands::Serve(args) => portrait::cli::commands::serve::execute(args, config, json).await,
        Commands::Outbox(args) => portrait::cli::commands::outbox::execute(args, config, json).await,
        Commands::Stage(args) => portrait::cli::commands::stage::execute(args, config, json).await,
        Commands::Breaker(args) => portrait::cli::commands::breaker::execute(args, config, json).await,
        Commands::Health => portrait::cli::commands::health::execute(config, json).await,
    };

    if let Err(err) = result {
        handle_error(err, json);
    }
}
