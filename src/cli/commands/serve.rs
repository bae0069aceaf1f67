//! Implementation of the `portrait serve` command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::watch;

use super::open_database;
use crate::adapters::corpus::InMemoryQuestionCorpus;
use crate::adapters::embeddings::HashingEmbeddingProvider;
use crate::adapters::oracle::create_oracle;
use crate::adapters::transport::create_transport;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::{Pipeline, PipelineDeps, TracingAlertSink};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Oracle backend to use instead of the configured one (http, mock)
    #[arg(long)]
    pub oracle: Option<String>,

    /// Transport backend to use instead of the configured one (sqlite, memory)
    #[arg(long)]
    pub transport: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ServeOutput {
    pub stopped: bool,
    pub workers: usize,
    pub pending_at_shutdown: u64,
}

impl CommandOutput for ServeOutput {
    fn to_human(&self) -> String {
        format!(
            "Pipeline stopped ({} workers). {} outbox record(s) still pending.",
            self.workers, self.pending_at_shutdown
        )
    }
}

pub async fn execute(args: ServeArgs, mut config: Config, json_mode: bool) -> Result<()> {
    if let Some(backend) = args.oracle {
        config.oracle.backend = backend;
    }
    if let Some(backend) = args.transport {
        config.transport.backend = backend;
    }

    let pool = open_database(&config).await?;
    let transport = create_transport(&config.transport, &pool).context("Failed to create transport")?;
    let oracle = create_oracle(&config.oracle).context("Failed to create scoring oracle")?;
    let corpus = InMemoryQuestionCorpus::load(&config.corpus.path).context("Failed to load question corpus")?;

    let pipeline = Pipeline::build(
        &config,
        pool,
        PipelineDeps {
            transport,
            oracle,
            embedder: Arc::new(HashingEmbeddingProvider::default()),
            corpus: Arc::new(corpus),
            alerts: Arc::new(TracingAlertSink),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c, stopping"),
        }
        let _ = shutdown_tx.send(true);
    });

    pipeline.run(shutdown_rx).await;

    let output_data = ServeOutput {
        stopped: true,
        workers: pipeline.workers.len(),
        pending_at_shutdown: pipeline.relay.pending_count().await.unwrap_or_default(),
    };
    output(&output_data, json_mode);
    Ok(())
}
