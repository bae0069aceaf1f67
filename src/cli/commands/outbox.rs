//! Outbox CLI commands: inspect undelivered records and purge old ones.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};

use super::open_database;
use crate::adapters::sqlite::SqliteOutboxRepository;
use crate::cli::output::{output, short_id, table, truncate, CommandOutput};
use crate::domain::models::{Config, OutboxRecord, OutboxStatus};

#[derive(Args, Debug)]
pub struct OutboxArgs {
    #[command(subcommand)]
    pub command: OutboxCommands,
}

#[derive(Subcommand, Debug)]
pub enum OutboxCommands {
    /// List records not yet handed to the transport
    Pending {
        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Show records that can never be published instead
        #[arg(long)]
        failed: bool,
    },
    /// Delete published records every consuming stage has finished with
    Purge {
        /// Retention in hours (defaults to relay.retention_hours)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct OutboxListOutput {
    pub status: OutboxStatus,
    pub total: u64,
    pub records: Vec<OutboxRecord>,
}

impl CommandOutput for OutboxListOutput {
    fn to_human(&self) -> String {
        if self.records.is_empty() {
            return format!("No {} outbox records.", self.status.as_str());
        }
        let mut t = table(&["Seq", "Event", "Type", "Stream key", "Attempts", "Created", "Last error"]);
        for record in &self.records {
            t.add_row(vec![
                record.sequence.to_string(),
                short_id(&record.event.id),
                record.event.payload.event_type().to_string(),
                short_id(&record.event.partition_key),
                record.attempts.to_string(),
                record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                truncate(record.last_error.as_deref().unwrap_or("-"), 40),
            ]);
        }
        format!(
            "{t}\n\nShowing {} of {} {} record(s)",
            self.records.len(),
            self.total,
            self.status.as_str()
        )
    }
}

#[derive(Debug, serde::Serialize)]
pub struct PurgeOutput {
    pub purged: u64,
    pub retention_hours: u64,
}

impl CommandOutput for PurgeOutput {
    fn to_human(&self) -> String {
        format!(
            "Purged {} published record(s) older than {}h.",
            self.purged, self.retention_hours
        )
    }
}

pub async fn execute(args: OutboxArgs, config: Config, json_mode: bool) -> Result<()> {
    let pool = open_database(&config).await?;
    let outbox = SqliteOutboxRepository::new(pool);

    match args.command {
        OutboxCommands::Pending { limit, failed } => {
            let status = if failed { OutboxStatus::Failed } else { OutboxStatus::Pending };
            let records = outbox
                .list(Some(status), limit)
                .await
                .context("Failed to list outbox records")?;
            let total = outbox.count_by_status(status).await?;
            output(&OutboxListOutput { status, total, records }, json_mode);
        }
        OutboxCommands::Purge { older_than_hours } => {
            let retention_hours = older_than_hours.unwrap_or(config.relay.retention_hours);
            let hours = i64::try_from(retention_hours).context("Retention is too large")?;
            let purged = outbox
                .purge_published(Utc::now() - chrono::Duration::hours(hours))
                .await
                .context("Failed to purge outbox")?;
            output(&PurgeOutput { purged, retention_hours }, json_mode);
        }
    }
    Ok(())
}
