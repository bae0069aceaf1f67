//! Stage CLI commands: failed work and operator replay.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use uuid::Uuid;

use super::open_database;
use crate::adapters::sqlite::SqliteStageRepository;
use crate::cli::output::{output, short_id, table, truncate, CommandOutput};
use crate::domain::models::{Config, EventId, StageName, StageRecord};
use crate::services::{RetryCoordinator, TracingAlertSink};

#[derive(Args, Debug)]
pub struct StageArgs {
    #[command(subcommand)]
    pub command: StageCommands,
}

#[derive(Subcommand, Debug)]
pub enum StageCommands {
    /// List failed stage records
    Failures {
        /// Only records that will not be retried automatically
        #[arg(long)]
        terminal: bool,
        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Requeue terminally failed work
    Replay {
        /// Event id of the failed record
        #[arg(required_unless_present = "all")]
        event_id: Option<Uuid>,
        /// Stage to replay (analysis, embedding, profile_update)
        #[arg(long, required_unless_present = "all")]
        stage: Option<String>,
        /// Replay every terminal failure
        #[arg(long, conflicts_with_all = ["event_id", "stage"])]
        all: bool,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct FailuresOutput {
    pub terminal_only: bool,
    pub records: Vec<StageRecord>,
}

impl CommandOutput for FailuresOutput {
    fn to_human(&self) -> String {
        if self.records.is_empty() {
            return "No failed stage records.".to_string();
        }
        let mut t = table(&["Event", "Stage", "Retries", "Terminal", "Kind", "Last attempt", "Error"]);
        for record in &self.records {
            t.add_row(vec![
                short_id(&record.event_id),
                record.stage.as_str().to_string(),
                record.retry_count.to_string(),
                if record.terminal { "yes" } else { "no" }.to_string(),
                record.error_kind.map_or("-", |k| k.as_str()).to_string(),
                record
                    .last_attempt_at
                    .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
                truncate(record.last_error.as_deref().unwrap_or("-"), 48),
            ]);
        }
        format!("{t}\n\n{} record(s)", self.records.len())
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ReplayOutput {
    pub replayed: usize,
}

impl CommandOutput for ReplayOutput {
    fn to_human(&self) -> String {
        format!("Requeued {} stage record(s).", self.replayed)
    }
}

pub async fn execute(args: StageArgs, config: Config, json_mode: bool) -> Result<()> {
    let pool = open_database(&config).await?;

    match args.command {
        StageCommands::Failures { terminal, limit } => {
            let records = SqliteStageRepository::new(pool)
                .list_failures(terminal, limit)
                .await
                .context("Failed to list stage failures")?;
            output(
                &FailuresOutput {
                    terminal_only: terminal,
                    records,
                },
                json_mode,
            );
        }
        StageCommands::Replay { event_id, stage, all } => {
            let coordinator = RetryCoordinator::new(pool, &config.retry, Arc::new(TracingAlertSink));
            let replayed = if all {
                coordinator.force_replay_all().await.context("Failed to replay terminal failures")?
            } else {
                let (Some(event_id), Some(stage)) = (event_id, stage) else {
                    bail!("replay needs an event id and --stage, or --all");
                };
                let Some(stage) = StageName::from_str(&stage) else {
                    bail!("unknown stage: {stage}");
                };
                coordinator
                    .force_replay(EventId(event_id), stage)
                    .await
                    .with_context(|| format!("Failed to replay {event_id} at {}", stage.as_str()))?;
                1
            };
            output(&ReplayOutput { replayed }, json_mode);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DatabaseConfig;

    fn config_in(dir: &tempfile::TempDir) -> Config {
        Config {
            database: DatabaseConfig {
                path: dir.path().join("portrait.db").display().to_string(),
                ..DatabaseConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_replay_of_unknown_event_reports_the_event() {
        let dir = tempfile::tempdir().unwrap();
        let event_id = Uuid::new_v4();
        let args = StageArgs {
            command: StageCommands::Replay {
                event_id: Some(event_id),
                stage: Some("analysis".to_string()),
                all: false,
            },
        };

        let err = execute(args, config_in(&dir), true).await.unwrap_err();
        assert!(err.to_string().contains(&event_id.to_string()), "got {err:#}");
    }

    #[tokio::test]
    async fn test_replay_rejects_unknown_stage() {
        let dir = tempfile::tempdir().unwrap();
        let args = StageArgs {
            command: StageCommands::Replay {
                event_id: Some(Uuid::new_v4()),
                stage: Some("scoring".to_string()),
                all: false,
            },
        };

        let err = execute(args, config_in(&dir), true).await.unwrap_err();
        assert!(err.to_string().contains("unknown stage"));
    }

    #[tokio::test]
    async fn test_replay_all_on_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let args = StageArgs {
            command: StageCommands::Replay {
                event_id: None,
                stage: None,
                all: true,
            },
        };
        execute(args, config_in(&dir), true).await.unwrap();
    }
}
