//! Implementation of the `portrait health` command.

use anyhow::{Context, Result};

use super::open_database;
use crate::adapters::sqlite::SqliteControlFlags;
use crate::cli::output::{output, table, CommandOutput};
use crate::domain::models::Config;
use crate::services::circuit_breaker::BREAKER_OVERRIDE_FLAG;
use crate::services::{BreakerOverride, HealthMonitor, HealthSnapshot};

#[derive(Debug, serde::Serialize)]
pub struct HealthOutput {
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
    /// The live breaker state belongs to the serving process; this is the
    /// persisted operator override.
    pub breaker_override: BreakerOverride,
}

impl CommandOutput for HealthOutput {
    fn to_human(&self) -> String {
        let h = &self.snapshot;
        let mut t = table(&["Metric", "Value"]);
        t.add_row(vec!["Pending outbox records".to_string(), h.pending_count.to_string()]);
        t.add_row(vec!["Unpublishable outbox records".to_string(), h.failed_outbox.to_string()]);
        t.add_row(vec!["Stage failure rate (15m)".to_string(), format!("{:.1}%", h.failure_rate * 100.0)]);
        t.add_row(vec!["Terminal stage failures".to_string(), h.terminal_failures.to_string()]);
        t.add_row(vec!["Breaker override".to_string(), self.breaker_override.as_str().to_string()]);
        for (level, count) in &h.fatigue_distribution {
            t.add_row(vec![format!("Sessions at {} fatigue", level.as_str()), count.to_string()]);
        }
        format!("Pipeline health at {}\n{t}", h.taken_at.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

pub async fn execute(config: Config, json_mode: bool) -> Result<()> {
    let pool = open_database(&config).await?;
    let flags = SqliteControlFlags::new(pool.clone());

    let snapshot = HealthMonitor::new(pool, None)
        .snapshot()
        .await
        .context("Failed to collect health snapshot")?;
    let breaker_override = flags
        .get(BREAKER_OVERRIDE_FLAG)
        .await?
        .as_deref()
        .and_then(BreakerOverride::from_str)
        .unwrap_or_default();

    output(
        &HealthOutput {
            snapshot,
            breaker_override,
        },
        json_mode,
    );
    Ok(())
}
