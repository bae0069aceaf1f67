//! Stage handlers for the answer pipeline.
//!
//! A handler turns one consumed event into a [`StageOutcome`]. It must not
//! write anything itself: the worker applies the returned effect, the derived
//! events and the stage record's success in one transaction.

pub mod analysis;
pub mod embedding;
pub mod profile_update;

pub use analysis::AnalysisHandler;
pub use embedding::EmbeddingHandler;
pub use profile_update::ProfileUpdateHandler;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Event, StageName, StageOutcome};

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageName;

    async fn handle(&self, event: &Event) -> DomainResult<StageOutcome>;
}

/// Outcome for an event this stage has no business with.
pub(crate) fn unexpected(stage: StageName, event: &Event) -> StageOutcome {
    tracing::debug!(
        stage = %stage,
        event_id = %event.id,
        event_type = event.payload.event_type(),
        "skipping event this stage does not handle"
    );
    StageOutcome::Skipped(format!(
        "{} does not handle {} events",
        stage,
        event.payload.event_type()
    ))
}
