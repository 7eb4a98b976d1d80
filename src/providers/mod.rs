//! History providers: durable append-only event logs, one per workflow
//! instance. The store is the single source of truth for replay; everything
//! else in the crate is rebuildable from it.

use async_trait::async_trait;

use crate::{EventKind, HistoryEvent};

mod error;
pub mod fs;
pub mod in_memory;

pub use error::StoreError;

/// Pluggable history store.
///
/// Contract:
/// - `append` assigns strictly increasing `seq` values (per instance) and a
///   wall-clock timestamp to each event, atomically for the whole batch.
/// - Appends to an unknown instance are permanent errors; callers create
///   instances explicitly.
/// - Once a terminal event (`WorkflowCompleted`/`WorkflowFailed`) is in the
///   log, further appends are permanent errors; within a batch, nothing may
///   follow a terminal event.
/// - Implementations serialize appends per instance.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history for an instance, in seq order. Unknown instances read
    /// as empty.
    async fn read(&self, instance: &str) -> Vec<HistoryEvent>;

    /// Append a batch of events, returning them with assigned seq/timestamp.
    async fn append(
        &self,
        instance: &str,
        events: Vec<EventKind>,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Create an instance with an empty log. Returns false if it already
    /// existed (not an error; creation is idempotent).
    async fn create_instance(&self, instance: &str) -> Result<bool, StoreError>;

    /// All known instance ids, unordered.
    async fn list_instances(&self) -> Vec<String>;

    /// Drop all instances and their histories. Test support.
    async fn reset(&self);

    /// Human-readable dump of every instance's history, for debugging.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for instance in self.list_instances().await {
            out.push_str(&format!("=== {instance} ===\n"));
            for e in self.read(&instance).await {
                out.push_str(&format!("  [{:>4}] {:?}\n", e.seq, e.kind));
            }
        }
        out
    }
}

/// Shared append-side validation: terminal logs accept nothing further, and
/// a terminal event must be the last thing in its own batch. Together these
/// keep every log at exactly one terminal event.
pub(crate) fn check_appendable(
    history: &[HistoryEvent],
    batch: &[EventKind],
) -> Result<(), StoreError> {
    if history.last().is_some_and(|e| e.kind.is_terminal()) {
        return Err(StoreError::permanent(
            "append",
            "history is terminal; no further events accepted",
        ));
    }
    if let Some(pos) = batch.iter().position(EventKind::is_terminal) {
        if pos + 1 != batch.len() {
            return Err(StoreError::permanent(
                "append",
                "terminal event must be the last in an append batch",
            ));
        }
    }
    Ok(())
}
