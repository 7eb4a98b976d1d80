//! Durable workflow execution core.
//!
//! A workflow here is ordinary Rust code living *outside* this crate. The
//! driver obtains an [`Orchestration`] handle from the
//! [`OrchestrationFactory`] and issues operations in program order: compute
//! tasks, REST calls, durable timers, external event waits. Every operation
//! is both a live call and a replay point. Results are appended to an
//! append-only per-instance history; when the same workflow is re-entered
//! (process restart, repeated invocation), completed call sites are answered
//! straight from history and the external world is never touched again.
//!
//! Call sites are identified by caller-supplied correlation ids, so the same
//! logical step must be issued with the same correlation and input on every
//! run. A mismatch is reported as a nondeterminism error rather than silently
//! double-executing a side effect.
//!
//! ```no_run
//! use bizflow::{FactoryConfig, OrchestrationFactory, ActivityRegistry};
//! use bizflow::providers::in_memory::InMemoryHistoryStore;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), bizflow::OrchestrationError> {
//! let activities = ActivityRegistry::builder()
//!     .register("Sum", |input: String| async move { Ok(input) })
//!     .build();
//! let factory = OrchestrationFactory::new(
//!     FactoryConfig::local(),
//!     Arc::new(InMemoryHistoryStore::default()),
//!     activities,
//! )?;
//! let wf = factory.create_orchestration("SequenceWorkFlow").await?;
//! wf.start_workflow("begin").await?;
//! let sum: String = wf.call_task_raw("Sum", "1,2", "Operation1").await?;
//! wf.complete_workflow(&sum).await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod factory;
pub mod http;
pub mod providers;
pub mod registry;
pub mod timers;

pub use dispatcher::{RetryPolicy, TaskDispatcher};
pub use error::{ActivityError, OrchestrationError};
pub use events::EventHub;
pub use executor::{Orchestration, WorkflowState, WorkflowStatus};
pub use factory::{FactoryConfig, OrchestrationFactory};
pub use http::{HttpInvoker, HttpMethod, HttpResponse};
pub use providers::{HistoryStore, StoreError};
pub use registry::{ActivityHandler, ActivityRegistry};
pub use timers::TimerService;

/// Typed payload codec used at all typed API seams. Payloads are stored as
/// strings in history; a JSON string value encodes to its raw content so that
/// plain-string activities and typed activities interoperate.
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(_) => {
                // Fallback: treat the raw string as a JSON string value
                let val = Value::String(s.to_string());
                serde_json::from_value(val).map_err(|e| e.to_string())
            }
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One appended history record. `seq` is assigned by the store and is
/// strictly increasing per instance; records are immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub seq: u64,
    pub ts_ms: u64,
    pub kind: EventKind,
}

/// Append-only history entries persisted by a provider and consumed during
/// replay. Scheduling entries pair with their completions via stable
/// caller-supplied correlation ids (tasks), timer names, or event names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// Workflow logically began. Appended once per instance.
    WorkflowStarted { note: String },
    /// A task (compute activity or HTTP step) was handed to its invoker.
    TaskScheduled {
        correlation: String,
        name: String,
        input: String,
    },
    /// The task identified by `correlation` produced a result.
    TaskCompleted { correlation: String, result: String },
    /// The task identified by `correlation` failed after retries exhausted.
    TaskFailed { correlation: String, error: String },
    /// A durable timer was created; `fire_at_ms` is absolute wall-clock.
    TimerCreated { name: String, fire_at_ms: u64 },
    /// The named timer's deadline elapsed.
    TimerFired { name: String, fire_at_ms: u64 },
    /// An external event was delivered to a waiting (or replayed) call site.
    EventReceived { name: String, payload: String },
    /// Terminal success.
    WorkflowCompleted { output: String },
    /// Terminal failure.
    WorkflowFailed { error: String },
}

impl EventKind {
    /// Terminal events close the instance; the store rejects appends after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. }
        )
    }
}
