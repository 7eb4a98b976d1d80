//! The orchestration handle: per-instance executor with a replay gate.
//!
//! Every operation consults the history mirror before touching the outside
//! world. A call site whose completion is already recorded is answered from
//! history; a fresh call site executes, and its outcome is appended before
//! control returns to the driver. All handles for one instance share a
//! single mirror and its async mutex (the factory memoizes it), so the
//! instance has one logical thread no matter how many handles exist.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::dispatcher::TaskDispatcher;
use crate::error::OrchestrationError;
use crate::events::EventHub;
use crate::http::{HttpInvoker, HttpMethod, HttpResponse};
use crate::providers::{HistoryStore, StoreError};
use crate::timers::TimerService;
use crate::{codec, now_ms, EventKind, HistoryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// Point-in-time view of an instance, cheap to read at any moment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
}

impl WorkflowState {
    fn derive(history: &[HistoryEvent]) -> Self {
        match history.last().map(|e| &e.kind) {
            Some(EventKind::WorkflowCompleted { output }) => WorkflowState {
                status: WorkflowStatus::Completed,
                last_result: Some(output.clone()),
                last_error: None,
            },
            Some(EventKind::WorkflowFailed { error }) => WorkflowState {
                status: WorkflowStatus::Failed,
                last_result: None,
                last_error: Some(error.clone()),
            },
            Some(_) => WorkflowState {
                status: WorkflowStatus::Running,
                last_result: None,
                last_error: None,
            },
            None => WorkflowState {
                status: WorkflowStatus::Created,
                last_result: None,
                last_error: None,
            },
        }
    }
}

/// Per-instance shared state: the history mirror behind the async mutex
/// that serializes all operations, plus the sync snapshot for
/// `current_state`. One cell exists per instance per factory; every handle
/// for that instance holds the same cell.
pub(crate) struct InstanceCell {
    history: tokio::sync::Mutex<Vec<HistoryEvent>>,
    snapshot: std::sync::Mutex<WorkflowState>,
}

impl InstanceCell {
    pub(crate) fn new(history: Vec<HistoryEvent>) -> Self {
        let snapshot = WorkflowState::derive(&history);
        Self {
            history: tokio::sync::Mutex::new(history),
            snapshot: std::sync::Mutex::new(snapshot),
        }
    }

    fn snapshot(&self) -> WorkflowState {
        match self.snapshot.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_snapshot(&self, state: WorkflowState) {
        match self.snapshot.lock() {
            Ok(mut g) => *g = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// What the replay gate decided for a task correlation id.
enum TaskGate {
    /// No record; schedule and execute.
    Fresh,
    /// Scheduled but unresolved (crash window); execute without re-appending
    /// the schedule record.
    Rerun,
    /// Recorded completion payload.
    Completed(String),
    /// Recorded terminal failure.
    Failed(String),
}

/// Look up `correlation` in history and validate the live call against the
/// recorded schedule. Any recorded schedule whose name or input disagrees
/// with the live call is nondeterminism, resolved or not.
fn replay_gate(
    history: &[HistoryEvent],
    correlation: &str,
    name: &str,
    input: &str,
) -> Result<TaskGate, OrchestrationError> {
    let mut scheduled: Option<(&str, &str)> = None;
    let mut outcome: Option<Result<&str, &str>> = None;
    for e in history {
        match &e.kind {
            EventKind::TaskScheduled {
                correlation: c,
                name: n,
                input: i,
            } if c == correlation => scheduled = Some((n, i)),
            EventKind::TaskCompleted { correlation: c, result } if c == correlation => {
                outcome = Some(Ok(result));
            }
            EventKind::TaskFailed { correlation: c, error } if c == correlation => {
                outcome = Some(Err(error));
            }
            _ => {}
        }
    }
    if let Some((recorded_name, recorded_input)) = scheduled {
        if recorded_name != name || recorded_input != input {
            return Err(OrchestrationError::nondeterminism(format!(
                "correlation '{correlation}' recorded as {recorded_name}({recorded_input}), now called as {name}({input})"
            )));
        }
    }
    Ok(match outcome {
        Some(Ok(result)) => TaskGate::Completed(result.to_string()),
        Some(Err(error)) => TaskGate::Failed(error.to_string()),
        None if scheduled.is_some() => TaskGate::Rerun,
        None => TaskGate::Fresh,
    })
}

/// Handle to one workflow instance. Obtained from the factory; shared
/// collaborators (store, dispatcher, invoker, timers, events) and the
/// instance cell are owned by the factory and reused across handles. Only
/// the event-consumption cursor is handle-local: each handle represents one
/// logical run of the driver, and a fresh run replays recorded events from
/// the beginning.
pub struct Orchestration {
    workflow: String,
    instance: String,
    store: Arc<dyn HistoryStore>,
    tasks: Arc<TaskDispatcher>,
    http: Arc<HttpInvoker>,
    timers: Arc<TimerService>,
    events: Arc<EventHub>,
    cell: Arc<InstanceCell>,
    consumed: std::sync::Mutex<HashMap<String, usize>>,
}

impl Orchestration {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workflow: String,
        instance: String,
        cell: Arc<InstanceCell>,
        store: Arc<dyn HistoryStore>,
        tasks: Arc<TaskDispatcher>,
        http: Arc<HttpInvoker>,
        timers: Arc<TimerService>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            workflow,
            instance,
            store,
            tasks,
            http,
            timers,
            events,
            cell,
            consumed: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Current status snapshot. Synchronous and non-blocking; safe to call
    /// from outside the workflow's logical thread.
    pub fn current_state(&self) -> WorkflowState {
        self.cell.snapshot()
    }

    /// Copy of the full history, mainly for assertions and diagnostics.
    pub async fn history(&self) -> Vec<HistoryEvent> {
        self.cell.history.lock().await.clone()
    }

    fn consumed_count(&self, name: &str) -> usize {
        match self.consumed.lock() {
            Ok(g) => *g.get(name).unwrap_or(&0),
            Err(poisoned) => *poisoned.into_inner().get(name).unwrap_or(&0),
        }
    }

    fn set_consumed(&self, name: &str, count: usize) {
        match self.consumed.lock() {
            Ok(mut g) => {
                g.insert(name.to_string(), count);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name.to_string(), count);
            }
        }
    }

    async fn append(
        &self,
        history: &mut Vec<HistoryEvent>,
        kind: EventKind,
    ) -> Result<HistoryEvent, OrchestrationError> {
        let mut appended = self.store.append(&self.instance, vec![kind]).await?;
        let e = appended.pop().ok_or_else(|| {
            OrchestrationError::Store(StoreError::permanent("append", "empty append result"))
        })?;
        history.push(e.clone());
        self.cell.set_snapshot(WorkflowState::derive(history));
        Ok(e)
    }

    /// Mark the workflow as started. Idempotent: on replay the recorded
    /// start is accepted regardless of `note`.
    pub async fn start_workflow(&self, note: impl Into<String>) -> Result<(), OrchestrationError> {
        let mut history = self.cell.history.lock().await;
        if history
            .iter()
            .any(|e| matches!(e.kind, EventKind::WorkflowStarted { .. }))
        {
            debug!(instance = %self.instance, "start replayed from history");
            return Ok(());
        }
        info!(instance = %self.instance, workflow = %self.workflow, "workflow started");
        self.append(&mut history, EventKind::WorkflowStarted { note: note.into() })
            .await?;
        Ok(())
    }

    /// Schedule-or-replay a compute task. The correlation id names the call
    /// site; it must carry the same task name and input on every run.
    pub async fn call_task_raw(
        &self,
        name: &str,
        input: impl Into<String>,
        correlation: &str,
    ) -> Result<String, OrchestrationError> {
        let input = input.into();
        let mut history = self.cell.history.lock().await;
        match replay_gate(&history, correlation, name, &input)? {
            TaskGate::Completed(result) => {
                debug!(instance = %self.instance, correlation, "task replayed from history");
                return Ok(result);
            }
            TaskGate::Failed(error) => {
                return Err(OrchestrationError::ActivityFailed {
                    correlation: correlation.to_string(),
                    error,
                });
            }
            TaskGate::Rerun => {
                warn!(instance = %self.instance, correlation, task = name, "unresolved scheduled task; re-dispatching");
            }
            TaskGate::Fresh => {
                self.ensure_live(&history, "call_task")?;
                self.append(
                    &mut history,
                    EventKind::TaskScheduled {
                        correlation: correlation.to_string(),
                        name: name.to_string(),
                        input: input.clone(),
                    },
                )
                .await?;
            }
        }

        match self.tasks.invoke(name, &input).await {
            Ok(result) => {
                self.append(
                    &mut history,
                    EventKind::TaskCompleted {
                        correlation: correlation.to_string(),
                        result: result.clone(),
                    },
                )
                .await?;
                Ok(result)
            }
            Err(err) => {
                let error = err.to_string();
                self.append(
                    &mut history,
                    EventKind::TaskFailed {
                        correlation: correlation.to_string(),
                        error: error.clone(),
                    },
                )
                .await?;
                Err(OrchestrationError::ActivityFailed {
                    correlation: correlation.to_string(),
                    error,
                })
            }
        }
    }

    /// Typed wrapper over [`call_task_raw`](Self::call_task_raw).
    pub async fn call_task<In, Out>(
        &self,
        name: &str,
        input: &In,
        correlation: &str,
    ) -> Result<Out, OrchestrationError>
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let payload = codec::encode(input).map_err(OrchestrationError::codec)?;
        let result = self.call_task_raw(name, payload, correlation).await?;
        codec::decode(&result).map_err(OrchestrationError::codec)
    }

    pub async fn call_get_raw(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        correlation: &str,
    ) -> Result<HttpResponse, OrchestrationError> {
        self.call_http(HttpMethod::Get, url, headers, None, correlation)
            .await
    }

    pub async fn call_post_raw(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        correlation: &str,
    ) -> Result<HttpResponse, OrchestrationError> {
        self.call_http(HttpMethod::Post, url, headers, body, correlation)
            .await
    }

    pub async fn call_put_raw(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        correlation: &str,
    ) -> Result<HttpResponse, OrchestrationError> {
        self.call_http(HttpMethod::Put, url, headers, body, correlation)
            .await
    }

    pub async fn call_delete_raw(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        correlation: &str,
    ) -> Result<HttpResponse, OrchestrationError> {
        self.call_http(HttpMethod::Delete, url, headers, None, correlation)
            .await
    }

    /// Typed GET: decodes the recorded 2xx body.
    pub async fn call_get<Out: DeserializeOwned>(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        correlation: &str,
    ) -> Result<Out, OrchestrationError> {
        let resp = self.call_get_raw(url, headers, correlation).await?;
        codec::decode(&resp.body).map_err(OrchestrationError::codec)
    }

    /// Typed POST: decodes the recorded 2xx body.
    pub async fn call_post<Out: DeserializeOwned>(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        correlation: &str,
    ) -> Result<Out, OrchestrationError> {
        let resp = self.call_post_raw(url, headers, body, correlation).await?;
        codec::decode(&resp.body).map_err(OrchestrationError::codec)
    }

    /// Typed PUT: decodes the recorded 2xx body.
    pub async fn call_put<Out: DeserializeOwned>(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        correlation: &str,
    ) -> Result<Out, OrchestrationError> {
        let resp = self.call_put_raw(url, headers, body, correlation).await?;
        codec::decode(&resp.body).map_err(OrchestrationError::codec)
    }

    /// Typed DELETE: decodes the recorded 2xx body.
    pub async fn call_delete<Out: DeserializeOwned>(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        correlation: &str,
    ) -> Result<Out, OrchestrationError> {
        let resp = self.call_delete_raw(url, headers, correlation).await?;
        codec::decode(&resp.body).map_err(OrchestrationError::codec)
    }

    /// REST steps share the task replay gate; the history slot's task name
    /// is "METHOD url" and its input is the canonical request description.
    async fn call_http(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        correlation: &str,
    ) -> Result<HttpResponse, OrchestrationError> {
        let slot_name = format!("{method} {url}");
        // BTreeMap keeps header serialization order stable across runs.
        let request = serde_json::json!({ "headers": headers, "body": body }).to_string();

        let mut history = self.cell.history.lock().await;
        match replay_gate(&history, correlation, &slot_name, &request)? {
            TaskGate::Completed(result) => {
                debug!(instance = %self.instance, correlation, "http step replayed from history");
                return serde_json::from_str(&result).map_err(OrchestrationError::codec);
            }
            TaskGate::Failed(error) => {
                return Err(OrchestrationError::ActivityFailed {
                    correlation: correlation.to_string(),
                    error,
                });
            }
            TaskGate::Rerun => {
                warn!(instance = %self.instance, correlation, step = %slot_name, "unresolved http step; re-sending");
            }
            TaskGate::Fresh => {
                self.ensure_live(&history, "call_http")?;
                self.append(
                    &mut history,
                    EventKind::TaskScheduled {
                        correlation: correlation.to_string(),
                        name: slot_name.clone(),
                        input: request.clone(),
                    },
                )
                .await?;
            }
        }

        match self.http.invoke(method, url, headers, body).await {
            Ok(resp) => {
                let result = serde_json::to_string(&resp).map_err(OrchestrationError::codec)?;
                self.append(
                    &mut history,
                    EventKind::TaskCompleted {
                        correlation: correlation.to_string(),
                        result,
                    },
                )
                .await?;
                Ok(resp)
            }
            Err(err) => {
                let error = err.to_string();
                self.append(
                    &mut history,
                    EventKind::TaskFailed {
                        correlation: correlation.to_string(),
                        error: error.clone(),
                    },
                )
                .await?;
                Err(OrchestrationError::ActivityFailed {
                    correlation: correlation.to_string(),
                    error,
                })
            }
        }
    }

    /// Durable timer. On replay a fired timer returns immediately; a created
    /// but unfired timer resumes against its originally recorded deadline,
    /// firing at once when already past due.
    pub async fn start_timer(
        &self,
        name: &str,
        duration: Duration,
    ) -> Result<(), OrchestrationError> {
        let mut history = self.cell.history.lock().await;

        let mut created_at: Option<u64> = None;
        for e in history.iter() {
            match &e.kind {
                EventKind::TimerFired { name: n, .. } if n == name => {
                    debug!(instance = %self.instance, timer = name, "timer replayed from history");
                    return Ok(());
                }
                EventKind::TimerCreated { name: n, fire_at_ms } if n == name => {
                    created_at = Some(*fire_at_ms);
                }
                _ => {}
            }
        }

        let fire_at_ms = match created_at {
            Some(recorded) => recorded,
            None => {
                self.ensure_live(&history, "start_timer")?;
                let fire_at = now_ms() + duration.as_millis() as u64;
                self.append(
                    &mut history,
                    EventKind::TimerCreated {
                        name: name.to_string(),
                        fire_at_ms: fire_at,
                    },
                )
                .await?;
                fire_at
            }
        };

        if fire_at_ms > now_ms() {
            let handle = self.timers.schedule(fire_at_ms);
            handle.fired().await.map_err(|_| {
                OrchestrationError::Store(StoreError::retryable(
                    "timer_wait",
                    "timer service unavailable",
                ))
            })?;
        }
        self.append(
            &mut history,
            EventKind::TimerFired {
                name: name.to_string(),
                fire_at_ms,
            },
        )
        .await?;
        Ok(())
    }

    /// Suspend until the named external event arrives (or replay its
    /// recorded payload). Repeated waits on one name consume recorded
    /// deliveries in order.
    pub async fn wait_for_event_raw(&self, name: &str) -> Result<String, OrchestrationError> {
        let mut history = self.cell.history.lock().await;

        let cursor = self.consumed_count(name);
        let recorded: Vec<String> = history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::EventReceived { name: n, payload } if n == name => {
                    Some(payload.clone())
                }
                _ => None,
            })
            .collect();
        if let Some(payload) = recorded.get(cursor) {
            debug!(instance = %self.instance, event = name, "event replayed from history");
            self.set_consumed(name, cursor + 1);
            return Ok(payload.clone());
        }

        self.ensure_live(&history, "wait_for_event")?;
        let waiter = self.events.await_next(&self.instance, name).await;
        let payload = waiter.recv().await.map_err(|_| {
            OrchestrationError::Store(StoreError::retryable(
                "event_wait",
                "event hub unavailable",
            ))
        })?;
        self.append(
            &mut history,
            EventKind::EventReceived {
                name: name.to_string(),
                payload: payload.clone(),
            },
        )
        .await?;
        self.set_consumed(name, cursor + 1);
        Ok(payload)
    }

    /// Typed wrapper over [`wait_for_event_raw`](Self::wait_for_event_raw).
    pub async fn wait_for_event<Out: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Out, OrchestrationError> {
        let payload = self.wait_for_event_raw(name).await?;
        codec::decode(&payload).map_err(OrchestrationError::codec)
    }

    /// Terminal success. Errors with `InvalidState` if the instance already
    /// reached a terminal state.
    pub async fn complete_workflow<T: Serialize>(
        &self,
        result: &T,
    ) -> Result<(), OrchestrationError> {
        let mut history = self.cell.history.lock().await;
        let current = WorkflowState::derive(&history);
        if current.status.is_terminal() {
            return Err(OrchestrationError::InvalidState {
                operation: "complete_workflow".to_string(),
                status: current.status,
            });
        }
        let output = codec::encode(result).map_err(OrchestrationError::codec)?;
        info!(instance = %self.instance, "workflow completed");
        self.append(&mut history, EventKind::WorkflowCompleted { output })
            .await?;
        self.events.purge_instance(&self.instance).await;
        Ok(())
    }

    /// Terminal failure. Idempotent on an already failed instance so that
    /// re-entered failure paths converge; completing and then failing is an
    /// `InvalidState` error.
    pub async fn fail_workflow(&self, error: impl Into<String>) -> Result<(), OrchestrationError> {
        let mut history = self.cell.history.lock().await;
        let current = WorkflowState::derive(&history);
        match current.status {
            WorkflowStatus::Failed => {
                debug!(instance = %self.instance, "failure replayed from history");
                return Ok(());
            }
            WorkflowStatus::Completed => {
                return Err(OrchestrationError::InvalidState {
                    operation: "fail_workflow".to_string(),
                    status: current.status,
                });
            }
            _ => {}
        }
        let error = error.into();
        warn!(instance = %self.instance, error = %error, "workflow failed");
        self.append(&mut history, EventKind::WorkflowFailed { error })
            .await?;
        self.events.purge_instance(&self.instance).await;
        Ok(())
    }

    /// A fresh side effect may only start while the instance is live. Replay
    /// hits never reach this check, so terminal histories stay readable.
    fn ensure_live(
        &self,
        history: &[HistoryEvent],
        operation: &str,
    ) -> Result<(), OrchestrationError> {
        let status = WorkflowState::derive(history).status;
        if status.is_terminal() {
            return Err(OrchestrationError::InvalidState {
                operation: operation.to_string(),
                status,
            });
        }
        Ok(())
    }
}
