//! Entry point: validates configuration, owns the shared collaborators, and
//! hands out per-instance orchestration handles.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::codec;
use crate::dispatcher::{RetryPolicy, TaskDispatcher};
use crate::error::OrchestrationError;
use crate::events::EventHub;
use crate::executor::{InstanceCell, Orchestration};
use crate::http::HttpInvoker;
use crate::providers::HistoryStore;
use crate::registry::ActivityRegistry;
use crate::timers::TimerService;

/// Hosting configuration. `credential`/`secret`/`region` locate the backing
/// services; `use_managed_compute` routes task dispatch through a managed
/// compute pool, which additionally needs `execution_role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryConfig {
    pub credential: String,
    pub secret: String,
    pub region: String,
    pub use_managed_compute: bool,
    pub execution_role: Option<String>,
}

impl FactoryConfig {
    /// Configuration for local, in-process execution (tests and samples).
    pub fn local() -> Self {
        Self {
            credential: "local".to_string(),
            secret: "local".to_string(),
            region: "local".to_string(),
            use_managed_compute: false,
            execution_role: None,
        }
    }

    fn validate(&self) -> Result<(), OrchestrationError> {
        let mut missing = Vec::new();
        if self.credential.trim().is_empty() {
            missing.push("credential");
        }
        if self.secret.trim().is_empty() {
            missing.push("secret");
        }
        if self.region.trim().is_empty() {
            missing.push("region");
        }
        if self.use_managed_compute
            && self
                .execution_role
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            missing.push("execution_role (required with managed compute)");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::Configuration {
                message: format!("missing fields: {}", missing.join(", ")),
            })
        }
    }
}

/// Creates and resolves workflow instances over one history store and one
/// activity registry. All handles from one factory share the dispatcher,
/// HTTP invoker, timer service, and event hub; handles for the same
/// instance additionally share one history mirror, so concurrent handles
/// cannot double-dispatch a correlation.
pub struct OrchestrationFactory {
    config: FactoryConfig,
    store: Arc<dyn HistoryStore>,
    tasks: Arc<TaskDispatcher>,
    http: Arc<HttpInvoker>,
    timers: Arc<TimerService>,
    events: Arc<EventHub>,
    cells: tokio::sync::Mutex<HashMap<String, Arc<InstanceCell>>>,
}

impl OrchestrationFactory {
    pub fn new(
        config: FactoryConfig,
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
    ) -> Result<Self, OrchestrationError> {
        Self::new_with_policy(config, store, activities, RetryPolicy::default())
    }

    pub fn new_with_policy(
        config: FactoryConfig,
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        policy: RetryPolicy,
    ) -> Result<Self, OrchestrationError> {
        config.validate()?;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
        info!(region = %config.region, managed_compute = config.use_managed_compute, "orchestration factory ready");
        Ok(Self {
            config,
            store,
            tasks: Arc::new(TaskDispatcher::new(activities, policy)),
            http: Arc::new(HttpInvoker::new(policy)),
            timers: Arc::new(TimerService::start()),
            events: Arc::new(EventHub::default()),
            cells: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    /// Create or resolve the instance whose id is the workflow name, the
    /// common single-instance-per-workflow arrangement.
    pub async fn create_orchestration(
        &self,
        workflow: &str,
    ) -> Result<Orchestration, OrchestrationError> {
        self.create_orchestration_with_id(workflow, workflow).await
    }

    /// Create or resolve an explicitly named instance. An existing history
    /// is preloaded so the returned handle replays it. All handles for one
    /// instance share a memoized mirror; each handle keeps its own event
    /// consumption cursor, so a fresh handle is a fresh logical run.
    pub async fn create_orchestration_with_id(
        &self,
        workflow: &str,
        instance: &str,
    ) -> Result<Orchestration, OrchestrationError> {
        let mut cells = self.cells.lock().await;
        let cell = match cells.get(instance) {
            Some(cell) => cell.clone(),
            None => {
                let created = self.store.create_instance(instance).await?;
                if created {
                    info!(workflow, instance, "instance created");
                }
                let history = self.store.read(instance).await;
                let cell = Arc::new(InstanceCell::new(history));
                cells.insert(instance.to_string(), cell.clone());
                cell
            }
        };
        Ok(Orchestration::new(
            workflow.to_string(),
            instance.to_string(),
            cell,
            self.store.clone(),
            self.tasks.clone(),
            self.http.clone(),
            self.timers.clone(),
            self.events.clone(),
        ))
    }

    /// Deliver an external event to a (possibly waiting) instance. Returns
    /// false when the payload was dropped because the instance is already
    /// terminal; otherwise it is delivered or buffered.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        payload: impl Into<String>,
    ) -> bool {
        let history = self.store.read(instance).await;
        if history.last().is_some_and(|e| e.kind.is_terminal()) {
            debug!(instance, event = name, "event dropped; instance is terminal");
            return false;
        }
        self.events.raise(instance, name, payload).await;
        true
    }

    /// Typed wrapper over [`raise_event`](Self::raise_event).
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        name: &str,
        payload: &T,
    ) -> Result<bool, OrchestrationError> {
        let payload = codec::encode(payload).map_err(OrchestrationError::codec)?;
        Ok(self.raise_event(instance, name, payload).await)
    }
}
