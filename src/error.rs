use crate::providers::StoreError;
use crate::WorkflowStatus;

/// Top-level error surfaced to workflow drivers.
///
/// `ActivityFailed` is the catchable one: a task or HTTP step exhausted its
/// retries (or failed permanently) and the driver may react, typically by
/// calling `fail_workflow`. The others indicate misuse or infrastructure
/// trouble.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    /// Factory configuration is incomplete or inconsistent. Fatal at startup.
    Configuration { message: String },
    /// The activity identified by `correlation` failed terminally.
    ActivityFailed { correlation: String, error: String },
    /// An operation was issued against an instance in a state that forbids it.
    InvalidState {
        operation: String,
        status: WorkflowStatus,
    },
    /// A replayed call site disagreed with what history recorded.
    Nondeterminism { message: String },
    /// A payload failed to encode or decode at a typed seam.
    Codec { message: String },
    /// The history store failed.
    Store(StoreError),
}

impl OrchestrationError {
    pub(crate) fn codec(e: impl std::fmt::Display) -> Self {
        OrchestrationError::Codec { message: e.to_string() }
    }

    pub(crate) fn nondeterminism(message: impl Into<String>) -> Self {
        OrchestrationError::Nondeterminism { message: message.into() }
    }
}

impl std::fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationError::Configuration { message } => {
                write!(f, "configuration error: {message}")
            }
            OrchestrationError::ActivityFailed { correlation, error } => {
                write!(f, "activity '{correlation}' failed: {error}")
            }
            OrchestrationError::InvalidState { operation, status } => {
                write!(f, "{operation} not allowed in state {status:?}")
            }
            OrchestrationError::Nondeterminism { message } => {
                write!(f, "nondeterministic workflow: {message}")
            }
            OrchestrationError::Codec { message } => write!(f, "codec error: {message}"),
            OrchestrationError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for OrchestrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrchestrationError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for OrchestrationError {
    fn from(e: StoreError) -> Self {
        OrchestrationError::Store(e)
    }
}

/// Activity-boundary error with retry classification.
///
/// The dispatcher and HTTP invoker decide retry-vs-fail exactly once, here.
/// `transport` marks network-level failures; it only affects classification,
/// never what the workflow boundary sees (always `ActivityFailed` once
/// retries exhaust).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
    pub transport: bool,
}

impl ActivityError {
    /// Transient application failure, eligible for retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            transport: false,
        }
    }

    /// Permanent failure; retrying cannot help (unknown task, non-2xx
    /// response, malformed input).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            transport: false,
        }
    }

    /// Network-level failure (connect refused, timeout, DNS). Retryable.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            transport: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.transport {
            write!(f, "transport: {}", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ActivityError {}

/// Handler `Err(String)` values are treated as retryable. Conservative
/// default: a handler that wants to fail fast returns a structured error.
impl From<String> for ActivityError {
    fn from(s: String) -> Self {
        ActivityError::transient(s)
    }
}

impl From<&str> for ActivityError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
