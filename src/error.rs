use serde::{Deserialize, Serialize};

/// Error taxonomy for the worker scheduler.
///
/// `Cancelled` is a cooperative abort, not a true failure; callers must
/// check [`SchedulerError::is_cancelled`] before reporting an error as a
/// script fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerError {
    // === Dispatch ===
    /// Task was dispatched to a worker that has already been cancelled.
    Unavailable,

    /// Submission to the underlying thread pool failed.
    DispatchFailed,

    // === Script loading ===
    /// The load policy rejected a script URL.
    Blocked { url: String },

    /// A script URL could not be resolved against the worker's base URL.
    InvalidUrl { url: String },

    /// A script fetch completed with a failure status.
    Fetch { url: String, status: u16 },

    /// A fetched script failed to compile.
    Compile { url: String, message: String },

    /// A compiled script failed during execution.
    Execute { message: String },

    // === Cooperative abort ===
    /// Execution was aborted cooperatively (worker cancelled or an external
    /// event surrendered the thread).
    Cancelled,
}

impl SchedulerError {
    /// Returns true if this is a cooperative abort rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this error came from the script itself.
    pub fn is_script_fault(&self) -> bool {
        matches!(self, Self::Compile { .. } | Self::Execute { .. })
    }

    /// Returns true if this error came from resolving or fetching a script,
    /// before any compilation happened.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::Blocked { .. } | Self::InvalidUrl { .. } | Self::Fetch { .. }
        )
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "worker is cancelled and unavailable for dispatch"),
            Self::DispatchFailed => write!(f, "failed to submit work to the thread pool"),
            Self::Blocked { url } => write!(f, "load policy blocked script: {url}"),
            Self::InvalidUrl { url } => write!(f, "invalid script url: {url}"),
            Self::Fetch { url, status } => {
                write!(f, "failed to fetch script {url} (status {status})")
            }
            Self::Compile { url, message } => {
                write!(f, "failed to compile script {url}: {message}")
            }
            Self::Execute { message } => write!(f, "script execution failed: {message}"),
            Self::Cancelled => write!(f, "execution was cancelled"),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_a_script_fault() {
        assert!(SchedulerError::Cancelled.is_cancelled());
        assert!(!SchedulerError::Cancelled.is_script_fault());

        let compile = SchedulerError::Compile {
            url: "http://example.com/a.js".into(),
            message: "syntax error".into(),
        };
        assert!(compile.is_script_fault());
        assert!(!compile.is_cancelled());
    }

    #[test]
    fn load_failures_are_classified() {
        let fetch = SchedulerError::Fetch {
            url: "http://example.com/a.js".into(),
            status: 404,
        };
        assert!(fetch.is_load_failure());
        assert!(!SchedulerError::Unavailable.is_load_failure());
    }
}
