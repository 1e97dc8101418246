//! Structured error types for the fleet orchestration core.
//!
//! Every subsystem surfaces one of the variants below; the variant decides
//! the recovery policy (see the job executor and chat manager). Errors carry
//! their source chain so `tracing` output keeps the underlying cause.

use thiserror::Error;

/// Main error type for ccfleet operations.
#[derive(Error, Debug)]
pub enum FleetError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An externally-provided identifier failed validation, or a constructed
    /// path escaped its base directory.
    #[error("Path traversal rejected: {message}")]
    PathTraversal { message: String },

    /// Atomic state write exhausted its retries.
    #[error("State write failed for '{path}': {message}")]
    StateWrite {
        path: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Runtime failed before yielding its first message (bad credentials,
    /// unreachable daemon, missing image).
    #[error("Runner initialization failed [{agent}]: {message}")]
    RunnerInit {
        agent: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Runtime failed mid-stream.
    #[error("Runner stream error [{agent}]: {message}")]
    RunnerStream {
        agent: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration was rejected at fleet load time.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A post-run hook failed. Never fails the originating job.
    #[error("Hook error [{hook}]: {message}")]
    Hook { hook: String, message: String },

    /// Chat platform call failed.
    #[error("Chat platform error ({kind:?}): {message}")]
    ChatPlatform {
        kind: ChatErrorKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Session store invariant violation or lookup failure.
    #[error("Session error [{agent}]: {message}")]
    Session { agent: String, message: String },

    /// Job store lookup failure.
    #[error("Job error [{job_id}]: {message}")]
    Job { job_id: String, message: String },
}

/// Classification of chat-platform failures; drives retry/backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorKind {
    Auth,
    RateLimit,
    Network,
    Api,
}

impl FleetError {
    pub fn path_traversal(message: impl Into<String>) -> Self {
        Self::PathTraversal {
            message: message.into(),
        }
    }

    pub fn state_write(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateWrite {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn runner_init(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RunnerInit {
            agent: agent.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn runner_stream(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RunnerStream {
            agent: agent.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True when this error was raised before the runtime produced output.
    pub fn is_init_error(&self) -> bool {
        matches!(self, Self::RunnerInit { .. })
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T, E = FleetError> = std::result::Result<T, E>;

/// How a finished job is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Success,
    Error,
    Timeout,
    Cancelled,
    MaxTurns,
}

/// Map a failure message onto an exit reason by keyword.
///
/// `success` is never returned here; callers use it for the no-error path.
pub fn classify_exit_reason(message: &str) -> ExitReason {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ExitReason::Timeout
    } else if lower.contains("cancel") || lower.contains("abort") {
        ExitReason::Cancelled
    } else if lower.contains("max turns") || lower.contains("max_turns") {
        ExitReason::MaxTurns
    } else {
        ExitReason::Error
    }
}

/// Classify a chat platform failure message for backoff policy.
pub fn classify_chat_error(message: &str) -> ChatErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("invalid_auth")
        || lower.contains("not_authed")
        || lower.contains("token_revoked")
        || lower.contains("unauthorized")
    {
        ChatErrorKind::Auth
    } else if lower.contains("rate") && lower.contains("limit") || lower.contains("ratelimited") {
        ChatErrorKind::RateLimit
    } else if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("dns")
        || lower.contains("reset by peer")
    {
        ChatErrorKind::Network
    } else {
        ChatErrorKind::Api
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_keywords() {
        assert_eq!(
            classify_exit_reason("operation timed out after 300s"),
            ExitReason::Timeout
        );
        assert_eq!(
            classify_exit_reason("turn cancelled by caller"),
            ExitReason::Cancelled
        );
        assert_eq!(
            classify_exit_reason("stopped: max turns reached"),
            ExitReason::MaxTurns
        );
        assert_eq!(
            classify_exit_reason("connection refused"),
            ExitReason::Error
        );
    }

    #[test]
    fn test_chat_error_classification() {
        assert_eq!(classify_chat_error("invalid_auth"), ChatErrorKind::Auth);
        assert_eq!(classify_chat_error("ratelimited"), ChatErrorKind::RateLimit);
        assert_eq!(
            classify_chat_error("connection reset by peer"),
            ChatErrorKind::Network
        );
        assert_eq!(
            classify_chat_error("channel_not_found"),
            ChatErrorKind::Api
        );
    }

    #[test]
    fn test_init_error_predicate() {
        let init = FleetError::runner_init("assistant", "docker daemon unreachable");
        let stream = FleetError::runner_stream("assistant", "broken pipe");
        assert!(init.is_init_error());
        assert!(!stream.is_init_error());
    }
}
