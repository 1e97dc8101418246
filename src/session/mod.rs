//! Session persistence for agents and conversations.
//!
//! Two stores live here. The agent-session store holds at most one upstream
//! session per agent — the most recent one used directly (manual, schedule,
//! hook paths). The conversation store maps external conversation keys
//! (chat threads) to their own upstream sessions with strict per-key
//! isolation; it is the authority the chat manager trusts when resuming.

pub mod conversation;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RuntimeKind;
use crate::error::Result;
use crate::utils::build_safe_path;
use crate::utils::fs::atomic_write_json;

pub use conversation::{
    AgentConfigSnapshot, ContextUsage, ConversationRecord, ConversationStore, UsageDelta,
    CONVERSATION_SCHEMA_VERSION,
};

/// Per-agent session record stored at `<state>/sessions/<agent>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    #[serde(default)]
    pub job_count: u64,
    /// Permission mode the session was established with.
    pub mode: Option<String>,
    pub last_used_at: DateTime<Utc>,
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub runtime_type: RuntimeKind,
    #[serde(default)]
    pub docker_enabled: bool,
}

/// Options for [`AgentSessionStore::load`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// When set, sessions idle longer than this are removed on load.
    pub timeout: Option<Duration>,
    /// When set, sessions persisted under a different runtime are removed.
    pub runtime: Option<RuntimeKind>,
}

/// Fields applied by [`AgentSessionStore::update`].
#[derive(Debug, Clone)]
pub struct AgentSessionUpdate {
    pub session_id: String,
    pub mode: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub runtime_type: RuntimeKind,
    pub docker_enabled: bool,
}

/// Result of a working-directory or runtime-context validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub message: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    fn invalid(message: String) -> Self {
        Self {
            valid: false,
            message: Some(message),
        }
    }
}

/// Store for per-agent session records with atomic writes and per-agent
/// writer serialization.
#[derive(Debug, Clone)]
pub struct AgentSessionStore {
    dir: PathBuf,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AgentSessionStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("sessions"),
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, agent: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn session_path(&self, agent: &str) -> Result<PathBuf> {
        build_safe_path(&self.dir, &[agent], Some(".json"))
    }

    /// Load the agent's session, enforcing expiry and runtime-type match.
    ///
    /// An expired or runtime-mismatched record is removed and `None` is
    /// returned, so stale sessions never leak into a resume.
    pub async fn load(&self, agent: &str, opts: LoadOptions) -> Result<Option<AgentSession>> {
        let path = self.session_path(agent)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };

        let session: AgentSession = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!(agent, error = %e, "unreadable session record, discarding");
                self.clear(agent).await?;
                return Ok(None);
            }
        };

        if let Some(timeout) = opts.timeout {
            let idle = Utc::now().signed_duration_since(session.last_used_at);
            if idle.to_std().unwrap_or(Duration::ZERO) > timeout {
                info!(agent, session_id = %session.session_id, "session expired, removing");
                self.clear(agent).await?;
                return Ok(None);
            }
        }

        if let Some(runtime) = opts.runtime {
            if session.runtime_type != runtime {
                info!(
                    agent,
                    stored = session.runtime_type.as_str(),
                    current = runtime.as_str(),
                    "session runtime mismatch, removing"
                );
                self.clear(agent).await?;
                return Ok(None);
            }
        }

        Ok(Some(session))
    }

    /// Atomic upsert. Increments `job_count` when the session ID is
    /// unchanged, resets it when a new session replaces the old one.
    pub async fn update(&self, agent: &str, fields: AgentSessionUpdate) -> Result<AgentSession> {
        let lock = self.lock_for(agent);
        let _guard = lock.lock().await;

        let path = self.session_path(agent)?;
        let previous: Option<AgentSession> = match tokio::fs::read_to_string(&path).await {
            Ok(c) => serde_json::from_str(&c).ok(),
            Err(_) => None,
        };

        let job_count = match &previous {
            Some(prev) if prev.session_id == fields.session_id => prev.job_count + 1,
            _ => 1,
        };

        let session = AgentSession {
            session_id: fields.session_id,
            job_count,
            mode: fields.mode,
            last_used_at: Utc::now(),
            working_directory: fields.working_directory,
            runtime_type: fields.runtime_type,
            docker_enabled: fields.docker_enabled,
        };

        atomic_write_json(&path, &session).await?;
        debug!(agent, session_id = %session.session_id, job_count, "agent session updated");
        Ok(session)
    }

    /// Refresh `last_used_at` without touching other fields.
    pub async fn touch(&self, agent: &str) -> Result<()> {
        let lock = self.lock_for(agent);
        let _guard = lock.lock().await;

        let path = self.session_path(agent)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let mut session: AgentSession = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(_) => return Ok(()),
        };
        session.last_used_at = Utc::now();
        atomic_write_json(&path, &session).await
    }

    /// Idempotent removal.
    pub async fn clear(&self, agent: &str) -> Result<()> {
        let path = self.session_path(agent)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(agent, "agent session cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

}

/// Valid iff the session has no recorded working directory or it equals the
/// current one. A moved agent must not resume a session rooted elsewhere.
pub fn validate_working_directory(session: &AgentSession, current_wd: Option<&Path>) -> Validation {
    match (&session.working_directory, current_wd) {
        (None, _) => Validation::ok(),
        (Some(stored), Some(current)) if stored == current => Validation::ok(),
        (Some(stored), current) => Validation::invalid(format!(
            "session was created in {} but agent now runs in {}",
            stored.display(),
            current
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<none>".to_string())
        )),
    }
}

/// Valid iff both the runtime kind and docker flag match the session.
pub fn validate_runtime_context(
    session: &AgentSession,
    runtime: RuntimeKind,
    docker_enabled: bool,
) -> Validation {
    if session.runtime_type != runtime {
        return Validation::invalid(format!(
            "session runtime {} does not match current runtime {}",
            session.runtime_type.as_str(),
            runtime.as_str()
        ));
    }
    if session.docker_enabled != docker_enabled {
        return Validation::invalid(format!(
            "session docker_enabled={} does not match current {}",
            session.docker_enabled, docker_enabled
        ));
    }
    Validation::ok()
}

static SESSION_EXPIRED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)session\s+not\s+found|session\s+expired|no\s+such\s+session|no\s+conversation\s+found")
        .expect("valid session-expiry regex")
});

/// Single predicate recognizing server-acknowledged session expiry.
///
/// Matches the provider's error phrasings and its stable error code. The
/// job executor's one-retry rule keys off exactly this predicate.
pub fn is_session_expired_error(message: &str) -> bool {
    SESSION_EXPIRED_RE.is_match(message) || message.contains("SESSION_NOT_FOUND")
}
