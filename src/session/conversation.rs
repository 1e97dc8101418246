//! Per-conversation session records for one agent on one chat platform.
//!
//! Stored at `<state>/<platform>-sessions/<agent>.json` as a schema-versioned
//! map from conversation key (thread timestamp or channel id) to record.
//! Records of older schema versions migrate in place on first read; writers
//! always write the current version.
//!
//! Isolation invariant: writes to one conversation key never mutate another.
//! Token counters accumulate across upstream messages and never move
//! backwards within a session lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::utils::build_safe_path;
use crate::utils::fs::atomic_write_json;

/// Current on-disk schema version.
pub const CONVERSATION_SCHEMA_VERSION: u32 = 3;

/// Accumulated token usage for one conversation session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    pub context_window: Option<u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Usage numbers from a single upstream message; added, never assigned.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub context_window: Option<u64>,
}

/// Agent configuration captured at the time of the last turn, so status
/// queries on resumed sessions reflect current (not creation-time) config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigSnapshot {
    pub model: Option<String>,
    pub permission_mode: String,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

/// One conversation's session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub session_id: Option<String>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub last_message_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    pub context_usage: Option<ContextUsage>,
    pub agent_config_snapshot: Option<AgentConfigSnapshot>,
}

impl ConversationRecord {
    fn new() -> Self {
        Self {
            session_id: None,
            session_started_at: None,
            last_message_at: Utc::now(),
            message_count: 0,
            context_usage: None,
            agent_config_snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationFile {
    version: u32,
    agent_name: String,
    #[serde(default)]
    channels: HashMap<String, ConversationRecord>,
}

impl ConversationFile {
    fn empty(agent_name: &str) -> Self {
        Self {
            version: CONVERSATION_SCHEMA_VERSION,
            agent_name: agent_name.to_string(),
            channels: HashMap::new(),
        }
    }
}

/// Result of [`ConversationStore::get_or_create`].
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    pub session_id: Option<String>,
    pub is_new: bool,
}

/// Store for one agent's conversations on one platform.
///
/// All mutation goes through a single writer mutex; reads serve from the
/// in-memory copy, refreshed on every write, so readers within this process
/// always observe read-after-write consistency.
pub struct ConversationStore {
    path: PathBuf,
    agent_name: String,
    state: Arc<Mutex<Option<ConversationFile>>>,
}

impl ConversationStore {
    /// `<state>/<platform>-sessions/<agent>.json`. Both names are validated.
    pub fn new(state_dir: &Path, platform: &str, agent: &str) -> Result<Self> {
        let dir_name = format!("{}-sessions", platform);
        let path = build_safe_path(state_dir, &[&dir_name, agent], Some(".json"))?;
        Ok(Self {
            path,
            agent_name: agent.to_string(),
            state: Arc::new(Mutex::new(None)),
        })
    }

    /// Load from disk into the cache slot, migrating old schemas.
    async fn load_locked(&self, slot: &mut Option<ConversationFile>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(_) => {
                *slot = Some(ConversationFile::empty(&self.agent_name));
                return Ok(());
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable conversation file, starting fresh");
                *slot = Some(ConversationFile::empty(&self.agent_name));
                return Ok(());
            }
        };

        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let file = if version < CONVERSATION_SCHEMA_VERSION {
            let migrated = migrate(value, version, &self.agent_name);
            info!(
                path = %self.path.display(),
                from = version,
                to = CONVERSATION_SCHEMA_VERSION,
                "migrated conversation file"
            );
            // Persist the upgrade so future readers observe the new shape.
            atomic_write_json(&self.path, &migrated).await?;
            migrated
        } else {
            serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "conversation file did not parse, starting fresh");
                ConversationFile::empty(&self.agent_name)
            })
        };

        *slot = Some(file);
        Ok(())
    }

    async fn persist(&self, file: &ConversationFile) -> Result<()> {
        atomic_write_json(&self.path, file).await
    }

    /// Read-only view of one conversation.
    pub async fn get_conversation(&self, key: &str) -> Result<Option<ConversationRecord>> {
        let mut slot = self.state.lock().await;
        self.load_locked(&mut slot).await?;
        Ok(slot
            .as_ref()
            .and_then(|f| f.channels.get(key))
            .cloned())
    }

    /// Fetch the conversation for `key`, creating an empty record on first
    /// contact. `is_new` is true only on creation.
    pub async fn get_or_create(&self, key: &str) -> Result<ConversationHandle> {
        let mut slot = self.state.lock().await;
        self.load_locked(&mut slot).await?;
        let file = slot.as_mut().expect("loaded above");

        if let Some(record) = file.channels.get(key) {
            return Ok(ConversationHandle {
                session_id: record.session_id.clone(),
                is_new: false,
            });
        }

        file.channels.insert(key.to_string(), ConversationRecord::new());
        self.persist(file).await?;
        debug!(key, agent = %self.agent_name, "conversation created");
        Ok(ConversationHandle {
            session_id: None,
            is_new: true,
        })
    }

    /// Refresh `last_message_at` for an existing conversation.
    pub async fn touch_conversation(&self, key: &str) -> Result<()> {
        self.mutate(key, |record| {
            record.last_message_at = Utc::now();
            true
        })
        .await
    }

    /// Record the upstream session for this conversation.
    ///
    /// Replacing one session with a different one resets the token counters;
    /// they are defined per session lifetime. Learning the first session for
    /// a fresh conversation keeps whatever was already counted this turn.
    pub async fn set_conversation_session(&self, key: &str, session_id: &str) -> Result<()> {
        let mut slot = self.state.lock().await;
        self.load_locked(&mut slot).await?;
        let file = slot.as_mut().expect("loaded above");
        let record = file
            .channels
            .entry(key.to_string())
            .or_insert_with(ConversationRecord::new);

        let replaced = matches!(&record.session_id, Some(old) if old != session_id);
        if replaced {
            record.context_usage = Some(ContextUsage::default());
        }
        if record.session_id.as_deref() != Some(session_id) {
            record.session_started_at = Some(Utc::now());
        }
        record.session_id = Some(session_id.to_string());

        self.persist(file).await
    }

    /// Drop one conversation entirely. The next message starts fresh.
    pub async fn reset_conversation(&self, key: &str) -> Result<bool> {
        let mut slot = self.state.lock().await;
        self.load_locked(&mut slot).await?;
        let file = slot.as_mut().expect("loaded above");
        let existed = file.channels.remove(key).is_some();
        if existed {
            self.persist(file).await?;
            info!(key, agent = %self.agent_name, "conversation reset");
        }
        Ok(existed)
    }

    /// Accumulate token usage. Reads current counters, adds the deltas,
    /// writes the sum — prior totals are never replaced.
    pub async fn update_context_usage(&self, key: &str, delta: UsageDelta) -> Result<()> {
        self.mutate(key, |record| {
            let usage = record.context_usage.get_or_insert_with(ContextUsage::default);
            usage.input_tokens += delta.input_tokens;
            usage.output_tokens += delta.output_tokens;
            usage.total_tokens = usage.input_tokens + usage.output_tokens;
            if delta.context_window.is_some() {
                usage.context_window = delta.context_window;
            }
            usage.last_updated = Some(Utc::now());
            true
        })
        .await
    }

    /// Bump the per-session message counter. Best-effort by design.
    pub async fn increment_message_count(&self, key: &str) -> Result<()> {
        self.mutate(key, |record| {
            record.message_count += 1;
            true
        })
        .await
    }

    /// Capture the agent configuration for `!status`-style queries.
    pub async fn set_agent_config(&self, key: &str, snapshot: AgentConfigSnapshot) -> Result<()> {
        self.mutate(key, |record| {
            if record.agent_config_snapshot.as_ref() == Some(&snapshot) {
                return false;
            }
            record.agent_config_snapshot = Some(snapshot.clone());
            true
        })
        .await
    }

    /// Drop conversations whose last message is older than `timeout`.
    /// Returns the number removed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>, timeout: Duration) -> Result<usize> {
        let mut slot = self.state.lock().await;
        self.load_locked(&mut slot).await?;
        let file = slot.as_mut().expect("loaded above");

        let before = file.channels.len();
        file.channels.retain(|_, record| {
            now.signed_duration_since(record.last_message_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
                <= timeout
        });
        let removed = before - file.channels.len();
        if removed > 0 {
            self.persist(file).await?;
            info!(removed, agent = %self.agent_name, "expired conversations cleaned up");
        }
        Ok(removed)
    }

    /// Apply `f` to the record for `key` when it exists; persist if `f`
    /// reports a change. Missing keys are a no-op so late callbacks from a
    /// finished turn cannot resurrect a reset conversation.
    async fn mutate<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ConversationRecord) -> bool,
    {
        let mut slot = self.state.lock().await;
        self.load_locked(&mut slot).await?;
        let file = slot.as_mut().expect("loaded above");
        match file.channels.get_mut(key) {
            Some(record) => {
                if f(record) {
                    self.persist(file).await?;
                }
                Ok(())
            }
            None => {
                debug!(key, "mutation on missing conversation ignored");
                Ok(())
            }
        }
    }
}

/// Upgrade an older on-disk shape to the current one without data loss.
///
/// v1: `channels` maps key → bare session-id string.
/// v2: record shape without `context_usage` / `agent_config_snapshot`.
fn migrate(value: serde_json::Value, version: u32, agent_name: &str) -> ConversationFile {
    let mut file = ConversationFile::empty(agent_name);
    if let Some(name) = value.get("agent_name").and_then(|v| v.as_str()) {
        file.agent_name = name.to_string();
    }

    let Some(channels) = value.get("channels").and_then(|v| v.as_object()) else {
        return file;
    };

    for (key, raw) in channels {
        let record = match version {
            1 => {
                let mut record = ConversationRecord::new();
                record.session_id = raw.as_str().map(String::from);
                record
            }
            _ => {
                // v2 records are a subset of the current shape; defaults
                // fill the fields the old writer never knew about.
                serde_json::from_value(raw.clone()).unwrap_or_else(|_| {
                    warn!(key, "unreadable legacy conversation record, keeping key with empty record");
                    ConversationRecord::new()
                })
            }
        };
        file.channels.insert(key.clone(), record);
    }

    file
}
