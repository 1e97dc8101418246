//! Chat manager: one platform connection fanned out to many agents.
//!
//! A single adapter connection serves every agent bound to that platform.
//! Inbound events route by channel to an agent; each channel/thread pair
//! gets a conversation key whose session state lives in the per-agent
//! conversation store. Turns on one conversation are serialized in arrival
//! order; turns on distinct conversations run concurrently.

pub mod adapter;
pub mod commands;
pub mod responder;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ChannelMode};
use crate::error::{classify_chat_error, FleetError, Result};
use crate::executor::{TriggerOptions, TurnTrigger};
use crate::hooks::ChatPoster;
use crate::job::{JobOutputEvent, TriggerType};
use crate::session::{AgentConfigSnapshot, ConversationStore, UsageDelta};

pub use adapter::{ChatAdapter, ChatEvent, ControlEvent, InboundMessage};
pub use commands::{parse_command, render_help, render_status, ChatCommand, StatusContext};
pub use responder::{split_message, to_platform_format, StreamingResponder};

/// Routing entry for one bound channel.
#[derive(Debug, Clone)]
struct ChannelRoute {
    agent: String,
    mode: ChannelMode,
    context_messages: usize,
}

/// Events the turn pump applies in stream order.
enum TurnEvent {
    /// Session learned from the stream's init message. Applied before any
    /// usage so a replacement session's counter reset cannot eat tokens
    /// that belong to the new session.
    Session(String),
    Assistant(String),
    Final(String),
    Usage(UsageDelta),
}

struct ChatManagerInner {
    adapter: Arc<dyn ChatAdapter>,
    trigger: Arc<dyn TurnTrigger>,
    routes: HashMap<String, ChannelRoute>,
    agents: HashMap<String, AgentConfig>,
    stores: HashMap<String, Arc<ConversationStore>>,
    /// Per-conversation serialization: one turn in flight per key.
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Most recent job per conversation key.
    latest_jobs: Arc<DashMap<String, String>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
}

/// Owns the platform connection and the conversation stores for every
/// agent bound to it.
#[derive(Clone)]
pub struct ChatManager {
    inner: Arc<ChatManagerInner>,
}

impl ChatManager {
    /// Build the static channel→agent routing map from fleet config.
    pub fn new(
        state_dir: &Path,
        agents: &[AgentConfig],
        adapter: Arc<dyn ChatAdapter>,
        trigger: Arc<dyn TurnTrigger>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let platform = adapter.platform().to_string();
        let mut routes = HashMap::new();
        let mut stores = HashMap::new();
        let mut agent_map = HashMap::new();

        for agent in agents {
            let Some(bindings) = agent.chat.get(&platform) else {
                continue;
            };
            for channel in &bindings.channels {
                if let Some(existing) = routes.insert(
                    channel.id.clone(),
                    ChannelRoute {
                        agent: agent.name.clone(),
                        mode: channel.mode,
                        context_messages: channel.context_messages,
                    },
                ) {
                    return Err(FleetError::configuration(format!(
                        "channel {} bound to both {} and {}",
                        channel.id, existing.agent, agent.name
                    )));
                }
            }
            stores.insert(
                agent.name.clone(),
                Arc::new(ConversationStore::new(state_dir, &platform, &agent.name)?),
            );
            agent_map.insert(agent.name.clone(), agent.clone());
        }

        info!(
            platform = %platform,
            channels = routes.len(),
            agents = agent_map.len(),
            "chat manager configured"
        );

        Ok(Self {
            inner: Arc::new(ChatManagerInner {
                adapter,
                trigger,
                routes,
                agents: agent_map,
                stores,
                turn_locks: DashMap::new(),
                latest_jobs: Arc::new(DashMap::new()),
                connected_at: RwLock::new(None),
                cancel,
            }),
        })
    }

    /// True when any channel routes to an agent.
    pub fn has_routes(&self) -> bool {
        !self.inner.routes.is_empty()
    }

    /// Connect and start the dispatch loop.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        let mut events = self.inner.adapter.connect().await?;
        let inner = self.inner.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        info!(platform = %inner.adapter.platform(), "chat manager stopping");
                        break;
                    }
                    event = events.recv() => {
                        match event {
                            None => {
                                warn!(platform = %inner.adapter.platform(), "adapter event stream closed");
                                break;
                            }
                            Some(ChatEvent::Control(control)) => inner.handle_control(control).await,
                            Some(ChatEvent::Message(msg)) => {
                                let inner = inner.clone();
                                tokio::spawn(async move {
                                    inner.handle_message(msg).await;
                                });
                            }
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.adapter.disconnect().await;
    }
}

impl ChatManagerInner {
    async fn handle_control(&self, control: ControlEvent) {
        match control {
            ControlEvent::Connected => {
                *self.connected_at.write().await = Some(Utc::now());
                info!(platform = %self.adapter.platform(), "chat platform connected");
                self.cleanup_expired_conversations().await;
            }
            ControlEvent::Disconnected { reason } => {
                *self.connected_at.write().await = None;
                warn!(platform = %self.adapter.platform(), ?reason, "chat platform disconnected");
            }
            ControlEvent::Error { message } => {
                let kind = classify_chat_error(&message);
                warn!(platform = %self.adapter.platform(), ?kind, %message, "chat platform error");
            }
        }
    }

    /// Drop conversations idle past each agent's session timeout.
    async fn cleanup_expired_conversations(&self) {
        let now = Utc::now();
        for (agent_name, store) in &self.stores {
            let timeout = self
                .agents
                .get(agent_name)
                .map(|a| Duration::from_secs(a.session.timeout_secs))
                .unwrap_or(Duration::from_secs(86_400));
            if let Err(e) = store.cleanup_expired(now, timeout).await {
                warn!(agent = %agent_name, error = %e, "conversation cleanup failed");
            }
        }
    }

    async fn handle_message(&self, msg: InboundMessage) {
        let Some(route) = self.routes.get(&msg.channel) else {
            return;
        };

        // Mention gating applies to top-level messages only; thread replies
        // always flow so an ongoing conversation cannot be silenced.
        if msg.thread.is_none() && route.mode == ChannelMode::Mention && !msg.mentions_bot {
            debug!(channel = %msg.channel, "top-level message without mention ignored");
            return;
        }

        let Some(agent) = self.agents.get(&route.agent) else {
            error!(agent = %route.agent, "channel routed to unknown agent");
            return;
        };
        let Some(store) = self.stores.get(&route.agent) else {
            return;
        };

        // Conversation key: the thread where the platform has threads, the
        // channel where it does not. Replies land in the same place.
        let (key, reply_thread) = if self.adapter.supports_threads() {
            let key = msg
                .thread
                .clone()
                .unwrap_or_else(|| msg.message_id.clone());
            (key.clone(), Some(key))
        } else {
            (msg.channel.clone(), None)
        };

        if let Some(command) = parse_command(&msg.text) {
            self.handle_command(command, agent, store, &msg.channel, &key, reply_thread.as_deref())
                .await;
            return;
        }

        // One turn per conversation at a time, queued in arrival order.
        let lock = self
            .turn_locks
            .entry(format!("{}:{}", route.agent, key))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _turn = lock.lock().await;

        if let Err(e) = self
            .run_turn(agent, store.clone(), route, msg, &key, reply_thread.as_deref())
            .await
        {
            error!(agent = %agent.name, key = %key, error = %e, "chat turn failed");
        }
    }

    async fn handle_command(
        &self,
        command: ChatCommand,
        agent: &AgentConfig,
        store: &Arc<ConversationStore>,
        channel: &str,
        key: &str,
        reply_thread: Option<&str>,
    ) {
        let reply = match command {
            ChatCommand::Reset => match store.reset_conversation(key).await {
                Ok(true) => "Conversation reset. The next message starts a fresh session."
                    .to_string(),
                Ok(false) => "Nothing to reset in this thread.".to_string(),
                Err(e) => format!("Reset failed: {}", e),
            },
            ChatCommand::Status => {
                let record = store.get_conversation(key).await.unwrap_or_default();
                let connected_at = *self.connected_at.read().await;
                let ctx = StatusContext {
                    agent_name: agent.name.clone(),
                    connected: connected_at.is_some(),
                    connected_at,
                    last_job_id: self.latest_jobs.get(key).map(|j| j.value().clone()),
                    now: Utc::now(),
                };
                render_status(&ctx, record.as_ref())
            }
            ChatCommand::Help => render_help(),
        };

        if let Err(e) = self
            .adapter
            .send_message(channel, reply_thread, &reply)
            .await
        {
            warn!(channel, error = %e, "command reply failed");
        }
    }

    async fn run_turn(
        &self,
        agent: &AgentConfig,
        store: Arc<ConversationStore>,
        route: &ChannelRoute,
        msg: InboundMessage,
        key: &str,
        reply_thread: Option<&str>,
    ) -> Result<()> {
        let conversation = store.get_or_create(key).await?;
        store.touch_conversation(key).await?;
        store.increment_message_count(key).await?;

        // Snapshot on every turn, not only on creation, so status queries
        // against resumed sessions reflect the current configuration.
        store
            .set_agent_config(
                key,
                AgentConfigSnapshot {
                    model: agent.model.clone(),
                    permission_mode: agent.permission_mode.as_str().to_string(),
                    mcp_servers: agent.mcp_servers.keys().cloned().collect(),
                },
            )
            .await?;

        let prompt = self
            .build_prompt(&msg, route, conversation.is_new)
            .await;

        if let Err(e) = self
            .adapter
            .set_indicator(&msg.channel, reply_thread, true)
            .await
        {
            debug!(error = %e, "processing indicator failed");
        }

        // Stream pump: applies usage and reply events in stream order.
        let (tx, mut rx) = mpsc::unbounded_channel::<TurnEvent>();
        let pump_store = store.clone();
        let pump_key = key.to_string();
        let mut responder = StreamingResponder::new(
            self.adapter.clone(),
            msg.channel.clone(),
            reply_thread.map(String::from),
        );
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TurnEvent::Session(session_id) => {
                        if let Err(e) = pump_store
                            .set_conversation_session(&pump_key, &session_id)
                            .await
                        {
                            warn!(key = %pump_key, error = %e, "session record failed");
                        }
                    }
                    TurnEvent::Assistant(text) => responder.send_best_effort(&text).await,
                    TurnEvent::Final(text) => {
                        // The terminal result repeats the last assistant
                        // message; only send it when nothing streamed.
                        if !responder.sent_any() {
                            responder.send_best_effort(&text).await;
                        }
                    }
                    TurnEvent::Usage(delta) => {
                        if let Err(e) = pump_store.update_context_usage(&pump_key, delta).await {
                            warn!(key = %pump_key, error = %e, "usage accumulation failed");
                        }
                    }
                }
            }
        });

        let message_tx = tx.clone();
        let on_message: crate::executor::MessageCallback = Arc::new(move |event| {
            if let Some(session_id) = &event.session_id {
                let _ = message_tx.send(TurnEvent::Session(session_id.clone()));
            }
            if let Some(usage) = event.usage {
                let _ = message_tx.send(TurnEvent::Usage(usage));
            }
            if let JobOutputEvent::Assistant {
                content: Some(content),
                partial: false,
                ..
            } = &event.output
            {
                let turn_event = if event.is_terminal {
                    TurnEvent::Final(content.clone())
                } else {
                    TurnEvent::Assistant(content.clone())
                };
                let _ = message_tx.send(turn_event);
            }
        });

        let jobs = self.latest_jobs.clone();
        let job_key = key.to_string();
        let on_job_created: crate::executor::JobCreatedCallback = Arc::new(move |job_id| {
            jobs.insert(job_key.clone(), job_id.to_string());
        });

        let options = TriggerOptions {
            prompt,
            trigger_type: Some(TriggerType::Chat(self.adapter.platform().to_string())),
            resume: conversation.session_id.clone(),
            cancel: Some(self.cancel.child_token()),
            on_message: Some(on_message),
            on_job_created: Some(on_job_created),
            ..Default::default()
        };

        let result = self.trigger.trigger(&agent.name, options).await;

        drop(tx);
        let _ = pump.await;

        if let Err(e) = self
            .adapter
            .set_indicator(&msg.channel, reply_thread, false)
            .await
        {
            debug!(error = %e, "indicator clear failed");
        }

        match result {
            Ok(result) => {
                if let Some(session_id) = &result.session_id {
                    store.set_conversation_session(key, session_id).await?;
                }
                debug!(
                    agent = %agent.name,
                    key = %key,
                    job_id = %result.job_id,
                    status = ?result.status,
                    "chat turn finished"
                );
                Ok(())
            }
            Err(e) => {
                let notice = format!("Something went wrong running the agent: {}", e);
                if let Err(send_err) = self
                    .adapter
                    .send_message(&msg.channel, reply_thread, &notice)
                    .await
                {
                    warn!(error = %send_err, "failure notice send failed");
                }
                Err(e)
            }
        }
    }

    /// For a brand-new auto-mode conversation, prefix recent channel
    /// back-scroll so the agent sees what prompted the discussion.
    async fn build_prompt(
        &self,
        msg: &InboundMessage,
        route: &ChannelRoute,
        is_new: bool,
    ) -> String {
        if !is_new || route.mode != ChannelMode::Auto || route.context_messages == 0 {
            return msg.text.clone();
        }

        match self
            .adapter
            .fetch_history(&msg.channel, route.context_messages)
            .await
        {
            Ok(history) if !history.is_empty() => {
                let mut prompt = String::from("Recent channel messages for context:\n");
                for entry in &history {
                    prompt.push_str(&format!(
                        "{}: {}\n",
                        entry.user.as_deref().unwrap_or("someone"),
                        entry.text
                    ));
                }
                prompt.push_str("\n---\n\n");
                prompt.push_str(&msg.text);
                prompt
            }
            Ok(_) => msg.text.clone(),
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "history fetch failed, sending without context");
                msg.text.clone()
            }
        }
    }
}

#[async_trait]
impl ChatPoster for ChatManager {
    async fn post_message(&self, platform: &str, channel: &str, text: &str) -> Result<()> {
        if platform != self.inner.adapter.platform() {
            return Err(FleetError::ChatPlatform {
                kind: crate::error::ChatErrorKind::Api,
                message: format!("no connection for platform {}", platform),
                source: None,
            });
        }
        self.inner
            .adapter
            .send_message(channel, None, &to_platform_format(text))
            .await?;
        Ok(())
    }
}
