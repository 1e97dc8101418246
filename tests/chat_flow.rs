//! Chat manager end-to-end: inbound platform events through routing,
//! conversation state, the executor (scripted runtime), and streamed
//! replies back out through a mock adapter.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ccfleet::chat::{ChatAdapter, ChatEvent, ChatManager, ControlEvent, InboundMessage};
use ccfleet::config::{AgentConfig, ChannelMode, ChatChannelConfig, ChatPlatformConfig};
use ccfleet::error::Result;
use ccfleet::job::TriggerType;
use ccfleet::session::ConversationStore;
use common::{success_script, usage_script, DirectTrigger, ScriptedRuntime, Step};

#[derive(Debug, Clone)]
struct Sent {
    channel: String,
    thread: Option<String>,
    text: String,
}

struct MockAdapter {
    tx_slot: Mutex<Option<mpsc::Sender<ChatEvent>>>,
    sends: Mutex<Vec<Sent>>,
    max_len: usize,
}

impl MockAdapter {
    fn new(max_len: usize) -> Arc<Self> {
        Arc::new(Self {
            tx_slot: Mutex::new(None),
            sends: Mutex::new(Vec::new()),
            max_len,
        })
    }

    async fn inject(&self, event: ChatEvent) {
        let tx = self
            .tx_slot
            .lock()
            .unwrap()
            .clone()
            .expect("adapter not connected");
        tx.send(event).await.expect("event loop gone");
    }

    fn sends(&self) -> Vec<Sent> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatAdapter for MockAdapter {
    fn platform(&self) -> &str {
        "slack"
    }

    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn connect(&self) -> Result<mpsc::Receiver<ChatEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.tx_slot.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {}

    async fn send_message(
        &self,
        channel: &str,
        thread: Option<&str>,
        text: &str,
    ) -> Result<String> {
        let mut sends = self.sends.lock().unwrap();
        sends.push(Sent {
            channel: channel.to_string(),
            thread: thread.map(String::from),
            text: text.to_string(),
        });
        Ok(format!("m{}", sends.len()))
    }

    async fn set_indicator(&self, _: &str, _: Option<&str>, _: bool) -> Result<()> {
        Ok(())
    }

    async fn fetch_history(&self, _: &str, _: usize) -> Result<Vec<InboundMessage>> {
        Ok(Vec::new())
    }

    async fn upload_file(&self, _: &str, _: Option<&str>, _: &str, _: Vec<u8>) -> Result<()> {
        Ok(())
    }
}

fn chat_agent(name: &str, channel: &str, mode: ChannelMode) -> AgentConfig {
    let mut agent = AgentConfig::named(name);
    agent.chat.insert(
        "slack".to_string(),
        ChatPlatformConfig {
            channels: vec![ChatChannelConfig {
                id: channel.to_string(),
                mode,
                context_messages: 0,
            }],
        },
    );
    agent
}

fn inbound(channel: &str, thread: Option<&str>, message_id: &str, text: &str) -> ChatEvent {
    ChatEvent::Message(InboundMessage {
        channel: channel.to_string(),
        thread: thread.map(String::from),
        message_id: message_id.to_string(),
        user: Some("U1".to_string()),
        text: text.to_string(),
        mentions_bot: true,
    })
}

struct Harness {
    adapter: Arc<MockAdapter>,
    runtime: Arc<ScriptedRuntime>,
    manager: ChatManager,
    trigger: Arc<DirectTrigger>,
    dir: tempfile::TempDir,
}

async fn setup(scripts: Vec<Vec<Step>>, agents: Vec<AgentConfig>, max_len: usize) -> Harness {
    common::init_logging();
    let dir = tempfile::TempDir::new().unwrap();
    let adapter = MockAdapter::new(max_len);
    let runtime = ScriptedRuntime::new(scripts);
    let trigger = Arc::new(DirectTrigger::new(dir.path(), runtime.clone(), agents.clone()));

    let manager = ChatManager::new(
        dir.path(),
        &agents,
        adapter.clone(),
        trigger.clone(),
        CancellationToken::new(),
    )
    .unwrap();
    manager.start().await.unwrap();
    adapter.inject(ChatEvent::Control(ControlEvent::Connected)).await;

    Harness {
        adapter,
        runtime,
        manager,
        trigger,
        dir,
    }
}

/// Poll until `check` passes or two seconds elapse.
async fn wait_for<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn fresh_chat_turn_creates_conversation_and_replies() {
    let h = setup(
        vec![success_script("S1")],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        4000,
    )
    .await;

    h.adapter.inject(inbound("C1", None, "T1", "hello")).await;

    wait_for(|| h.runtime.calls().len() == 1, "runtime invocation").await;
    assert_eq!(h.runtime.calls()[0].resume, None);

    wait_for(|| !h.adapter.sends().is_empty(), "streamed reply").await;
    let sends = h.adapter.sends();
    assert_eq!(sends[0].channel, "C1");
    assert_eq!(sends[0].thread.as_deref(), Some("T1"));
    assert!(sends[0].text.contains("working on it"));

    // Conversation record persisted: T1 → S1.
    let store = ConversationStore::new(h.dir.path(), "slack", "assistant").unwrap();
    wait_for_async(|| async {
        store
            .get_conversation("T1")
            .await
            .unwrap()
            .and_then(|r| r.session_id)
            .as_deref()
            == Some("S1")
    })
    .await;

    // The job carries the chat trigger type.
    let job_store = h.trigger.executor.job_store();
    let ids = job_store.list_jobs().await.unwrap();
    assert_eq!(ids.len(), 1);
    let job = job_store.get_job(&ids[0]).await.unwrap();
    assert_eq!(job.trigger_type, TriggerType::Chat("slack".to_string()));

    h.manager.stop().await;
}

/// Async condition polling, for store-backed checks.
async fn wait_for_async<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for async condition");
}

#[tokio::test]
async fn thread_reply_resumes_the_conversation_session() {
    let h = setup(
        vec![success_script("S1"), success_script("S1")],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        4000,
    )
    .await;

    h.adapter.inject(inbound("C1", None, "T1", "hello")).await;
    wait_for(|| h.runtime.calls().len() == 1, "first turn").await;

    // Wait for the session to land before the follow-up.
    let store = ConversationStore::new(h.dir.path(), "slack", "assistant").unwrap();
    wait_for_async(|| async {
        store
            .get_conversation("T1")
            .await
            .unwrap()
            .and_then(|r| r.session_id)
            .is_some()
    })
    .await;

    h.adapter
        .inject(inbound("C1", Some("T1"), "T1.2", "more"))
        .await;
    wait_for(|| h.runtime.calls().len() == 2, "second turn").await;

    let calls = h.runtime.calls();
    assert_eq!(calls[1].resume.as_deref(), Some("S1"));

    h.manager.stop().await;
}

#[tokio::test]
async fn interleaved_threads_stay_isolated() {
    let h = setup(
        vec![success_script("S-a"), success_script("S-b")],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        4000,
    )
    .await;

    h.adapter.inject(inbound("C1", None, "T1", "a")).await;
    h.adapter.inject(inbound("C1", None, "T2", "b")).await;

    wait_for(|| h.runtime.calls().len() == 2, "both turns").await;

    let store = ConversationStore::new(h.dir.path(), "slack", "assistant").unwrap();
    wait_for_async(|| async {
        let t1 = store.get_conversation("T1").await.unwrap();
        let t2 = store.get_conversation("T2").await.unwrap();
        matches!(
            (
                t1.and_then(|r| r.session_id),
                t2.and_then(|r| r.session_id)
            ),
            (Some(a), Some(b)) if a != b
        )
    })
    .await;

    // Two jobs, independent token counters.
    let t1 = store.get_conversation("T1").await.unwrap().unwrap();
    let t2 = store.get_conversation("T2").await.unwrap().unwrap();
    let u1 = t1.context_usage.unwrap();
    let u2 = t2.context_usage.unwrap();
    assert_eq!(u1.total_tokens, 110);
    assert_eq!(u2.total_tokens, 110);
    assert_eq!(h.trigger.executor.job_store().list_jobs().await.unwrap().len(), 2);

    h.manager.stop().await;
}

#[tokio::test]
async fn server_expired_session_recovers_with_fresh_one() {
    let dir = tempfile::TempDir::new().unwrap();

    // Existing conversation T1 → S1 from an earlier run.
    let seed = ConversationStore::new(dir.path(), "slack", "assistant").unwrap();
    seed.get_or_create("T1").await.unwrap();
    seed.set_conversation_session("T1", "S1").await.unwrap();
    drop(seed);

    let adapter = MockAdapter::new(4000);
    let runtime = ScriptedRuntime::new(vec![
        vec![Step::Fail("Session not found: S1".to_string())],
        success_script("S2"),
    ]);
    let agents = vec![chat_agent("assistant", "C1", ChannelMode::Auto)];
    let trigger = Arc::new(DirectTrigger::new(dir.path(), runtime.clone(), agents.clone()));
    let manager = ChatManager::new(
        dir.path(),
        &agents,
        adapter.clone(),
        trigger.clone(),
        CancellationToken::new(),
    )
    .unwrap();
    manager.start().await.unwrap();
    adapter.inject(ChatEvent::Control(ControlEvent::Connected)).await;

    adapter
        .inject(inbound("C1", Some("T1"), "T1.9", "continue please"))
        .await;

    wait_for(|| runtime.calls().len() == 2, "retry invocation").await;
    let calls = runtime.calls();
    assert_eq!(calls[0].resume.as_deref(), Some("S1"));
    assert_eq!(calls[1].resume, None);

    let store = ConversationStore::new(dir.path(), "slack", "assistant").unwrap();
    wait_for_async(|| async {
        store
            .get_conversation("T1")
            .await
            .unwrap()
            .and_then(|r| r.session_id)
            .as_deref()
            == Some("S2")
    })
    .await;

    // Counters were reset for the replacement session.
    let record = store.get_conversation("T1").await.unwrap().unwrap();
    assert_eq!(record.context_usage.unwrap().input_tokens, 100);

    manager.stop().await;
}

#[tokio::test]
async fn five_turns_accumulate_tokens_and_status_reports_them() {
    let h = setup(
        vec![
            usage_script("S1", 100, 10),
            usage_script("S1", 150, 20),
            usage_script("S1", 200, 30),
            usage_script("S1", 250, 40),
            usage_script("S1", 300, 50),
        ],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        4000,
    )
    .await;

    h.adapter.inject(inbound("C1", None, "T1", "msg 1")).await;
    wait_for(|| h.runtime.calls().len() == 1, "turn 1").await;
    for i in 2..=5 {
        h.adapter
            .inject(inbound("C1", Some("T1"), &format!("T1.{}", i), &format!("msg {}", i)))
            .await;
        let want = i;
        wait_for(|| h.runtime.calls().len() == want, "next turn").await;
    }

    let store = ConversationStore::new(h.dir.path(), "slack", "assistant").unwrap();
    wait_for_async(|| async {
        store
            .get_conversation("T1")
            .await
            .unwrap()
            .and_then(|r| r.context_usage)
            .map(|u| u.total_tokens)
            == Some(1150)
    })
    .await;

    let record = store.get_conversation("T1").await.unwrap().unwrap();
    let usage = record.context_usage.unwrap();
    assert_eq!(usage.input_tokens, 1000);
    assert_eq!(usage.output_tokens, 150);
    assert_eq!(record.message_count, 5);

    let sends_before = h.adapter.sends().len();
    h.adapter
        .inject(inbound("C1", Some("T1"), "T1.99", "!status"))
        .await;
    wait_for(|| h.adapter.sends().len() > sends_before, "status reply").await;

    let status = h.adapter.sends().last().unwrap().text.clone();
    assert!(status.contains("1000 in / 150 out / 1150 total"), "{}", status);
    assert!(status.contains("Messages: 5"), "{}", status);

    h.manager.stop().await;
}

#[tokio::test]
async fn mention_mode_gates_top_level_but_not_threads() {
    let h = setup(
        vec![success_script("S1"), success_script("S2")],
        vec![chat_agent("assistant", "C1", ChannelMode::Mention)],
        4000,
    )
    .await;

    // Top-level without a mention: dropped.
    h.adapter
        .inject(ChatEvent::Message(InboundMessage {
            channel: "C1".to_string(),
            thread: None,
            message_id: "T1".to_string(),
            user: Some("U1".to_string()),
            text: "just chatting".to_string(),
            mentions_bot: false,
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.runtime.calls().is_empty());

    // Thread reply without a mention: flows regardless of mode.
    h.adapter
        .inject(ChatEvent::Message(InboundMessage {
            channel: "C1".to_string(),
            thread: Some("T0".to_string()),
            message_id: "T0.5".to_string(),
            user: Some("U1".to_string()),
            text: "in thread".to_string(),
            mentions_bot: false,
        }))
        .await;
    wait_for(|| h.runtime.calls().len() == 1, "thread turn").await;

    h.manager.stop().await;
}

#[tokio::test]
async fn unrouted_channel_is_ignored() {
    let h = setup(
        vec![],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        4000,
    )
    .await;

    h.adapter.inject(inbound("C9", None, "T1", "hello")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.runtime.calls().is_empty());

    h.manager.stop().await;
}

#[tokio::test]
async fn reset_command_clears_the_thread_session() {
    let h = setup(
        vec![success_script("S1"), success_script("S-new")],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        4000,
    )
    .await;

    h.adapter.inject(inbound("C1", None, "T1", "hello")).await;
    wait_for(|| h.runtime.calls().len() == 1, "first turn").await;

    let store = ConversationStore::new(h.dir.path(), "slack", "assistant").unwrap();
    wait_for_async(|| async {
        store
            .get_conversation("T1")
            .await
            .unwrap()
            .and_then(|r| r.session_id)
            .is_some()
    })
    .await;

    let sends_before = h.adapter.sends().len();
    h.adapter
        .inject(inbound("C1", Some("T1"), "T1.2", "!reset"))
        .await;
    wait_for(|| h.adapter.sends().len() > sends_before, "reset reply").await;
    assert!(h
        .adapter
        .sends()
        .last()
        .unwrap()
        .text
        .to_lowercase()
        .contains("reset"));

    // Next message starts a fresh session.
    h.adapter
        .inject(inbound("C1", Some("T1"), "T1.3", "again"))
        .await;
    wait_for(|| h.runtime.calls().len() == 2, "post-reset turn").await;
    assert_eq!(h.runtime.calls()[1].resume, None);

    h.manager.stop().await;
}

#[tokio::test]
async fn long_replies_split_in_order_under_the_size_limit() {
    let long_text = (1..=30)
        .map(|i| format!("line number {}", i))
        .collect::<Vec<_>>()
        .join("\n");
    let script = vec![
        Step::Msg(json!({"type": "system", "subtype": "init", "session_id": "S1"})),
        Step::Msg(json!({"type": "assistant", "message": {"content": long_text.clone()}})),
        Step::Msg(json!({"type": "result", "result": "done"})),
    ];

    let h = setup(
        vec![script],
        vec![chat_agent("assistant", "C1", ChannelMode::Auto)],
        64,
    )
    .await;

    h.adapter.inject(inbound("C1", None, "T1", "go")).await;
    wait_for(
        || h.adapter.sends().iter().any(|s| s.text.contains("line number 30")),
        "all chunks",
    )
    .await;

    let sends = h.adapter.sends();
    assert!(sends.len() > 1, "expected a split, got {} sends", sends.len());
    for sent in &sends {
        assert!(sent.text.chars().count() <= 64);
        assert_eq!(sent.thread.as_deref(), Some("T1"));
    }
    // Order preserved: line 1 arrives before line 30.
    let first_idx = sends.iter().position(|s| s.text.contains("line number 1\n") || s.text.starts_with("line number 1")).unwrap();
    let last_idx = sends.iter().position(|s| s.text.contains("line number 30")).unwrap();
    assert!(first_idx < last_idx);

    h.manager.stop().await;
}
