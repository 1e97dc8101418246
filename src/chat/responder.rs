//! Streaming reply assembly.
//!
//! Agent output arrives as a stream of assistant messages; platforms want
//! bounded, formatted, ordered posts. The responder buffers text, converts
//! provider markdown to platform formatting, splits on the platform size
//! limit, and emits each chunk only after the previous send acknowledged.
//! One responder serves exactly one turn, and the chat manager serializes
//! turns per thread, so output from different turns never interleaves.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::chat::adapter::ChatAdapter;
use crate::error::{classify_chat_error, ChatErrorKind, Result};

/// Transient send failures retry this many times with doubling delays.
const SEND_RETRIES: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_millis(500);

static BOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("valid bold regex"));
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("valid link regex"));

/// Convert provider markdown to the platform's native formatting:
/// `**bold**` becomes `*bold*` and `[title](url)` becomes `<url|title>`.
pub fn to_platform_format(text: &str) -> String {
    let text = BOLD_RE.replace_all(text, "*$1*");
    LINK_RE.replace_all(&text, "<$2|$1>").into_owned()
}

/// Split `text` into chunks of at most `limit` characters, preferring
/// newline and then space boundaries over hard cuts.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    debug_assert!(limit > 0);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let window: String = rest.chars().take(limit).collect();
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window.len());
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail.trim_start_matches(['\n', ' ']);
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Emits one turn's assistant output to one channel/thread in order.
pub struct StreamingResponder {
    adapter: Arc<dyn ChatAdapter>,
    channel: String,
    thread: Option<String>,
    sent_any: bool,
}

impl StreamingResponder {
    pub fn new(adapter: Arc<dyn ChatAdapter>, channel: String, thread: Option<String>) -> Self {
        Self {
            adapter,
            channel,
            thread,
            sent_any: false,
        }
    }

    /// Format, split, and send one complete assistant message. Each chunk
    /// waits for the previous acknowledgement, preserving order.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        let formatted = to_platform_format(text);
        if formatted.trim().is_empty() {
            return Ok(());
        }

        for chunk in split_message(&formatted, self.adapter.max_message_len()) {
            self.send_chunk(&chunk).await?;
            self.sent_any = true;
        }
        Ok(())
    }

    /// One acknowledged send. Rate-limit and network failures back off and
    /// retry; auth and API failures surface immediately.
    async fn send_chunk(&self, chunk: &str) -> Result<()> {
        let mut delay = SEND_BACKOFF;
        let mut attempt = 0;
        loop {
            match self
                .adapter
                .send_message(&self.channel, self.thread.as_deref(), chunk)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let kind = classify_chat_error(&e.to_string());
                    let transient = matches!(
                        kind,
                        ChatErrorKind::RateLimit | ChatErrorKind::Network
                    );
                    if !transient || attempt >= SEND_RETRIES {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        channel = %self.channel,
                        attempt,
                        ?kind,
                        "send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    /// Best-effort variant used mid-stream: a failed send is logged so one
    /// flaky post never kills the turn.
    pub async fn send_best_effort(&mut self, text: &str) {
        if let Err(e) = self.send(text).await {
            warn!(channel = %self.channel, error = %e, "streamed reply send failed");
        }
    }

    pub fn sent_any(&self) -> bool {
        self.sent_any
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bold_transform() {
        assert_eq!(to_platform_format("use **cargo test** now"), "use *cargo test* now");
        assert_eq!(to_platform_format("**a** and **b**"), "*a* and *b*");
    }

    #[test]
    fn test_link_transform() {
        assert_eq!(
            to_platform_format("see [the docs](https://example.com/x)"),
            "see <https://example.com/x|the docs>"
        );
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "nothing *special* here_ 1 < 2";
        assert_eq!(to_platform_format(text), text);
    }

    #[test]
    fn test_split_short_text_is_single_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
        assert!(split_message("", 100).is_empty());
    }

    #[test]
    fn test_split_prefers_newlines() {
        let text = "first line\nsecond line\nthird line";
        let chunks = split_message(text, 15);
        assert_eq!(chunks[0], "first line");
        assert!(chunks.iter().all(|c| c.chars().count() <= 15));
        assert_eq!(chunks.join(" ").replace('\n', " "), text.replace('\n', " "));
    }

    #[test]
    fn test_split_hard_cut_without_boundaries() {
        let text = "x".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_split_respects_multibyte_boundaries() {
        let text = "héllo wörld ".repeat(20);
        for chunk in split_message(&text, 16) {
            assert!(chunk.chars().count() <= 16);
        }
    }

    use crate::chat::adapter::{ChatEvent, InboundMessage};
    use crate::error::FleetError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Fails the first N sends with the given message, then succeeds.
    struct FlakyAdapter {
        failures_left: Mutex<u32>,
        failure: String,
        sent: Mutex<Vec<String>>,
    }

    impl FlakyAdapter {
        fn new(failures: u32, failure: &str) -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(failures),
                failure: failure.to_string(),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatAdapter for FlakyAdapter {
        fn platform(&self) -> &str {
            "slack"
        }

        async fn connect(&self) -> Result<mpsc::Receiver<ChatEvent>> {
            let (_, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn disconnect(&self) {}

        async fn send_message(&self, _: &str, _: Option<&str>, text: &str) -> Result<String> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(FleetError::ChatPlatform {
                    kind: classify_chat_error(&self.failure),
                    message: self.failure.clone(),
                    source: None,
                });
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok("m1".to_string())
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

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_sends_back_off_and_recover() {
        let adapter = FlakyAdapter::new(2, "ratelimited");
        let mut responder =
            StreamingResponder::new(adapter.clone(), "C1".to_string(), Some("T1".to_string()));

        responder.send("hello").await.unwrap();
        assert_eq!(adapter.sent.lock().unwrap().as_slice(), ["hello"]);
        assert!(responder.sent_any());
    }

    #[tokio::test]
    async fn test_auth_failures_are_not_retried() {
        let adapter = FlakyAdapter::new(1, "invalid_auth");
        let mut responder =
            StreamingResponder::new(adapter.clone(), "C1".to_string(), None);

        assert!(responder.send("hello").await.is_err());
        assert!(adapter.sent.lock().unwrap().is_empty());
        assert!(!responder.sent_any());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_rate_limit_eventually_surfaces() {
        let adapter = FlakyAdapter::new(10, "ratelimited");
        let mut responder =
            StreamingResponder::new(adapter.clone(), "C1".to_string(), None);

        assert!(responder.send("hello").await.is_err());
        assert!(adapter.sent.lock().unwrap().is_empty());
    }
}
