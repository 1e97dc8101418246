//! Chat platform adapter contract.
//!
//! The core never speaks a platform wire protocol. An adapter exposes an
//! async stream of inbound events plus an outbound surface for replies,
//! indicators, history, and uploads. Lifecycle transitions arrive as
//! control events on the same stream. Concrete adapters (socket handling,
//! reconnection, auth) live outside this crate and are constructed at
//! startup from configuration — there is no runtime "maybe-present"
//! dependency.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One inbound chat message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    /// Thread the message belongs to; `None` for top-level messages.
    pub thread: Option<String>,
    /// Platform identifier of this message (e.g. a timestamp). A reply to
    /// a top-level message threads under this ID.
    pub message_id: String,
    pub user: Option<String>,
    pub text: String,
    /// Whether the message explicitly addresses the bot.
    pub mentions_bot: bool,
}

/// Connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Error { message: String },
}

/// Everything an adapter can deliver.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(InboundMessage),
    Control(ControlEvent),
}

/// A single bidirectional connection to one chat platform.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Platform name used in routing, trigger types, and state paths
    /// (e.g. `slack`). Must match the identifier pattern.
    fn platform(&self) -> &str;

    /// Hard per-message size limit the platform imposes.
    fn max_message_len(&self) -> usize {
        4000
    }

    /// Whether the platform has real threads. Threadless platforms key
    /// conversations by channel instead.
    fn supports_threads(&self) -> bool {
        true
    }

    /// Open the connection and return the inbound event stream. The
    /// adapter owns reconnection; the stream stays alive across drops of
    /// the underlying socket.
    async fn connect(&self) -> Result<mpsc::Receiver<ChatEvent>>;

    async fn disconnect(&self);

    /// Send a message, returning its platform ID once acknowledged.
    async fn send_message(&self, channel: &str, thread: Option<&str>, text: &str)
        -> Result<String>;

    /// Show or clear a processing indicator (typing where supported,
    /// otherwise a transient reaction).
    async fn set_indicator(&self, channel: &str, thread: Option<&str>, active: bool)
        -> Result<()>;

    /// Recent channel back-scroll, newest last.
    async fn fetch_history(&self, channel: &str, limit: usize) -> Result<Vec<InboundMessage>>;

    /// Upload a file into a channel or thread.
    async fn upload_file(
        &self,
        channel: &str,
        thread: Option<&str>,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<()>;
}
