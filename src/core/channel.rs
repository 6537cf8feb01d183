//! Channel contract: what every event source must provide to the router.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::executor::RunOutcome;
use crate::core::output::Verbosity;
use crate::core::stream::StreamEvent;

/// One inbound unit of work. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub session_key: String,
    pub prompt: String,
    pub payload: Value,
}

impl ChannelEvent {
    pub fn new(session_key: impl Into<String>, prompt: impl Into<String>, payload: Value) -> Self {
        Self {
            session_key: session_key.into(),
            prompt: prompt.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// No locking; events run fully in parallel.
    None,
    /// One event at a time for the whole channel.
    Global,
    /// One event at a time per session key.
    Session,
}

impl ConcurrencyPolicy {
    pub fn lock_key(self, channel: &str, event: &ChannelEvent) -> Option<String> {
        match self {
            ConcurrencyPolicy::None => None,
            ConcurrencyPolicy::Global => Some(channel.to_string()),
            ConcurrencyPolicy::Session => Some(event.session_key.clone()),
        }
    }
}

/// Where a channel sends rendered output for one event.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;

    /// Whether [`ChannelSink::working`] renders anything.
    fn has_working_indicator(&self) -> bool {
        false
    }

    /// Keep-alive tick (typing indicator, progress dot, ...).
    async fn working(&self) {}

    /// Completion signal, delivered at most once per event.
    async fn completed(&self, _success: bool) {}
}

/// Receives the worker's stream for one event.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_event(&self, event: &StreamEvent);

    /// Called once after the worker is gone, whatever the reason.
    async fn on_finish(&self, outcome: &RunOutcome);
}

/// Handed to a listener; every event it produces goes through here, keyed by
/// the channel's own [`ChannelDefinition::session_key`].
#[derive(Clone)]
pub struct EventSender {
    definition: Arc<dyn ChannelDefinition>,
    tx: mpsc::UnboundedSender<(String, ChannelEvent)>,
}

impl EventSender {
    pub fn new(definition: Arc<dyn ChannelDefinition>, tx: mpsc::UnboundedSender<(String, ChannelEvent)>) -> Self {
        Self { definition, tx }
    }

    pub fn session_key(&self, payload: &Value) -> String {
        self.definition.session_key(payload)
    }

    /// False once the router has shut down.
    pub fn emit(&self, prompt: impl Into<String>, payload: Value) -> bool {
        let event = ChannelEvent::new(self.session_key(&payload), prompt, payload);
        self.tx
            .send((self.definition.name().to_string(), event))
            .is_ok()
    }
}

/// Stops a running listener when stopped or dropped. The listener task
/// watches the token and tears its transport down itself.
pub struct ListenerHandle {
    token: CancellationToken,
}

impl ListenerHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn stop(self) {
        self.token.cancel();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Static capability descriptor of one event source.
#[async_trait]
pub trait ChannelDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn concurrency(&self) -> ConcurrencyPolicy;

    /// Whether `/reset`, `/stop` and friends are intercepted for this channel.
    fn accepts_commands(&self) -> bool {
        false
    }

    /// Begin producing events. Must not block beyond setup.
    async fn start_listener(&self, events: EventSender) -> Result<ListenerHandle>;

    /// Build a fresh output handler for one event.
    fn create_handler(&self, event: &ChannelEvent, verbosity: Verbosity) -> Arc<dyn StreamHandler>;

    /// Pure function from a raw payload to its session key.
    fn session_key(&self, payload: &Value) -> String;

    /// Out-of-band reply for router notices (command results, busy session).
    async fn notify(&self, event: &ChannelEvent, text: &str) -> Result<()> {
        tracing::info!("[{}] {}: {}", self.name(), event.session_key, text);
        Ok(())
    }
}
