//! Transport bridge
//!
//! Carries [`HmrUpdateMessage`]s to the live test host and relays the
//! host's lifecycle events back. The bridge itself is channel-agnostic:
//! a concrete channel ([`websocket`] or [`ipc`]) calls [`TransportBridge::connect`]
//! when a host attaches, forwards the frames it takes from the returned
//! [`HostLink`], feeds incoming text to [`TransportBridge::deliver`], and
//! hands undelivered frames back through [`TransportBridge::disconnect`].
//!
//! While no host is attached frames wait in an outbox and are flushed in
//! their original order on the next connection. When a newer host replaces
//! the current one, frames the old channel has not taken yet move to the
//! new link ahead of anything sent afterwards.

pub mod ipc;
pub mod websocket;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::classifier::UpdateKind;
use crate::error::{Error, Result};

/// Update pushed to the host, one per rebuilt output per pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmrUpdateMessage {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Output path the host imports and tags suites with
    pub path: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// New module text; absent when the path was removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Test identities whose specs should re-run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_tests: Option<Vec<String>>,
    pub reason: String,
}

impl HmrUpdateMessage {
    /// Whether this message announces a removal rather than new content
    pub fn is_removal(&self) -> bool {
        self.content.is_none()
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Messages originating in the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// Host applied the last update (or finished booting)
    #[serde(rename = "hmr:ready")]
    Ready,
    /// Host failed to apply an update
    #[serde(rename = "hmr:error")]
    Error { error: String },
    #[serde(rename = "started")]
    Started {
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "suiteStarted")]
    SuiteStarted {
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "specStarted")]
    SpecStarted {
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "specDone")]
    SpecDone {
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "suiteDone")]
    SuiteDone {
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "done")]
    Done {
        #[serde(default)]
        result: Value,
    },
    /// The run was cut short inside the host
    #[serde(rename = "testsAborted")]
    TestsAborted {
        #[serde(default)]
        message: Option<String>,
    },
}

impl HostMessage {
    /// Wire name of the message type
    pub fn name(&self) -> &'static str {
        match self {
            HostMessage::Ready => "hmr:ready",
            HostMessage::Error { .. } => "hmr:error",
            HostMessage::Started { .. } => "started",
            HostMessage::SuiteStarted { .. } => "suiteStarted",
            HostMessage::SpecStarted { .. } => "specStarted",
            HostMessage::SpecDone { .. } => "specDone",
            HostMessage::SuiteDone { .. } => "suiteDone",
            HostMessage::Done { .. } => "done",
            HostMessage::TestsAborted { .. } => "testsAborted",
        }
    }
}

type HostHandler = Box<dyn Fn(&HostMessage) + Send + Sync>;

#[derive(Default)]
struct LinkFrames {
    frames: VecDeque<String>,
    closed: bool,
}

/// Frames waiting for one host connection
#[derive(Default)]
struct LinkQueue {
    state: Mutex<LinkFrames>,
    ready: Notify,
}

impl LinkQueue {
    /// Queue a frame, or hand it back if the link is closed
    fn push(&self, frame: String) -> std::result::Result<(), String> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(frame);
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Close the link and take whatever it still holds
    fn close(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.closed = true;
        let left = state.frames.drain(..).collect();
        drop(state);
        self.ready.notify_one();
        left
    }
}

/// Receiving end handed to a channel when a host attaches
pub struct HostLink {
    pub id: u64,
    queue: Arc<LinkQueue>,
}

impl std::fmt::Debug for HostLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLink")
            .field("id", &self.id)
            .field("pending", &self.queue.state.lock().frames.len())
            .finish()
    }
}

impl HostLink {
    /// Next frame for the host; `None` once the link was replaced or the
    /// bridge closed. Cancel safe.
    pub async fn recv(&mut self) -> Option<String> {
        let queue = self.queue.clone();
        loop {
            let notified = queue.ready.notified();
            {
                let mut state = queue.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Next frame if one is already queued
    pub fn try_recv(&mut self) -> Option<String> {
        self.queue.state.lock().frames.pop_front()
    }

    /// Collect every frame the channel took but never wrote, oldest first.
    ///
    /// `in_flight` is a frame already pulled from the link whose write failed.
    pub fn into_unsent(self, in_flight: Option<String>) -> Vec<String> {
        let mut unsent: Vec<String> = in_flight.into_iter().collect();
        unsent.extend(self.queue.close());
        unsent
    }
}

impl Drop for HostLink {
    fn drop(&mut self) {
        self.queue.state.lock().closed = true;
    }
}

struct Link {
    id: u64,
    queue: Arc<LinkQueue>,
}

#[derive(Default)]
struct BridgeState {
    outbox: VecDeque<String>,
    link: Option<Link>,
    next_link: u64,
    closed: bool,
}

#[derive(Default)]
struct BridgeInner {
    state: Mutex<BridgeState>,
    handlers: Mutex<Vec<HostHandler>>,
}

/// Ordered, queue-while-disconnected message bridge to the test host
#[derive(Clone, Default)]
pub struct TransportBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for TransportBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransportBridge")
            .field("queued", &state.outbox.len())
            .field("connected", &state.link.as_ref().map(|l| l.id))
            .field("closed", &state.closed)
            .field("handlers", &format!("<{} handlers>", self.inner.handlers.lock().len()))
            .finish()
    }
}

impl TransportBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an update toward the host; fire-and-forget
    pub fn send(&self, message: &HmrUpdateMessage) {
        match serde_json::to_string(message) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!(path = %message.path, "cannot serialise update message: {}", e),
        }
    }

    fn send_frame(&self, frame: String) {
        let mut state = self.inner.state.lock();
        if state.closed {
            debug!("bridge closed, dropping frame");
            return;
        }
        let frame = match &state.link {
            Some(link) => match link.queue.push(frame) {
                Ok(()) => return,
                Err(frame) => frame,
            },
            None => frame,
        };
        if state.link.take().is_some() {
            debug!("host link went away, queueing");
        }
        state.outbox.push_back(frame);
    }

    /// Attach a host: queued frames are moved onto the new link in order.
    ///
    /// A newer connection replaces the current one and inherits the frames
    /// its channel had not taken yet, ahead of the outbox.
    pub fn connect(&self) -> HostLink {
        let queue = Arc::new(LinkQueue::default());
        let mut state = self.inner.state.lock();
        state.next_link += 1;
        let id = state.next_link;

        let mut frames = VecDeque::new();
        if let Some(old) = state.link.take() {
            frames.extend(old.queue.close());
            info!(old = old.id, new = id, carried = frames.len(), "host connection replaced");
        }
        frames.extend(state.outbox.drain(..));
        let flushed = frames.len();
        queue.state.lock().frames = frames;
        queue.ready.notify_one();

        state.link = Some(Link {
            id,
            queue: queue.clone(),
        });
        info!(link = id, flushed, "host connected");
        HostLink { id, queue }
    }

    /// Detach host `id`, returning its unsent frames to the bridge.
    ///
    /// Frames from the current link go back to the front of the outbox so
    /// the next host sees them first. A replaced link already handed its
    /// queue to the newer host; a frame it failed to write can no longer be
    /// placed in order and is dropped.
    pub fn disconnect(&self, id: u64, unsent: Vec<String>) {
        let mut state = self.inner.state.lock();
        let current = state.link.as_ref().map(|l| l.id);
        if current == Some(id) {
            if let Some(link) = state.link.take() {
                link.queue.close();
            }
            if !state.closed {
                for frame in unsent.into_iter().rev() {
                    state.outbox.push_front(frame);
                }
            }
            info!(link = id, queued = state.outbox.len(), "host disconnected");
            return;
        }

        debug!(link = id, "stale host link closed");
        if !unsent.is_empty() {
            warn!(link = id, dropped = unsent.len(), "replaced host link left unwritten frames");
        }
    }

    /// Parse a frame from the host and dispatch it to every handler in registration order
    pub fn deliver(&self, raw: &str) -> Result<HostMessage> {
        let message: HostMessage = serde_json::from_str(raw).map_err(|e| {
            warn!("unrecognised host message: {}", e);
            Error::transport(format!("invalid host message: {}", e))
        })?;
        self.dispatch(&message);
        Ok(message)
    }

    /// Dispatch an already-decoded host message
    pub fn dispatch(&self, message: &HostMessage) {
        debug!(kind = message.name(), "host message");
        for handler in self.inner.handlers.lock().iter() {
            handler(message);
        }
    }

    /// Register a handler for host messages
    pub fn on_host_message<F>(&self, handler: F)
    where
        F: Fn(&HostMessage) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().push(Box::new(handler));
    }

    /// Whether a host is currently attached
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    /// Frames waiting for a host
    pub fn queued(&self) -> usize {
        self.inner.state.lock().outbox.len()
    }

    /// Stop accepting frames and release the host link.
    ///
    /// Returns how many frames were never delivered.
    pub fn close(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let mut dropped = state.link.take().map_or(0, |link| link.queue.close().len());
        dropped += state.outbox.len();
        state.outbox.clear();
        if dropped > 0 {
            warn!(dropped, "closing bridge with undelivered updates");
        }
        dropped
    }
}
