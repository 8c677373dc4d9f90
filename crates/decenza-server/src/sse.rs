//! Server-Sent Events hub.
//!
//! Each topic (layout, theme) keeps a set of subscriber channels. A
//! broadcast writes one `data: <json>\n\n` frame to every subscriber in
//! source order; a subscriber whose connection died is dropped from the
//! set at the next send.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Topics with SSE endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SseTopic {
    /// Layout editor change stream (`/events/layout`).
    Layout,
    /// Theme change stream (`/events/theme`).
    Theme,
}

/// The preamble every SSE response starts with.
pub const SSE_RESPONSE_HEADER: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Cache-Control: no-cache\r\n\
    Connection: keep-alive\r\n\r\n";

/// Frame one payload as an SSE data event.
#[must_use]
pub fn frame(payload: &serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

/// Subscriber registry per topic.
#[derive(Debug, Default)]
pub struct SseHub {
    subscribers: Mutex<HashMap<SseTopic, Vec<mpsc::UnboundedSender<String>>>>,
}

impl SseHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber; frames arrive on the returned receiver.
    pub fn subscribe(&self, topic: SseTopic) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut map) = self.subscribers.lock() {
            map.entry(topic).or_default().push(tx);
        }
        rx
    }

    /// Broadcast one payload to every live subscriber of a topic.
    ///
    /// Dead subscribers (dropped receivers) are removed here.
    pub fn broadcast(&self, topic: SseTopic, payload: &serde_json::Value) {
        let text = frame(payload);
        if let Ok(mut map) = self.subscribers.lock() {
            if let Some(senders) = map.get_mut(&topic) {
                senders.retain(|tx| tx.send(text.clone()).is_ok());
            }
        }
    }

    /// Current subscriber count for a topic (diagnostics/tests).
    #[must_use]
    pub fn subscriber_count(&self, topic: SseTopic) -> usize {
        self.subscribers
            .lock()
            .map(|map| map.get(&topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}
