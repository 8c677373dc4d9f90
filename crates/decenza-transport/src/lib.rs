//! Endpoint-addressed transport to the DE1.
//!
//! A [`Transport`] is a bidirectional channel addressed by [`EndpointId`]s,
//! with two concrete backends:
//!
//! - [`wireless::WirelessTransport`]: LE host-stack backend with service
//!   discovery, CCCD subscription, and a paced FIFO command queue.
//! - [`serial::SerialTransport`]: CDC-ACM backend speaking the ASCII line
//!   protocol (`<LETTER>HEX\n` writes, `[LETTER]HEX\n` notifications).
//!
//! The binary payloads are identical on both; the device session never
//! knows which backend carries them.
//!
//! # Architecture
//!
//! The wireless command queue is a pure driver ([`queue::CommandQueue`]):
//! events in, actions out, no I/O, deterministic under a manual clock. The
//! backend runtimes execute the actions against the host stack or the
//! serial port and publish [`TransportEvent`]s on a broadcast channel.

pub mod endpoint;
pub mod queue;
pub mod serial;
pub mod watcher;
pub mod wireless;

use bytes::Bytes;
pub use endpoint::{EndpointId, SERVICE, endpoints};

/// Errors surfaced by the transport backends.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying link failed (I/O error, connection dropped).
    #[error("link error: {0}")]
    Link(String),
    /// Service discovery did not find the DE1 service.
    #[error("service discovery failed: {0}")]
    Discovery(String),
    /// The serial port could not be opened or configured.
    #[error("serial port error: {0}")]
    Port(String),
}

/// Events published by a transport.
///
/// Mirrors the upward signal surface: connection lifecycle, inbound data,
/// write confirmations, and errors.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport is connected and ready for I/O.
    Connected,
    /// The connection was lost or closed.
    Disconnected,
    /// Data arrived from an endpoint (notification or read response).
    DataReceived {
        /// Source endpoint.
        endpoint: EndpointId,
        /// Raw binary payload.
        data: Bytes,
    },
    /// A write was confirmed by the far side (or synthesized on serial).
    WriteComplete {
        /// Target endpoint.
        endpoint: EndpointId,
        /// The data that was written.
        data: Bytes,
    },
    /// A transport error occurred.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// Commands accepted by a transport.
///
/// Both backends are driven through a command channel so callers never
/// block on wire I/O; unknown endpoints are logged and dropped inside the
/// backend (a caller bug, not an error).
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Queue a write to an endpoint.
    Write {
        /// Target endpoint.
        endpoint: EndpointId,
        /// Payload bytes.
        data: Bytes,
    },
    /// Flush the queue and write immediately (stop-at-weight path).
    WriteUrgent {
        /// Target endpoint.
        endpoint: EndpointId,
        /// Payload bytes.
        data: Bytes,
    },
    /// Request a read; the value arrives as [`TransportEvent::DataReceived`].
    Read {
        /// Endpoint to read.
        endpoint: EndpointId,
    },
    /// Subscribe to notifications from one endpoint.
    Subscribe {
        /// Endpoint to subscribe.
        endpoint: EndpointId,
    },
    /// Subscribe the standard notification set and read initial values.
    SubscribeAll,
    /// Drop all queued writes (extraction start).
    ClearQueue,
    /// Disconnect and release resources.
    Disconnect,
}

/// Handle to a running transport backend.
///
/// Cloneable; commands funnel into the backend task and events fan out of
/// a broadcast channel. Dropping all handles does not stop the backend;
/// send [`TransportCommand::Disconnect`] for that.
#[derive(Clone)]
pub struct TransportHandle {
    commands: tokio::sync::mpsc::UnboundedSender<TransportCommand>,
    events: tokio::sync::broadcast::Sender<TransportEvent>,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
    name: &'static str,
}

impl TransportHandle {
    pub(crate) fn new(
        commands: tokio::sync::mpsc::UnboundedSender<TransportCommand>,
        events: tokio::sync::broadcast::Sender<TransportEvent>,
        connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
        name: &'static str,
    ) -> Self {
        Self { commands, events, connected, name }
    }

    /// Queue a write.
    pub fn write(&self, endpoint: EndpointId, data: impl Into<Bytes>) {
        self.send(TransportCommand::Write { endpoint, data: data.into() });
    }

    /// Flush the queue and write immediately.
    pub fn write_urgent(&self, endpoint: EndpointId, data: impl Into<Bytes>) {
        self.send(TransportCommand::WriteUrgent { endpoint, data: data.into() });
    }

    /// Request a read.
    pub fn read(&self, endpoint: EndpointId) {
        self.send(TransportCommand::Read { endpoint });
    }

    /// Subscribe to one endpoint's notifications.
    pub fn subscribe(&self, endpoint: EndpointId) {
        self.send(TransportCommand::Subscribe { endpoint });
    }

    /// Subscribe the standard notification set.
    pub fn subscribe_all(&self) {
        self.send(TransportCommand::SubscribeAll);
    }

    /// Drop all queued writes.
    pub fn clear_queue(&self) {
        self.send(TransportCommand::ClearQueue);
    }

    /// Disconnect and release resources.
    pub fn disconnect(&self) {
        self.send(TransportCommand::Disconnect);
    }

    /// Whether the transport is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Human-readable backend name for logs ("wireless" or "serial").
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Subscribe to transport events.
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: TransportCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(transport = self.name, "command dropped: backend task gone");
        }
    }
}
