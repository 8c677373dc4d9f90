//! Wireless-LE backend.
//!
//! Drives a [`GattLink`] (the host-stack abstraction) through connect,
//! DE1 service discovery with stale-cache retries, CCCD subscription, and
//! the paced write queue from [`crate::queue`]. Characteristic-descriptor
//! details (the `0x0100` CCCD value) stay inside this backend; the
//! transport surface only speaks endpoints and bytes.
//!
//! # Discovery retries
//!
//! Some host stacks return cached, incomplete service tables right after
//! connecting. When discovery completes without the DE1 service, the
//! backend disconnects and retries up to 3 times with a 2 s delay before
//! giving up with an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use decenza_core::Environment;
use tokio::sync::{broadcast, mpsc};

use crate::queue::{CommandQueue, PendingWrite, QueueAction, QueueEvent};
use crate::{EndpointId, TransportCommand, TransportError, TransportEvent, TransportHandle, endpoints};

/// Discovery attempts before the connection is abandoned.
pub const MAX_DISCOVERY_RETRIES: u8 = 3;
/// Delay between discovery attempts.
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// The CCCD value enabling notifications.
const CCCD_ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Events produced by a host-stack link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The physical link is up; discovery may start.
    Connected,
    /// The physical link dropped.
    Disconnected,
    /// Service discovery finished; the DE1 service's characteristics, or
    /// empty when the service was not present.
    ServicesDiscovered {
        /// Characteristic endpoints found under the DE1 service.
        characteristics: Vec<EndpointId>,
    },
    /// A subscribed characteristic changed or a read completed.
    Notification {
        /// Source endpoint.
        endpoint: EndpointId,
        /// Payload.
        data: Bytes,
    },
    /// The host stack confirmed a characteristic write.
    WriteConfirmed {
        /// Target endpoint.
        endpoint: EndpointId,
        /// Written payload.
        data: Bytes,
    },
    /// The host stack reported a characteristic write failure.
    WriteError {
        /// Target endpoint.
        endpoint: EndpointId,
    },
    /// Any other link-level error.
    LinkError {
        /// Human-readable description.
        message: String,
    },
}

/// Host-stack operations the backend needs.
///
/// Submission is decoupled from confirmation: `write_characteristic`
/// returns once the operation is handed to the stack, and the matching
/// [`LinkEvent::WriteConfirmed`] (or `WriteError`) arrives on the event
/// channel. Implementations marshal their callbacks onto the event channel,
/// which delivers them serialized to the backend task.
#[async_trait]
pub trait GattLink: Send + 'static {
    /// Establish the physical link. Completion arrives as
    /// [`LinkEvent::Connected`].
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Start service discovery. Completion arrives as
    /// [`LinkEvent::ServicesDiscovered`].
    async fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Submit a characteristic write.
    async fn write_characteristic(
        &mut self,
        endpoint: EndpointId,
        data: Bytes,
    ) -> Result<(), TransportError>;

    /// Submit a characteristic read; the value arrives as a notification.
    async fn read_characteristic(&mut self, endpoint: EndpointId) -> Result<(), TransportError>;

    /// Write a characteristic descriptor (CCCD subscribe).
    async fn write_cccd(&mut self, endpoint: EndpointId, value: [u8; 2])
    -> Result<(), TransportError>;

    /// Tear down the link. No events follow.
    async fn disconnect(&mut self);
}

/// Wireless transport backend.
pub struct WirelessTransport;

impl WirelessTransport {
    /// Spawn the backend task over a link and return the caller handle.
    ///
    /// The task immediately connects and runs until disconnect or link
    /// loss; a lost connection is terminal for this instance (callers
    /// construct a fresh transport to reconnect).
    pub fn spawn<L, E>(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        env: E,
    ) -> TransportHandle
    where
        L: GattLink,
        E: Environment,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let connected = Arc::new(AtomicBool::new(false));

        // Captured back to back so queue deadlines (durations since queue
        // construction) map onto the tokio clock with negligible skew.
        let origin = tokio::time::Instant::now();
        let queue = CommandQueue::new(env);

        let runtime = Runtime {
            link,
            link_events,
            commands: command_rx,
            events: event_tx.clone(),
            connected: Arc::clone(&connected),
            characteristics: HashSet::new(),
            queue,
            origin,
            discovery_retries: 0,
        };
        tokio::spawn(runtime.run());

        TransportHandle::new(command_tx, event_tx, connected, "wireless")
    }
}

struct Runtime<L: GattLink, E: Environment> {
    link: L,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    characteristics: HashSet<EndpointId>,
    queue: CommandQueue<E>,
    origin: tokio::time::Instant,
    discovery_retries: u8,
}

impl<L: GattLink, E: Environment> Runtime<L, E> {
    async fn run(mut self) {
        if let Err(e) = self.link.connect().await {
            self.emit(TransportEvent::Error { message: e.to_string() });
            self.emit(TransportEvent::Disconnected);
            return;
        }

        loop {
            // Small grace so a Tick delivered marginally before the queue's
            // own clock reaches the deadline doesn't spin the select loop.
            let deadline = self
                .queue
                .next_deadline()
                .map(|d| self.origin + d + Duration::from_millis(1));

            tokio::select! {
                event = self.link_events.recv() => {
                    let Some(event) = event else {
                        self.finish("link event channel closed").await;
                        return;
                    };
                    if !self.handle_link_event(event).await {
                        return;
                    }
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.finish("all transport handles dropped").await;
                        return;
                    };
                    if !self.handle_command(command).await {
                        return;
                    }
                },
                () = sleep_until_opt(deadline) => {
                    let actions = self.queue.process_event(QueueEvent::Tick);
                    self.execute(actions).await;
                },
            }
        }
    }

    /// Returns `false` when the runtime should exit.
    async fn handle_link_event(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Connected => {
                if let Err(e) = self.link.discover_services().await {
                    self.emit(TransportEvent::Error { message: e.to_string() });
                    self.finish("discovery submit failed").await;
                    return false;
                }
            },
            LinkEvent::ServicesDiscovered { characteristics } => {
                if characteristics.is_empty() {
                    return self.retry_discovery().await;
                }
                self.characteristics = characteristics.into_iter().collect();
                self.discovery_retries = 0;
                self.connected.store(true, Ordering::Release);
                tracing::info!(
                    characteristics = self.characteristics.len(),
                    "wireless transport ready"
                );
                self.emit(TransportEvent::Connected);
            },
            LinkEvent::Notification { endpoint, data } => {
                self.emit(TransportEvent::DataReceived { endpoint, data });
            },
            LinkEvent::WriteConfirmed { .. } => {
                let actions = self.queue.process_event(QueueEvent::WriteConfirmed);
                self.execute(actions).await;
            },
            LinkEvent::WriteError { endpoint } => {
                tracing::debug!(%endpoint, "host stack reported write error");
                let actions = self.queue.process_event(QueueEvent::WriteFailed);
                self.execute(actions).await;
            },
            LinkEvent::LinkError { message } => {
                self.emit(TransportEvent::Error { message });
            },
            LinkEvent::Disconnected => {
                self.queue.process_event(QueueEvent::Disconnected);
                self.finish("link dropped").await;
                return false;
            },
        }
        true
    }

    /// Returns `false` when the runtime should exit.
    async fn handle_command(&mut self, command: TransportCommand) -> bool {
        match command {
            TransportCommand::Write { endpoint, data } => {
                if !self.known(endpoint) {
                    return true;
                }
                let actions =
                    self.queue.process_event(QueueEvent::Submit(PendingWrite { endpoint, data }));
                self.execute(actions).await;
            },
            TransportCommand::WriteUrgent { endpoint, data } => {
                if !self.known(endpoint) {
                    return true;
                }
                let actions = self
                    .queue
                    .process_event(QueueEvent::SubmitUrgent(PendingWrite { endpoint, data }));
                self.execute(actions).await;
            },
            TransportCommand::Read { endpoint } => {
                if !self.known(endpoint) {
                    return true;
                }
                if let Err(e) = self.link.read_characteristic(endpoint).await {
                    self.emit(TransportEvent::Error { message: e.to_string() });
                }
            },
            TransportCommand::Subscribe { endpoint } => {
                if !self.known(endpoint) {
                    return true;
                }
                if let Err(e) = self.link.write_cccd(endpoint, CCCD_ENABLE_NOTIFICATIONS).await {
                    // Descriptor write failures are common on some hosts;
                    // log and continue rather than failing the connection.
                    tracing::warn!(%endpoint, error = %e, "CCCD write failed");
                }
            },
            TransportCommand::SubscribeAll => {
                for endpoint in endpoints::NOTIFICATION_SET {
                    if self.known(endpoint) {
                        if let Err(e) =
                            self.link.write_cccd(endpoint, CCCD_ENABLE_NOTIFICATIONS).await
                        {
                            tracing::warn!(%endpoint, error = %e, "CCCD write failed");
                        }
                    }
                }
                for endpoint in
                    [endpoints::VERSION, endpoints::STATE_INFO, endpoints::WATER_LEVELS]
                {
                    if self.known(endpoint) {
                        if let Err(e) = self.link.read_characteristic(endpoint).await {
                            self.emit(TransportEvent::Error { message: e.to_string() });
                        }
                    }
                }
            },
            TransportCommand::ClearQueue => {
                self.queue.process_event(QueueEvent::Clear);
            },
            TransportCommand::Disconnect => {
                self.queue.process_event(QueueEvent::Disconnected);
                self.finish("disconnect requested").await;
                return false;
            },
        }
        true
    }

    async fn retry_discovery(&mut self) -> bool {
        self.discovery_retries += 1;
        if self.discovery_retries > MAX_DISCOVERY_RETRIES {
            self.emit(TransportEvent::Error {
                message: format!(
                    "machine service not found after {MAX_DISCOVERY_RETRIES} retries"
                ),
            });
            self.finish("service discovery exhausted").await;
            return false;
        }
        tracing::debug!(attempt = self.discovery_retries, "service not found, retrying discovery");
        tokio::time::sleep(DISCOVERY_RETRY_DELAY).await;
        if let Err(e) = self.link.discover_services().await {
            self.emit(TransportEvent::Error { message: e.to_string() });
            self.finish("discovery submit failed").await;
            return false;
        }
        true
    }

    async fn execute(&mut self, actions: Vec<QueueAction>) {
        let mut pending: std::collections::VecDeque<QueueAction> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                QueueAction::SubmitWrite(write) => {
                    if let Err(e) =
                        self.link.write_characteristic(write.endpoint, write.data).await
                    {
                        self.emit(TransportEvent::Error { message: e.to_string() });
                        pending.extend(self.queue.process_event(QueueEvent::WriteFailed));
                    }
                },
                QueueAction::EmitWriteComplete(write) => {
                    self.emit(TransportEvent::WriteComplete {
                        endpoint: write.endpoint,
                        data: write.data,
                    });
                },
                QueueAction::DropWrite(write) => {
                    tracing::warn!(endpoint = %write.endpoint, "write dropped after retries");
                },
            }
        }
    }

    fn known(&self, endpoint: EndpointId) -> bool {
        if self.characteristics.contains(&endpoint) {
            return true;
        }
        // Caller bug: no wire traffic for unknown endpoints
        tracing::debug!(%endpoint, "dropping operation on unknown endpoint");
        false
    }

    async fn finish(&mut self, reason: &str) {
        tracing::info!(reason, "wireless transport shutting down");
        self.connected.store(false, Ordering::Release);
        self.link.disconnect().await;
        self.emit(TransportEvent::Disconnected);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use decenza_core::SystemEnv;

    use super::*;

    /// Scripted link: records operations, lets the test inject events.
    #[derive(Clone)]
    struct ScriptedLink {
        ops: Arc<Mutex<Vec<String>>>,
        events: mpsc::UnboundedSender<LinkEvent>,
        service_present: bool,
    }

    impl ScriptedLink {
        fn new(service_present: bool) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self { ops: Arc::new(Mutex::new(Vec::new())), events: tx, service_present },
                rx,
            )
        }

        fn record(&self, op: String) {
            if let Ok(mut ops) = self.ops.lock() {
                ops.push(op);
            }
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().map(|o| o.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl GattLink for ScriptedLink {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.record("connect".into());
            let _ = self.events.send(LinkEvent::Connected);
            Ok(())
        }

        async fn discover_services(&mut self) -> Result<(), TransportError> {
            self.record("discover".into());
            let characteristics = if self.service_present {
                vec![
                    endpoints::VERSION,
                    endpoints::STATE_INFO,
                    endpoints::SHOT_SAMPLE,
                    endpoints::WATER_LEVELS,
                    endpoints::READ_FROM_MMR,
                    endpoints::TEMPERATURES,
                    endpoints::REQUESTED_STATE,
                    endpoints::HEADER_WRITE,
                    endpoints::FRAME_WRITE,
                    endpoints::SHOT_SETTINGS,
                ]
            } else {
                Vec::new()
            };
            let _ = self.events.send(LinkEvent::ServicesDiscovered { characteristics });
            Ok(())
        }

        async fn write_characteristic(
            &mut self,
            endpoint: EndpointId,
            data: Bytes,
        ) -> Result<(), TransportError> {
            self.record(format!("write {endpoint} {}", data.len()));
            // Auto-confirm
            let _ = self.events.send(LinkEvent::WriteConfirmed { endpoint, data });
            Ok(())
        }

        async fn read_characteristic(
            &mut self,
            endpoint: EndpointId,
        ) -> Result<(), TransportError> {
            self.record(format!("read {endpoint}"));
            Ok(())
        }

        async fn write_cccd(
            &mut self,
            endpoint: EndpointId,
            value: [u8; 2],
        ) -> Result<(), TransportError> {
            self.record(format!("cccd {endpoint} {value:02X?}"));
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.record("disconnect".into());
        }
    }

    async fn wait_for<F: Fn(&TransportEvent) -> bool>(
        rx: &mut broadcast::Receiver<TransportEvent>,
        pred: F,
    ) -> TransportEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn connects_and_subscribes() {
        let (link, link_rx) = ScriptedLink::new(true);
        let probe = link.clone();
        let handle = WirelessTransport::spawn(link, link_rx, SystemEnv::new());
        let mut events = handle.events();

        wait_for(&mut events, |e| matches!(e, TransportEvent::Connected)).await;
        assert!(handle.is_connected());

        handle.subscribe_all();
        handle.write(endpoints::REQUESTED_STATE, vec![0x02]);
        wait_for(&mut events, |e| matches!(e, TransportEvent::WriteComplete { .. })).await;

        let ops = probe.ops();
        assert!(ops.iter().any(|op| op.starts_with("cccd A00D")), "STATE_INFO subscribed");
        assert!(ops.iter().any(|op| op.starts_with("cccd A00E")), "SHOT_SAMPLE subscribed");
        assert!(ops.iter().any(|op| op.starts_with("read A001")), "version read");
        assert!(ops.iter().any(|op| op.starts_with("write A002")), "state write submitted");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_service_retries_then_fails() {
        let (link, link_rx) = ScriptedLink::new(false);
        let probe = link.clone();
        let handle = WirelessTransport::spawn(link, link_rx, SystemEnv::new());
        let mut events = handle.events();

        let event =
            wait_for(&mut events, |e| matches!(e, TransportEvent::Error { .. })).await;
        if let TransportEvent::Error { message } = event {
            assert!(message.contains("not found"));
        }
        wait_for(&mut events, |e| matches!(e, TransportEvent::Disconnected)).await;

        // Initial attempt + 3 retries
        let discoveries = probe.ops().iter().filter(|op| *op == "discover").count();
        assert_eq!(discoveries, 4);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn unknown_endpoint_yields_no_wire_traffic() {
        let (link, link_rx) = ScriptedLink::new(true);
        let probe = link.clone();
        let handle = WirelessTransport::spawn(link, link_rx, SystemEnv::new());
        let mut events = handle.events();
        wait_for(&mut events, |e| matches!(e, TransportEvent::Connected)).await;

        let bogus = EndpointId::from_short(0xBEEF);
        handle.write(bogus, vec![1, 2, 3]);
        handle.disconnect();
        wait_for(&mut events, |e| matches!(e, TransportEvent::Disconnected)).await;

        assert!(!probe.ops().iter().any(|op| op.contains("BEEF")));
    }
}
