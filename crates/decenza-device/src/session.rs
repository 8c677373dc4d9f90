//! Session runtime.
//!
//! Wires a [`SessionDriver`] to a live transport: transport events feed the
//! driver, driver commands go back out on the transport, and device events
//! fan out on a broadcast channel. Control requests arrive on a command
//! channel so callers never block on the session task.

use decenza_codec::Profile;
use decenza_transport::{TransportCommand, TransportEvent, TransportHandle};
use tokio::sync::{broadcast, mpsc};

use crate::driver::{
    DeviceEvent, SessionDriver, SessionInput, SessionOutput, SessionPhase, ShotSettings,
};
use crate::state::MachineState;

/// The session task plus its caller handle.
pub struct DeviceSession;

/// Control requests accepted by the session.
#[derive(Debug, Clone)]
enum SessionRequest {
    RequestState(MachineState),
    UploadProfile(Box<Profile>),
    SetShotSettings(ShotSettings),
    Disconnect,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct DeviceSessionHandle {
    requests: mpsc::UnboundedSender<SessionRequest>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceSessionHandle {
    /// Subscribe to device events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Request a machine state.
    pub fn request_state(&self, state: MachineState) {
        self.send(SessionRequest::RequestState(state));
    }

    /// Start pulling a shot.
    pub fn start_espresso(&self) {
        self.request_state(MachineState::Espresso);
    }

    /// Start steaming.
    pub fn start_steam(&self) {
        self.request_state(MachineState::Steam);
    }

    /// Start dispensing hot water.
    pub fn start_hot_water(&self) {
        self.request_state(MachineState::HotWater);
    }

    /// Start a group flush.
    pub fn start_flush(&self) {
        self.request_state(MachineState::HotWaterRinse);
    }

    /// Stop the current operation.
    pub fn stop_operation(&self) {
        self.request_state(MachineState::Idle);
    }

    /// Put the machine to sleep.
    pub fn go_to_sleep(&self) {
        self.request_state(MachineState::Sleep);
    }

    /// Wake the machine.
    pub fn wake_up(&self) {
        self.request_state(MachineState::Idle);
    }

    /// Upload a profile; completion arrives as
    /// [`DeviceEvent::ProfileUploaded`].
    pub fn upload_profile(&self, profile: Profile) {
        self.send(SessionRequest::UploadProfile(Box::new(profile)));
    }

    /// Send shot settings.
    pub fn set_shot_settings(&self, settings: ShotSettings) {
        self.send(SessionRequest::SetShotSettings(settings));
    }

    /// Disconnect from the machine.
    pub fn disconnect(&self) {
        self.send(SessionRequest::Disconnect);
    }

    fn send(&self, request: SessionRequest) {
        if self.requests.send(request).is_err() {
            tracing::debug!("session request dropped: task gone");
        }
    }
}

impl DeviceSession {
    /// Attach a session to a transport and spawn its task.
    ///
    /// The handshake starts immediately. A transport that is already
    /// connected (serial) is configured right away; otherwise the session
    /// waits for the transport's connected event.
    pub fn attach(transport: TransportHandle) -> DeviceSessionHandle {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(512);

        let task = SessionTask {
            transport: transport.clone(),
            transport_events: transport.events(),
            requests: request_rx,
            events: event_tx.clone(),
            driver: SessionDriver::new(),
        };
        tokio::spawn(task.run());

        DeviceSessionHandle { requests: request_tx, events: event_tx }
    }
}

struct SessionTask {
    transport: TransportHandle,
    transport_events: broadcast::Receiver<TransportEvent>,
    requests: mpsc::UnboundedReceiver<SessionRequest>,
    events: broadcast::Sender<DeviceEvent>,
    driver: SessionDriver,
}

impl SessionTask {
    async fn run(mut self) {
        self.apply(SessionInput::ConnectRequested);
        if self.transport.is_connected() {
            // Serial connects synchronously; its connected event may have
            // fired before we subscribed.
            self.apply(SessionInput::TransportConnected);
        }

        loop {
            tokio::select! {
                event = self.transport_events.recv() => {
                    match event {
                        Ok(event) => {
                            if !self.handle_transport_event(event) {
                                return;
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "session lagged behind transport events");
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            self.apply(SessionInput::TransportDisconnected);
                            return;
                        },
                    }
                },
                request = self.requests.recv() => {
                    let Some(request) = request else { return };
                    if !self.handle_request(request) {
                        return;
                    }
                },
            }
        }
    }

    /// Returns `false` when the session should stop.
    fn handle_transport_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connected => {
                if self.driver.phase() != SessionPhase::Ready {
                    self.apply(SessionInput::TransportConnected);
                }
                true
            },
            TransportEvent::Disconnected => {
                self.apply(SessionInput::TransportDisconnected);
                false
            },
            TransportEvent::DataReceived { endpoint, data } => {
                self.apply(SessionInput::Data { endpoint, data });
                true
            },
            TransportEvent::WriteComplete { endpoint, .. } => {
                self.apply(SessionInput::WriteCompleted { endpoint });
                true
            },
            TransportEvent::Error { message } => {
                tracing::warn!(message, "transport error");
                true
            },
        }
    }

    /// Returns `false` when the session should stop.
    fn handle_request(&mut self, request: SessionRequest) -> bool {
        match request {
            SessionRequest::RequestState(state) => {
                self.apply(SessionInput::RequestState(state));
                true
            },
            SessionRequest::UploadProfile(profile) => {
                self.apply(SessionInput::UploadProfile(*profile));
                true
            },
            SessionRequest::SetShotSettings(settings) => {
                self.apply(SessionInput::SetShotSettings(settings));
                true
            },
            SessionRequest::Disconnect => {
                self.apply(SessionInput::DisconnectRequested);
                false
            },
        }
    }

    fn apply(&mut self, input: SessionInput) {
        for output in self.driver.process(input) {
            match output {
                SessionOutput::Command(command) => self.issue(command),
                SessionOutput::Emit(event) => {
                    let _ = self.events.send(event);
                },
            }
        }
    }

    fn issue(&self, command: TransportCommand) {
        match command {
            TransportCommand::Write { endpoint, data } => self.transport.write(endpoint, data),
            TransportCommand::WriteUrgent { endpoint, data } => {
                self.transport.write_urgent(endpoint, data);
            },
            TransportCommand::Read { endpoint } => self.transport.read(endpoint),
            TransportCommand::Subscribe { endpoint } => self.transport.subscribe(endpoint),
            TransportCommand::SubscribeAll => self.transport.subscribe_all(),
            TransportCommand::ClearQueue => self.transport.clear_queue(),
            TransportCommand::Disconnect => self.transport.disconnect(),
        }
    }
}
