//! Session driver.
//!
//! Pure state machine for the device session: transport events and control
//! requests in, transport commands and typed device events out. No I/O and
//! no clocks live here, which is what makes the handshake testable as a
//! plain event-sequence assertion.
//!
//! # Session phases
//!
//! `Disconnected → Connecting → Discovering → Configuring → Ready`, with
//! `Ready → Disconnected` on transport loss. `Connecting` is entered by the
//! connect request and cleared on error or loss. The transport performs
//! service discovery itself, so the driver moves `Connecting → Discovering`
//! when the request is issued and `Discovering → Configuring` when the
//! transport reports connected; it reaches `Ready` once the handshake
//! writes (subscriptions, initial reads, wake profile, default shot
//! settings) have been issued.

use bytes::Bytes;
use decenza_codec::{Profile, fixed, wire};
use decenza_transport::{EndpointId, TransportCommand, endpoints};

use crate::parser;
use crate::state::{MachineState, MachineSubState};

/// GHC info register in the memory-mapped region.
const MMR_GHC_INFO_ADDR: u32 = 0x80_381C;

/// Default shot settings sent during the handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotSettings {
    /// Steam temperature in Celsius.
    pub steam_temp: f64,
    /// Steam timeout in seconds.
    pub steam_duration: u32,
    /// Hot water temperature in Celsius.
    pub hot_water_temp: f64,
    /// Hot water volume in mL.
    pub hot_water_volume: u32,
    /// Group head temperature in Celsius.
    pub group_temp: f64,
}

impl Default for ShotSettings {
    fn default() -> Self {
        Self {
            steam_temp: 160.0,
            steam_duration: 120,
            hot_water_temp: 80.0,
            hot_water_volume: 200,
            group_temp: 93.0,
        }
    }
}

impl ShotSettings {
    /// Pack the 9-byte shot-settings write.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 9] {
        let group_temp = fixed::encode_u16p8(self.group_temp);
        [
            0, // steam settings flags
            fixed::encode_u8p0(self.steam_temp),
            fixed::encode_u8p0(f64::from(self.steam_duration)),
            fixed::encode_u8p0(self.hot_water_temp),
            fixed::encode_u8p0(f64::from(self.hot_water_volume)),
            fixed::encode_u8p0(60.0), // target hot water length
            fixed::encode_u8p0(36.0), // target espresso volume
            (group_temp >> 8) as u8,
            group_temp as u8,
        ]
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No transport attached or transport lost.
    Disconnected,
    /// Connect requested, waiting on the transport.
    Connecting,
    /// Transport is connecting / discovering services.
    Discovering,
    /// Handshake writes in flight.
    Configuring,
    /// Handshake issued; machine events flowing.
    Ready,
}

/// Typed events the session emits.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The session finished its handshake.
    Connected,
    /// The transport was lost or disconnected.
    Disconnected,
    /// The connecting flag flipped.
    ConnectingChanged(bool),
    /// Machine state changed.
    StateChanged(MachineState),
    /// Machine substate changed.
    SubstateChanged(MachineSubState),
    /// One extraction telemetry sample.
    ShotSample(parser::ShotSample),
    /// Water tank level in liters.
    WaterLevelChanged(f64),
    /// Firmware version display string.
    FirmwareVersionChanged(String),
    /// Profile upload finished (`true`) or was abandoned (`false`).
    ProfileUploaded(bool),
}

/// Inputs to the driver.
#[derive(Debug, Clone)]
pub enum SessionInput {
    /// Caller asked to connect (transport attach follows).
    ConnectRequested,
    /// Caller asked to disconnect.
    DisconnectRequested,
    /// The transport reported ready.
    TransportConnected,
    /// The transport was lost.
    TransportDisconnected,
    /// Data arrived from an endpoint.
    Data {
        /// Source endpoint.
        endpoint: EndpointId,
        /// Payload.
        data: Bytes,
    },
    /// A transport write completed.
    WriteCompleted {
        /// Endpoint that was written.
        endpoint: EndpointId,
    },
    /// Request a machine state.
    RequestState(MachineState),
    /// Upload a profile.
    UploadProfile(Profile),
    /// Send shot settings.
    SetShotSettings(ShotSettings),
}

/// Outputs from the driver.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// Issue this command on the transport.
    Command(TransportCommand),
    /// Publish this event to subscribers.
    Emit(DeviceEvent),
}

/// The session state machine.
#[derive(Debug)]
pub struct SessionDriver {
    phase: SessionPhase,
    state: Option<MachineState>,
    substate: Option<MachineSubState>,
    firmware_version: Option<String>,
    /// Writes remaining in the in-flight profile upload.
    pending_upload: Option<usize>,
}

impl Default for SessionDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDriver {
    /// Create a driver in the disconnected phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            state: None,
            substate: None,
            firmware_version: None,
            pending_upload: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Last observed machine state.
    #[must_use]
    pub fn state(&self) -> Option<MachineState> {
        self.state
    }

    /// Process one input, producing ordered outputs.
    pub fn process(&mut self, input: SessionInput) -> Vec<SessionOutput> {
        match input {
            SessionInput::ConnectRequested => self.handle_connect_requested(),
            SessionInput::DisconnectRequested => {
                let mut out = vec![SessionOutput::Command(TransportCommand::Disconnect)];
                out.extend(self.drop_connection());
                out
            },
            SessionInput::TransportConnected => self.handle_transport_connected(),
            SessionInput::TransportDisconnected => self.drop_connection(),
            SessionInput::Data { endpoint, data } => self.handle_data(endpoint, &data),
            SessionInput::WriteCompleted { endpoint } => self.handle_write_completed(endpoint),
            SessionInput::RequestState(state) => {
                vec![SessionOutput::Command(TransportCommand::Write {
                    endpoint: endpoints::REQUESTED_STATE,
                    data: Bytes::from(vec![state.to_byte()]),
                })]
            },
            SessionInput::UploadProfile(profile) => self.handle_upload_profile(&profile),
            SessionInput::SetShotSettings(settings) => {
                vec![SessionOutput::Command(TransportCommand::Write {
                    endpoint: endpoints::SHOT_SETTINGS,
                    data: Bytes::copy_from_slice(&settings.to_bytes()),
                })]
            },
        }
    }

    fn handle_connect_requested(&mut self) -> Vec<SessionOutput> {
        if self.phase != SessionPhase::Disconnected {
            tracing::debug!(phase = ?self.phase, "connect ignored: already in progress");
            return Vec::new();
        }
        self.phase = SessionPhase::Connecting;
        let out = vec![SessionOutput::Emit(DeviceEvent::ConnectingChanged(true))];
        self.phase = SessionPhase::Discovering;
        out
    }

    fn handle_transport_connected(&mut self) -> Vec<SessionOutput> {
        self.phase = SessionPhase::Configuring;

        let mut out = Vec::new();

        // Subscriptions plus initial reads (version, state, water level)
        out.push(SessionOutput::Command(TransportCommand::SubscribeAll));

        // Request GHC info over the memory-mapped region; the answer
        // arrives as a READ_FROM_MMR notification.
        let mut mmr_read = vec![0u8; 20];
        mmr_read[1..4].copy_from_slice(&wire::encode_u24_be(MMR_GHC_INFO_ADDR));
        out.push(SessionOutput::Command(TransportCommand::Write {
            endpoint: endpoints::READ_FROM_MMR,
            data: Bytes::from(mmr_read),
        }));

        // Minimal wake profile: one 9 bar / 93C / 30 s frame. The machine
        // expects a valid profile before it will honor shot settings.
        let wake = Profile {
            steps: vec![decenza_codec::ProfileFrame::default()],
            ..Profile::default()
        };
        out.extend(self.profile_writes(&wake));

        out.push(SessionOutput::Command(TransportCommand::Write {
            endpoint: endpoints::SHOT_SETTINGS,
            data: Bytes::copy_from_slice(&ShotSettings::default().to_bytes()),
        }));

        // Wake the machine
        out.push(SessionOutput::Command(TransportCommand::Write {
            endpoint: endpoints::REQUESTED_STATE,
            data: Bytes::from(vec![MachineState::Idle.to_byte()]),
        }));

        self.phase = SessionPhase::Ready;
        out.push(SessionOutput::Emit(DeviceEvent::ConnectingChanged(false)));
        out.push(SessionOutput::Emit(DeviceEvent::Connected));
        out
    }

    fn handle_upload_profile(&mut self, profile: &Profile) -> Vec<SessionOutput> {
        let writes = self.profile_writes(profile);
        self.pending_upload = Some(writes.len());
        writes
    }

    /// Header write plus frame writes for a profile, in upload order.
    fn profile_writes(&self, profile: &Profile) -> Vec<SessionOutput> {
        let mut out = Vec::with_capacity(profile.steps.len() + 2);
        out.push(SessionOutput::Command(TransportCommand::Write {
            endpoint: endpoints::HEADER_WRITE,
            data: Bytes::copy_from_slice(&profile.header_bytes()),
        }));
        for frame in profile.frame_bytes() {
            out.push(SessionOutput::Command(TransportCommand::Write {
                endpoint: endpoints::FRAME_WRITE,
                data: Bytes::copy_from_slice(&frame),
            }));
        }
        out
    }

    fn handle_write_completed(&mut self, endpoint: EndpointId) -> Vec<SessionOutput> {
        if endpoint != endpoints::HEADER_WRITE && endpoint != endpoints::FRAME_WRITE {
            return Vec::new();
        }
        let Some(remaining) = self.pending_upload else {
            return Vec::new();
        };
        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            self.pending_upload = None;
            return vec![SessionOutput::Emit(DeviceEvent::ProfileUploaded(true))];
        }
        self.pending_upload = Some(remaining);
        Vec::new()
    }

    fn handle_data(&mut self, endpoint: EndpointId, data: &[u8]) -> Vec<SessionOutput> {
        if endpoint == endpoints::STATE_INFO {
            let Some((state, substate)) = parser::parse_state_info(data) else {
                return Vec::new();
            };
            let mut out = Vec::new();
            if self.state != Some(state) {
                self.state = Some(state);
                out.push(SessionOutput::Emit(DeviceEvent::StateChanged(state)));
            }
            if self.substate != Some(substate) {
                self.substate = Some(substate);
                out.push(SessionOutput::Emit(DeviceEvent::SubstateChanged(substate)));
            }
            out
        } else if endpoint == endpoints::SHOT_SAMPLE {
            match parser::parse_shot_sample(data) {
                Some(sample) => vec![SessionOutput::Emit(DeviceEvent::ShotSample(sample))],
                None => {
                    tracing::debug!(len = data.len(), "discarding short shot sample");
                    Vec::new()
                },
            }
        } else if endpoint == endpoints::WATER_LEVELS {
            match parser::parse_water_level(data) {
                Some(level) => vec![SessionOutput::Emit(DeviceEvent::WaterLevelChanged(level))],
                None => Vec::new(),
            }
        } else if endpoint == endpoints::VERSION {
            match parser::parse_version(data) {
                Some(version) if self.firmware_version.as_deref() != Some(&version) => {
                    self.firmware_version = Some(version.clone());
                    vec![SessionOutput::Emit(DeviceEvent::FirmwareVersionChanged(version))]
                },
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        }
    }

    fn drop_connection(&mut self) -> Vec<SessionOutput> {
        let was_connecting = matches!(
            self.phase,
            SessionPhase::Connecting | SessionPhase::Discovering | SessionPhase::Configuring
        );
        let was_ready = self.phase == SessionPhase::Ready;
        self.phase = SessionPhase::Disconnected;
        self.state = None;
        self.substate = None;

        let mut out = Vec::new();
        if self.pending_upload.take().is_some() {
            out.push(SessionOutput::Emit(DeviceEvent::ProfileUploaded(false)));
        }
        if was_connecting {
            out.push(SessionOutput::Emit(DeviceEvent::ConnectingChanged(false)));
        }
        if was_ready || was_connecting {
            out.push(SessionOutput::Emit(DeviceEvent::Disconnected));
        }
        out
    }
}
