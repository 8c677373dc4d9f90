//! DE1 device session.
//!
//! Converts between raw transport frames and typed machine events. The
//! session owns one transport, runs the connection handshake (subscribe,
//! initial reads, wake profile, default shot settings), parses
//! notifications into [`DeviceEvent`]s, and sequences profile uploads.
//!
//! # Architecture
//!
//! [`driver::SessionDriver`] is the pure state machine: transport events
//! and control requests in, transport commands and device events out. The
//! [`session::DeviceSession`] task wires a driver to a live
//! [`decenza_transport::TransportHandle`]. The scale companion lives in
//! [`scale`], speaking the Half Decent Scale's 7-byte packet protocol over
//! the same transport abstraction.

pub mod driver;
pub mod parser;
pub mod scale;
pub mod session;
pub mod state;

pub use driver::{DeviceEvent, SessionDriver, SessionInput, SessionPhase};
pub use parser::ShotSample;
pub use session::{DeviceSession, DeviceSessionHandle};
pub use state::{MachineState, MachineSubState};
