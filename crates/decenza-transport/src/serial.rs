//! USB-CDC serial backend.
//!
//! Speaks the DE1's ASCII line protocol over a CDC-ACM port at 115200 8N1
//! with DTR and RTS held low:
//!
//! ```text
//! host -> DE1:  <LETTER>HEXBYTES\n    write
//!               <+LETTER>\n           subscribe
//!               <-LETTER>\n           unsubscribe
//! DE1 -> host:  [LETTER]HEXBYTES\n    notification / read response
//! ```
//!
//! Serial has no pacing and no wire-level write confirmation, so
//! [`TransportEvent::WriteComplete`] is synthesized as soon as the bytes are
//! handed to the port. The DE1 answers a subscription with the endpoint's
//! current value, which is how reads are expressed on this wire.
//!
//! A dedicated thread owns the port: it drains the command channel, reads
//! with a short timeout, and splits the receive buffer into complete lines.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::{EndpointId, TransportCommand, TransportError, TransportEvent, TransportHandle, endpoints};

/// Serial line rate.
pub const BAUD_RATE: u32 = 115_200;
/// Poll interval for the port read loop.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Encode a write line: `<LETTER>HEX\n`.
#[must_use]
pub fn encode_write(letter: char, data: &[u8]) -> String {
    let mut line = String::with_capacity(data.len() * 2 + 4);
    line.push('<');
    line.push(letter);
    line.push('>');
    push_hex(&mut line, data);
    line.push('\n');
    line
}

/// Encode a subscribe line: `<+LETTER>\n`.
#[must_use]
pub fn encode_subscribe(letter: char) -> String {
    format!("<+{letter}>\n")
}

/// Encode an unsubscribe line: `<-LETTER>\n`.
#[must_use]
pub fn encode_unsubscribe(letter: char) -> String {
    format!("<-{letter}>\n")
}

fn push_hex(line: &mut String, data: &[u8]) {
    for byte in data {
        let _ = std::fmt::Write::write_fmt(line, format_args!("{byte:02X}"));
    }
}

/// Parse a device line `[LETTER]HEX` into its endpoint and payload.
///
/// Hex is accepted in either case; a malformed line yields `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<(EndpointId, Bytes)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line.strip_prefix('[')?;
    let (letter, hex) = rest.split_once(']')?;
    let mut letters = letter.chars();
    let letter = letters.next()?;
    if letters.next().is_some() {
        return None;
    }
    let endpoint = EndpointId::from_letter(letter)?;
    let payload = decode_hex(hex)?;
    Some((endpoint, Bytes::from(payload)))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let high = (pair[0] as char).to_digit(16)?;
        let low = (pair[1] as char).to_digit(16)?;
        out.push((high * 16 + low) as u8);
    }
    Some(out)
}

/// Accumulates raw bytes and yields complete LF-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and drain every complete line.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }
}

/// Byte-level port abstraction so tests can run against an in-memory pipe.
pub trait LinePort: Send + 'static {
    /// Read up to `buf.len()` bytes; `Ok(0)` on timeout with no data.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write the full buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

struct OsPort(Box<dyn serialport::SerialPort>);

impl LinePort for OsPort {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.0, data)
    }
}

/// Open the OS serial port with the DE1's line settings.
pub fn open_port(port_name: &str) -> Result<impl LinePort, TransportError> {
    let mut port = serialport::new(port_name, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| TransportError::Port(format!("open {port_name}: {e}")))?;

    // The DE1 requires both modem lines low
    port.write_data_terminal_ready(false)
        .and_then(|()| port.write_request_to_send(false))
        .map_err(|e| TransportError::Port(format!("modem lines on {port_name}: {e}")))?;

    Ok(OsPort(port))
}

/// Serial transport backend.
pub struct SerialTransport;

impl SerialTransport {
    /// Open the named OS port and spawn the backend.
    pub fn open(port_name: &str) -> Result<TransportHandle, TransportError> {
        let port = open_port(port_name)?;
        Ok(Self::spawn(port))
    }

    /// Spawn the backend over an already-open port.
    ///
    /// Emits [`TransportEvent::Connected`] immediately: a serial line has no
    /// handshake, presence was established by the port watcher's probe.
    pub fn spawn(port: impl LinePort) -> TransportHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let connected = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            port,
            commands: command_rx,
            events: event_tx.clone(),
            connected: Arc::clone(&connected),
            buffer: LineBuffer::new(),
        };
        std::thread::spawn(move || worker.run());

        let handle = TransportHandle::new(command_tx, event_tx.clone(), connected, "serial");
        let _ = event_tx.send(TransportEvent::Connected);
        handle
    }
}

struct Worker<P: LinePort> {
    port: P,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    buffer: LineBuffer,
}

impl<P: LinePort> Worker<P> {
    fn run(mut self) {
        let mut read_buf = [0u8; 4096];

        loop {
            // Drain all pending commands first so writes are not delayed by
            // the read timeout.
            loop {
                match self.commands.try_recv() {
                    Ok(TransportCommand::Disconnect) => {
                        self.finish();
                        return;
                    },
                    Ok(command) => {
                        if let Err(e) = self.handle_command(command) {
                            self.fail(&e);
                            return;
                        }
                    },
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.finish();
                        return;
                    },
                }
            }

            match self.port.read_chunk(&mut read_buf) {
                Ok(0) => {},
                Ok(n) => {
                    for line in self.buffer.push(&read_buf[..n]) {
                        self.handle_line(&line);
                    }
                },
                Err(e) => {
                    self.fail(&e.to_string());
                    return;
                },
            }
        }
    }

    fn handle_command(&mut self, command: TransportCommand) -> Result<(), String> {
        match command {
            TransportCommand::Write { endpoint, data }
            | TransportCommand::WriteUrgent { endpoint, data } => {
                // Serial has no queue, so urgent degenerates to write
                let Some(letter) = endpoint.letter() else {
                    tracing::debug!(%endpoint, "dropping write to unmapped endpoint");
                    return Ok(());
                };
                self.port
                    .write_all(encode_write(letter, &data).as_bytes())
                    .map_err(|e| e.to_string())?;
                let _ = self.events.send(TransportEvent::WriteComplete { endpoint, data });
            },
            TransportCommand::Read { endpoint } | TransportCommand::Subscribe { endpoint } => {
                // The DE1 answers a subscription with the current value, so
                // a read is expressed as a (re-)subscribe on this wire.
                let Some(letter) = endpoint.letter() else {
                    tracing::debug!(%endpoint, "dropping subscribe to unmapped endpoint");
                    return Ok(());
                };
                self.port
                    .write_all(encode_subscribe(letter).as_bytes())
                    .map_err(|e| e.to_string())?;
            },
            TransportCommand::SubscribeAll => {
                for endpoint in endpoints::NOTIFICATION_SET {
                    if let Some(letter) = endpoint.letter() {
                        self.port
                            .write_all(encode_subscribe(letter).as_bytes())
                            .map_err(|e| e.to_string())?;
                    }
                }
                if let Some(letter) = endpoints::VERSION.letter() {
                    self.port
                        .write_all(encode_subscribe(letter).as_bytes())
                        .map_err(|e| e.to_string())?;
                }
            },
            TransportCommand::ClearQueue => {},
            TransportCommand::Disconnect => {},
        }
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        match parse_line(line) {
            Some((endpoint, data)) => {
                let _ = self.events.send(TransportEvent::DataReceived { endpoint, data });
            },
            None => {
                tracing::trace!(line, "ignoring unparseable serial line");
            },
        }
    }

    fn fail(&self, message: &str) {
        tracing::warn!(message, "serial transport error");
        let _ = self.events.send(TransportEvent::Error { message: message.to_string() });
        self.finish();
    }

    fn finish(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn write_line_encoding() {
        assert_eq!(encode_write('B', &[0x02]), "<B>02\n");
        assert_eq!(encode_write('K', &[0x01, 0xAB, 0xFF]), "<K>01ABFF\n");
        assert_eq!(encode_subscribe('M'), "<+M>\n");
        assert_eq!(encode_unsubscribe('M'), "<-M>\n");
    }

    #[test]
    fn parse_notification_line() {
        let (endpoint, data) = parse_line("[N]0000E020\n").expect("parse");
        assert_eq!(endpoint, endpoints::SHOT_SAMPLE);
        assert_eq!(&data[..], &[0x00, 0x00, 0xE0, 0x20]);

        // Case-insensitive hex
        let (_, data) = parse_line("[a]ff0e").expect("parse");
        assert_eq!(&data[..], &[0xFF, 0x0E]);

        // Empty payload is a valid read response
        let (endpoint, data) = parse_line("[A]").expect("parse");
        assert_eq!(endpoint, endpoints::VERSION);
        assert!(data.is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_line("").is_none());
        assert!(parse_line("N]00").is_none());
        assert!(parse_line("[!]00").is_none());
        assert!(parse_line("[N]0").is_none(), "odd hex length");
        assert!(parse_line("[N]GG").is_none());
        assert!(parse_line("[NX]00").is_none(), "multi-char letter field");
    }

    #[test]
    fn prop_write_line_parses_back() {
        use proptest::prelude::*;
        proptest!(|(letter in 0u16..18, data in prop::collection::vec(any::<u8>(), 0..64))| {
            let endpoint = EndpointId::from_short(0xA001 + letter);
            let wire_letter = endpoint.letter().expect("in range");
            // The device echoes the same framing with [] brackets
            let line = encode_write(wire_letter, &data)
                .replacen('<', "[", 1)
                .replacen('>', "]", 1);
            let (parsed_endpoint, parsed_data) = parse_line(&line).expect("parse");
            prop_assert_eq!(parsed_endpoint, endpoint);
            prop_assert_eq!(&parsed_data[..], &data[..]);
        });
    }

    #[test]
    fn line_buffer_splits_partial_reads() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"[N]00").is_empty());
        let lines = buffer.push(b"FF\n[M]01\n[A");
        assert_eq!(lines, vec!["[N]00FF".to_string(), "[M]01".to_string()]);
        let lines = buffer.push(b"]02\n");
        assert_eq!(lines, vec!["[A]02".to_string()]);
    }

    /// In-memory port: scripted inbound bytes, captured outbound writes.
    struct PipePort {
        inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
    }

    impl LinePort for PipePort {
        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // Simulated read timeout so the worker loop keeps polling
            std::thread::sleep(Duration::from_millis(1));
            let Some(chunk) = self.inbound.lock().ok().and_then(|mut q| q.pop_front()) else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            if let Ok(mut out) = self.outbound.lock() {
                out.extend_from_slice(data);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscribe_and_notification_round_trip() {
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let port =
            PipePort { inbound: Arc::clone(&inbound), outbound: Arc::clone(&outbound) };

        let handle = SerialTransport::spawn(port);
        let mut events = handle.events();

        handle.subscribe(endpoints::SHOT_SAMPLE);
        handle.write(endpoints::REQUESTED_STATE, vec![0x02]);

        // Write completion is synthesized
        let complete = loop {
            match events.recv().await.expect("event") {
                TransportEvent::WriteComplete { endpoint, data } => break (endpoint, data),
                _ => continue,
            }
        };
        assert_eq!(complete.0, endpoints::REQUESTED_STATE);
        assert_eq!(&complete.1[..], &[0x02]);

        // Device sends a notification line
        if let Ok(mut q) = inbound.lock() {
            q.push_back(b"[N]0102\n".to_vec());
        }
        let received = loop {
            match events.recv().await.expect("event") {
                TransportEvent::DataReceived { endpoint, data } => break (endpoint, data),
                _ => continue,
            }
        };
        assert_eq!(received.0, endpoints::SHOT_SAMPLE);
        assert_eq!(&received.1[..], &[0x01, 0x02]);

        handle.disconnect();
        loop {
            match events.recv().await.expect("event") {
                TransportEvent::Disconnected => break,
                _ => continue,
            }
        }

        let written = outbound.lock().map(|o| String::from_utf8_lossy(&o).to_string());
        let written = written.unwrap_or_default();
        assert!(written.contains("<+N>\n"));
        assert!(written.contains("<B>02\n"));
    }
}
