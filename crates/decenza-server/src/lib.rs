//! Companion server.
//!
//! Serves the HTML control surface and the REST/SSE API on TCP port 8888
//! (TLS-terminated when security is enabled) and answers LAN discovery on
//! UDP 8889. Request handling is hand-rolled HTTP/1.1: the pipeline reads
//! a capped header block, buffers small bodies in memory, streams large
//! uploads to disk, and parks SSE sockets on topic channels.
//!
//! # Hard limits
//!
//! | Limit | Value |
//! |---|---|
//! | header block | 64 KiB |
//! | in-memory body | 1 MiB |
//! | upload size | 500 MiB |
//! | concurrent media uploads | 2 |
//! | keep-alive idle | 30 s |
//! | stale connection reap | 5 min |
//! | session lifetime | 90 days |

pub mod auth;
pub mod discovery;
pub mod http;
pub mod pages;
pub mod router;
pub mod sse;
pub mod tls;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use decenza_backup::BackupEngine;
use decenza_chat::ConversationStore;
use decenza_core::{PlatformServices, SettingsStore};
use decenza_device::DeviceSessionHandle;
use decenza_history::ShotHistory;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::auth::SessionStore;
use crate::http::{RequestHead, Response};
use crate::sse::{SseHub, SseTopic};

/// Maximum header block size before a request is rejected with 400.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;
/// Bodies up to this size are buffered in memory.
pub const MAX_SMALL_BODY_SIZE: u64 = 1024 * 1024;
/// Bodies above this size are rejected with 413 before any body bytes.
pub const MAX_UPLOAD_SIZE: u64 = 500 * 1024 * 1024;
/// Concurrent disk-staged uploads.
pub const MAX_CONCURRENT_UPLOADS: usize = 2;
/// Idle keep-alive connections close after this.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Stale sockets without completed requests are reaped after this.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration failure (bind address, TLS material).
    #[error("configuration error: {0}")]
    Config(String),
    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Async health probe for external collaborators (Visualizer, AI, MQTT).
///
/// Takes the request body and resolves to `(ok, human message)`. Probes
/// are injected so the test/connect routes work without this crate
/// depending on the collaborator clients.
pub type HealthProbe = Arc<
    dyn Fn(
            serde_json::Value,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = (bool, String)> + Send>,
        > + Send
        + Sync,
>;

/// Timeout applied to every health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Injected collaborator probes, all optional.
#[derive(Clone, Default)]
pub struct HealthProbes {
    /// Visualizer credential test.
    pub visualizer: Option<HealthProbe>,
    /// AI provider test.
    pub ai: Option<HealthProbe>,
    /// MQTT connect.
    pub mqtt_connect: Option<HealthProbe>,
    /// MQTT status.
    pub mqtt_status: Option<HealthProbe>,
    /// AI layout designer.
    pub layout_ai: Option<HealthProbe>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address.
    pub bind_address: String,
    /// Whether to terminate TLS (self-signed pair generated on demand).
    pub tls: bool,
    /// PEM certificate path; defaults to `server_cert.pem` in the data dir.
    pub cert_path: Option<PathBuf>,
    /// PEM key path; defaults to `server_key.pem` in the data dir.
    pub key_path: Option<PathBuf>,
    /// Version string advertised over discovery.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8888".to_string(),
            tls: false,
            cert_path: None,
            key_path: None,
            version: "0.1.0".to_string(),
        }
    }
}

/// Shared server state handed to every request handler.
pub struct ServerState {
    /// Configuration.
    pub config: ServerConfig,
    /// Storage roots.
    pub paths: PlatformServices,
    /// Settings store.
    pub settings: Arc<SettingsStore>,
    /// Shot history engine.
    pub history: ShotHistory,
    /// Backup/restore engine.
    pub backup: BackupEngine,
    /// Conversation store.
    pub conversations: ConversationStore,
    /// Machine session; the port watcher attaches and detaches at runtime.
    pub device: std::sync::RwLock<Option<DeviceSessionHandle>>,
    /// Session table.
    pub sessions: SessionStore,
    /// SSE topic hub.
    pub sse: SseHub,
    /// Collaborator probes.
    pub probes: HealthProbes,
    /// Disk-staged uploads currently in flight.
    pub active_uploads: AtomicUsize,
}

impl ServerState {
    /// Assemble state over the engines.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        paths: PlatformServices,
        settings: Arc<SettingsStore>,
        history: ShotHistory,
        backup: BackupEngine,
        device: Option<DeviceSessionHandle>,
        probes: HealthProbes,
    ) -> Self {
        let sessions = SessionStore::load(paths.sessions_path());
        let conversations = ConversationStore::new(Arc::clone(&settings));
        Self {
            config,
            paths,
            settings,
            history,
            backup,
            conversations,
            device: std::sync::RwLock::new(device),
            sessions,
            sse: SseHub::new(),
            probes,
            active_uploads: AtomicUsize::new(0),
        }
    }

    /// The attached machine session, if any.
    #[must_use]
    pub fn device(&self) -> Option<DeviceSessionHandle> {
        self.device.read().ok().and_then(|guard| guard.clone())
    }

    /// Attach or replace the machine session.
    pub fn attach_device(&self, handle: DeviceSessionHandle) {
        if let Ok(mut guard) = self.device.write() {
            *guard = Some(handle);
        }
    }

    /// Detach the machine session (port disappeared).
    pub fn detach_device(&self) {
        if let Ok(mut guard) = self.device.write() {
            *guard = None;
        }
    }

    /// The externally visible control URL.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.config.tls { "https" } else { "http" };
        let ip = discovery::local_ipv4().unwrap_or_else(|| "127.0.0.1".to_string());
        let port = self
            .config
            .bind_address
            .rsplit_once(':')
            .map_or("8888", |(_, port)| port);
        format!("{scheme}://{ip}:{port}/")
    }
}

/// A request body: buffered or staged on disk.
#[derive(Debug)]
pub enum Body {
    /// Small body held in memory.
    Memory(Vec<u8>),
    /// Large body staged in a temp file.
    File(PathBuf),
}

impl Body {
    /// The body as bytes; reads the staged file for disk bodies.
    pub fn bytes(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Memory(bytes) => Ok(bytes.clone()),
            Self::File(path) => std::fs::read(path),
        }
    }

    /// Parse the body as JSON, defaulting to `null` on empty input.
    pub fn json(&self) -> serde_json::Value {
        self.bytes()
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// The running companion server.
pub struct CompanionServer {
    local_addr: std::net::SocketAddr,
}

impl CompanionServer {
    /// Bind and start serving. Also starts the UDP discovery responder.
    pub async fn start(state: Arc<ServerState>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&state.config.bind_address).await?;
        let local_addr = listener.local_addr()?;

        let tls_config = if state.config.tls {
            let cert_path = state
                .config
                .cert_path
                .clone()
                .unwrap_or_else(|| state.paths.data_dir().join("server_cert.pem"));
            let key_path = state
                .config
                .key_path
                .clone()
                .unwrap_or_else(|| state.paths.data_dir().join("server_key.pem"));
            Some(tls::load_or_generate(&cert_path, &key_path)?)
        } else {
            None
        };

        tracing::info!(%local_addr, tls = state.config.tls, "companion server listening");

        {
            let version = state.config.version.clone();
            let url = state.url();
            tokio::spawn(async move {
                if let Err(e) = discovery::run_responder(version, url).await {
                    tracing::warn!(error = %e, "discovery responder stopped");
                }
            });
        }

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let state = Arc::clone(&accept_state);
                        let tls_config = tls_config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_socket(socket, peer, state, tls_config).await {
                                tracing::debug!(%peer, error = %e, "connection ended");
                            }
                        });
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    },
                }
            }
        });

        Ok(Self { local_addr })
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

async fn serve_socket(
    socket: TcpStream,
    peer: std::net::SocketAddr,
    state: Arc<ServerState>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
) -> std::io::Result<()> {
    match tls_config {
        Some(config) => {
            // A plain-HTTP byte on the TLS port gets a redirect: TLS
            // handshakes start with 0x16, HTTP methods with ASCII letters
            let mut first = [0u8; 1];
            let peeked = socket.peek(&mut first).await?;
            if peeked == 1 && first[0] != 0x16 {
                let mut socket = socket;
                let url = state.url();
                let redirect = Response::redirect(&url, None).to_bytes();
                socket.write_all(&redirect).await?;
                return Ok(());
            }
            let acceptor = tokio_rustls::TlsAcceptor::from(config);
            let stream = acceptor.accept(socket).await?;
            serve_connection(stream, peer, state).await
        },
        None => serve_connection(socket, peer, state).await,
    }
}

/// Serve requests on one connection until close or timeout.
async fn serve_connection<S>(
    mut stream: S,
    peer: std::net::SocketAddr,
    state: Arc<ServerState>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);

    loop {
        // Header phase: keep-alive idle timeout between reads, hard reap
        // deadline for a header block that never completes
        let head = match read_head(&mut stream, &mut buffer).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()), // clean close or idle timeout
            Err(HeadError::TooLarge) => {
                let response = Response::error(400, "header block too large");
                stream.write_all(&response.to_bytes()).await?;
                return Ok(());
            },
            Err(HeadError::Malformed) => {
                let response = Response::error(400, "malformed request");
                stream.write_all(&response.to_bytes()).await?;
                return Ok(());
            },
            Err(HeadError::Io(e)) => return Err(e),
        };

        let Some(content_length) = head.content_length() else {
            let response = Response::error(400, "invalid content length");
            stream.write_all(&response.to_bytes()).await?;
            return Ok(());
        };

        // Oversized requests are refused before any body byte is read
        if content_length > MAX_UPLOAD_SIZE {
            let response = Response::error(413, "payload too large");
            stream.write_all(&response.to_bytes()).await?;
            return Ok(());
        }

        let body = if content_length <= MAX_SMALL_BODY_SIZE {
            match read_small_body(&mut stream, &mut buffer, content_length as usize).await {
                Ok(body) => Body::Memory(body),
                Err(e) => return Err(e),
            }
        } else {
            // Disk staging, bounded by the concurrent upload ceiling
            let active = state.active_uploads.fetch_add(1, Ordering::AcqRel);
            if active >= MAX_CONCURRENT_UPLOADS {
                state.active_uploads.fetch_sub(1, Ordering::AcqRel);
                let response = Response::error(429, "too many concurrent uploads");
                stream.write_all(&response.to_bytes()).await?;
                return Ok(());
            }
            let staged =
                stream_body_to_disk(&mut stream, &mut buffer, content_length, &state).await;
            state.active_uploads.fetch_sub(1, Ordering::AcqRel);
            match staged {
                Ok(path) => Body::File(path),
                Err(e) => return Err(e),
            }
        };

        // SSE endpoints park the socket on the topic channel
        if let Some(topic) = router::sse_topic(&head) {
            if !router::is_authorized(&state, &head) {
                let response = Response::error(401, "unauthorized");
                stream.write_all(&response.to_bytes()).await?;
                return Ok(());
            }
            return serve_sse(stream, &state, topic).await;
        }

        let response = router::dispatch(&state, &head, &body, peer).await;

        // Staged files are consumed by their handler; anything left is ours
        if let Body::File(path) = &body {
            let _ = std::fs::remove_file(path);
        }

        stream.write_all(&response.to_bytes()).await?;
        stream.flush().await?;
    }
}

/// Park a connection on an SSE topic until the client goes away.
async fn serve_sse<S>(mut stream: S, state: &ServerState, topic: SseTopic) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream.write_all(sse::SSE_RESPONSE_HEADER.as_bytes()).await?;
    stream.flush().await?;

    let mut frames = state.sse.subscribe(topic);
    let mut drain = [0u8; 256];

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                stream.write_all(frame.as_bytes()).await?;
                stream.flush().await?;
            },
            // A read completing means the peer closed (or sent junk); the
            // receiver drops here, which removes us from the topic set
            read = stream.read(&mut drain) => {
                match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => {},
                }
            },
        }
    }
}

enum HeadError {
    TooLarge,
    Malformed,
    Io(std::io::Error),
}

/// Read one header block. `Ok(None)` means the peer closed or idled out.
async fn read_head<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
) -> Result<Option<RequestHead>, HeadError>
where
    S: AsyncRead + Unpin + Send,
{
    let started = tokio::time::Instant::now();

    loop {
        if let Some(end) = find_header_end(buffer) {
            let header_bytes = buffer.drain(..end + 4).collect::<Vec<u8>>();
            let header_text = String::from_utf8_lossy(&header_bytes[..end]).into_owned();
            return match RequestHead::parse(&header_text) {
                Some(head) => Ok(Some(head)),
                None => Err(HeadError::Malformed),
            };
        }
        if buffer.len() > MAX_HEADER_SIZE {
            return Err(HeadError::TooLarge);
        }
        if started.elapsed() > CONNECTION_TIMEOUT {
            // Stale socket reap: headers never completed
            return Ok(None);
        }

        let mut chunk = [0u8; 4096];
        let read = tokio::time::timeout(KEEPALIVE_TIMEOUT, stream.read(&mut chunk)).await;
        match read {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(HeadError::Io(e)),
            // Idle keep-alive between requests: close quietly unless a
            // partial request is pending
            Err(_) if buffer.is_empty() => return Ok(None),
            Err(_) => return Ok(None),
        }
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_small_body<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    length: usize,
) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut body = Vec::with_capacity(length);
    let take = length.min(buffer.len());
    body.extend(buffer.drain(..take));

    while body.len() < length {
        let mut chunk = [0u8; 8192];
        let n = tokio::time::timeout(CONNECTION_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "body read timeout"))??;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "body truncated",
            ));
        }
        let needed = (length - body.len()).min(n);
        body.extend_from_slice(&chunk[..needed]);
        // Pipelined bytes past the body stay in the buffer
        if needed < n {
            buffer.extend_from_slice(&chunk[needed..n]);
        }
    }
    Ok(body)
}

/// Stream a large body into a temp file under the cache dir.
///
/// Each chunk refreshes the activity deadline, so a slow-but-moving
/// upload survives while a stalled one times out.
async fn stream_body_to_disk<S>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    length: u64,
    state: &ServerState,
) -> std::io::Result<PathBuf>
where
    S: AsyncRead + Unpin + Send,
{
    let path = state
        .paths
        .cache_dir()
        .join(format!("upload_{}.tmp", uuid::Uuid::new_v4().simple()));
    let mut file = tokio::fs::File::create(&path).await?;

    let mut received: u64 = 0;
    let take = (length.min(buffer.len() as u64)) as usize;
    if take > 0 {
        let initial = buffer.drain(..take).collect::<Vec<u8>>();
        file.write_all(&initial).await?;
        received += take as u64;
    }

    let mut chunk = vec![0u8; 64 * 1024];
    while received < length {
        let n = match tokio::time::timeout(CONNECTION_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upload truncated",
                ));
            },
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            },
            Err(_) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upload stalled",
                ));
            },
        };
        let needed = ((length - received) as usize).min(n);
        file.write_all(&chunk[..needed]).await?;
        received += needed as u64;
        if needed < n {
            buffer.extend_from_slice(&chunk[needed..n]);
        }
    }

    file.flush().await?;
    Ok(path)
}
