//! Wire-level tests against a live listener.
//!
//! Raw TCP clients drive the server so limits (header cap, 413 before
//! body), authentication, and SSE framing are observed exactly as a
//! browser would see them.

use std::sync::Arc;
use std::time::Duration;

use decenza_backup::BackupEngine;
use decenza_core::{PlatformServices, SettingsStore};
use decenza_history::ShotHistory;
use decenza_server::{CompanionServer, HealthProbes, ServerConfig, ServerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct TestServer {
    _dir: tempfile::TempDir,
    state: Arc<ServerState>,
    addr: std::net::SocketAddr,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = PlatformServices::new(dir.path().join("data"), dir.path().join("cache"))
        .expect("paths");
    let settings = Arc::new(SettingsStore::load(paths.settings_path()).expect("settings"));
    let history = ShotHistory::open(paths.shot_db_path()).expect("history");
    let backup = BackupEngine::new(paths.clone(), Arc::clone(&settings), history.clone());

    let config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        version: "0.0.0-test".to_string(),
        ..ServerConfig::default()
    };
    let state = Arc::new(ServerState::new(
        config,
        paths,
        settings,
        history,
        backup,
        None,
        HealthProbes::default(),
    ));
    let server = CompanionServer::start(Arc::clone(&state)).await.expect("start");
    TestServer { _dir: dir, state, addr: server.local_addr() }
}

async fn send_request(addr: std::net::SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request).await.expect("write");

    let mut response = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                response.extend_from_slice(&buf[..n]);
                // Stop once the declared body is complete
                if let Some(done) = response_complete(&response) {
                    if done {
                        break;
                    }
                }
            },
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

fn response_complete(bytes: &[u8]) -> Option<bool> {
    let text = String::from_utf8_lossy(bytes);
    let header_end = text.find("\r\n\r\n")?;
    let content_length = text
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())?;
    Some(bytes.len() >= header_end + 4 + content_length)
}

#[tokio::test(flavor = "multi_thread")]
async fn index_and_api_shots_respond() {
    let server = start_server().await;

    let response =
        send_request(server.addr, b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
    assert!(response.contains("Decenza"));

    let response =
        send_request(server.addr, b"GET /api/shots HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("\"totalCount\":0"));

    let response =
        send_request(server.addr, b"GET /nope HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_content_length_is_rejected_before_body() {
    let server = start_server().await;

    // 500 MiB + 1: refused on the declared length alone
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n",
        500 * 1024 * 1024 + 1
    );
    let response = send_request(server.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 413"), "got: {response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_header_block_is_rejected() {
    let server = start_server().await;

    let mut request = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
    // Push the header block just past 64 KiB without ever finishing it
    for i in 0..1300 {
        request.extend_from_slice(format!("X-Pad-{i}: {}\r\n", "y".repeat(40)).as_bytes());
    }

    // The server may close mid-write, so tolerate a failed send tail
    let mut stream = TcpStream::connect(server.addr).await.expect("connect");
    let _ = stream.write_all(&request).await;
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    while let Ok(Ok(n)) =
        tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await
    {
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    let response = String::from_utf8_lossy(&response).into_owned();
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn totp_gate_and_rate_limit() {
    let server = start_server().await;
    server
        .state
        .settings
        .set("totpSecret", "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ")
        .expect("set");

    // API without a session: 401
    let response =
        send_request(server.addr, b"GET /api/shots HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 401"), "got: {response}");

    // Page without a session: redirect to login
    let response = send_request(server.addr, b"GET /shots HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 302"));
    assert!(response.contains("Location: /auth/login"));

    // The login page itself is reachable
    let response =
        send_request(server.addr, b"GET /auth/login HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    // Wrong codes burn through the rate limit, then 429
    let login = |code: &str| {
        let body = format!("{{\"code\":\"{code}\"}}");
        format!(
            "POST /auth/login HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    };
    for _ in 0..5 {
        let response = send_request(server.addr, login("000000").as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 401"), "got: {response}");
    }
    let response = send_request(server.addr, login("000000").as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 429"), "got: {response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn totp_login_issues_session_cookie() {
    let server = start_server().await;
    let secret = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
    server.state.settings.set("totpSecret", secret).expect("set");

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs();
    let code = decenza_server::auth::totp_code(secret, now).expect("code");

    let body = format!("{{\"code\":\"{code}\"}}");
    let request = format!(
        "POST /auth/login HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_request(server.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 302"), "got: {response}");
    let cookie_line = response
        .lines()
        .find(|line| line.starts_with("Set-Cookie: session="))
        .expect("session cookie");
    let token = cookie_line
        .trim_start_matches("Set-Cookie: session=")
        .split(';')
        .next()
        .expect("token");

    // The cookie opens the API
    let request = format!("GET /api/shots HTTP/1.1\r\nHost: t\r\nCookie: session={token}\r\n\r\n");
    let response = send_request(server.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn sse_subscriber_receives_layout_broadcast() {
    let server = start_server().await;

    let mut stream = TcpStream::connect(server.addr).await.expect("connect");
    stream
        .write_all(b"GET /events/layout HTTP/1.1\r\nHost: t\r\n\r\n")
        .await
        .expect("write");

    // Read the SSE response header
    let mut preamble = vec![0u8; 512];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut preamble))
        .await
        .expect("timeout")
        .expect("read");
    let preamble = String::from_utf8_lossy(&preamble[..n]).into_owned();
    assert!(preamble.contains("text/event-stream"), "got: {preamble}");

    // Give the subscription a moment to register, then mutate the layout
    tokio::time::sleep(Duration::from_millis(50)).await;
    let body = r#"{"item":{"type":"gauge"}}"#;
    let request = format!(
        "POST /api/layout/add HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let mutate = send_request(server.addr, request.as_bytes()).await;
    assert!(mutate.starts_with("HTTP/1.1 200"), "got: {mutate}");

    // The event frame arrives on the parked socket
    let mut frame = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut frame))
        .await
        .expect("frame within deadline")
        .expect("read");
    let frame = String::from_utf8_lossy(&frame[..n]).into_owned();
    assert!(frame.starts_with("data: "), "got: {frame}");
    assert!(frame.contains("gauge"));
    assert!(frame.ends_with("\n\n"));
}

#[tokio::test(flavor = "multi_thread")]
async fn ota_upload_stages_file() {
    let server = start_server().await;

    let payload = vec![0xABu8; 4096];
    let mut request = Vec::from(
        format!(
            "POST /upload HTTP/1.1\r\nHost: t\r\nX-Filename: Decenza_DE1_1.2.3.apk\r\n\
             Content-Length: {}\r\n\r\n",
            payload.len()
        )
        .as_bytes(),
    );
    request.extend_from_slice(&payload);

    let response = send_request(server.addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("Upload complete: "), "got: {response}");
    assert!(response.contains("Decenza_DE1_1.2.3.apk"));

    // The staged file landed in the cache directory with the full payload
    let staged = server.state.paths.cache_dir().join("Decenza_DE1_1.2.3.apk");
    let bytes = std::fs::read(&staged).expect("staged file");
    assert_eq!(bytes.len(), payload.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn settings_round_trip_hides_sensitive() {
    let server = start_server().await;

    let body = r#"{"visualizerUsername":"alice","visualizerPassword":"hunter2"}"#;
    let request = format!(
        "POST /api/settings HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = send_request(server.addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let response =
        send_request(server.addr, b"GET /api/settings HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert!(response.contains("\"visualizerUsername\":\"alice\""));
    assert!(!response.contains("hunter2"), "sensitive value leaked: {response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_routes_answer_without_collaborators() {
    let server = start_server().await;

    let request = b"POST /api/settings/visualizer/test HTTP/1.1\r\nHost: t\r\nContent-Length: 2\r\n\r\n{}";
    let response = send_request(server.addr, request).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"ok\":false"));
    assert!(response.contains("not configured"));
}
