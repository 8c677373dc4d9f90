//! UDP LAN discovery responder.
//!
//! Listens on port 8889 and answers any datagram with a JSON blob naming
//! the service, version, and control URL, so companion apps can find the
//! machine without configuration.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// Discovery port.
pub const DISCOVERY_PORT: u16 = 8889;

/// Service identifier in the reply.
pub const SERVICE_NAME: &str = "decenza-de1";

/// Build the discovery reply payload.
#[must_use]
pub fn reply_payload(version: &str, url: &str, hostname: &str, local_ip: &str) -> serde_json::Value {
    serde_json::json!({
        "service": SERVICE_NAME,
        "version": version,
        "url": url,
        "hostname": hostname,
        "ip": local_ip,
    })
}

/// Run the responder until the socket errors out.
///
/// Every datagram, regardless of content, gets the reply sent back to its
/// source address.
pub async fn run_responder(version: String, url: String) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
    tracing::info!(port = DISCOVERY_PORT, "discovery responder listening");

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "decenza".to_string());
    let mut buf = [0u8; 1024];

    loop {
        let (_, from): (usize, SocketAddr) = socket.recv_from(&mut buf).await?;
        let local_ip = local_ipv4().unwrap_or_else(|| "127.0.0.1".to_string());
        let payload = reply_payload(&version, &url, &hostname, &local_ip);
        if let Err(e) = socket.send_to(payload.to_string().as_bytes(), from).await {
            tracing::debug!(error = %e, "discovery reply failed");
        } else {
            tracing::debug!(%from, "answered discovery datagram");
        }
    }
}

/// Best-effort local IPv4: the address a UDP socket binds when "connected"
/// to a public destination. No packets are sent.
#[must_use]
pub fn local_ipv4() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
