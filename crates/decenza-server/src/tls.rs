//! TLS configuration.
//!
//! When security is enabled the listener terminates TLS with a
//! certificate/key pair read from the data directory; on first run a
//! self-signed pair is generated and persisted so the browser warning
//! stays stable across restarts.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::PrivateKeyDer;

use crate::ServerError;

/// Load or create the server TLS configuration.
///
/// `cert_path`/`key_path` hold PEM files; missing files are generated
/// self-signed for `localhost` and the machine's LAN address.
pub fn load_or_generate(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    if !cert_path.is_file() || !key_path.is_file() {
        generate_self_signed(cert_path, key_path)?;
    }

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| ServerError::Config(format!("failed to read cert: {e}")))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ServerError::Config(format!("failed to read key: {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;
    let key: PrivateKeyDer<'_> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    Ok(Arc::new(config))
}

/// Generate and persist a self-signed certificate pair.
fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<(), ServerError> {
    let mut names = vec!["localhost".to_string()];
    if let Some(ip) = crate::discovery::local_ipv4() {
        names.push(ip);
    }

    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    std::fs::write(cert_path, cert.cert.pem())
        .map_err(|e| ServerError::Config(format!("failed to write cert: {e}")))?;
    std::fs::write(key_path, cert.key_pair.serialize_pem())
        .map_err(|e| ServerError::Config(format!("failed to write key: {e}")))?;

    tracing::warn!("generated self-signed certificate - browsers will warn on first visit");
    Ok(())
}
