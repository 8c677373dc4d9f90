//! Sessions, TOTP second factor, and login rate limiting.
//!
//! Login verifies a TOTP code (RFC 6238: HMAC-SHA1, 30 s steps, 6 digits,
//! base32 shared secret) and issues an opaque session token carried by a
//! browser cookie. Sessions live 90 days and persist to `sessions.json`
//! across restarts; expired entries are dropped at load. Authentication
//! failures answer 401 without distinguishing a bad code from a missing
//! session, and repeated attempts from one address are cut off at the
//! rate limit window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

/// Session cookie lifetime.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Login attempts allowed per address per window.
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;
/// Rolling rate-limit window.
pub const LOGIN_WINDOW: Duration = Duration::from_secs(60);

/// TOTP step in seconds.
const TOTP_STEP: u64 = 30;
/// TOTP code digits.
const TOTP_DIGITS: u32 = 6;
/// Steps of clock skew tolerated on either side.
const TOTP_SKEW: i64 = 1;

/// Compute the TOTP code for a base32 secret at a Unix timestamp.
///
/// Returns `None` when the secret does not decode as base32.
#[must_use]
pub fn totp_code(secret_base32: &str, unix_secs: u64) -> Option<String> {
    let normalized: String =
        secret_base32.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase();
    let key = data_encoding::BASE32_NOPAD.decode(normalized.trim_end_matches('=').as_bytes()).ok()?;

    let counter = unix_secs / TOTP_STEP;
    let mut mac = Hmac::<Sha1>::new_from_slice(&key).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0F) as usize;
    let binary = (u32::from(digest[offset] & 0x7F) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(TOTP_DIGITS);
    Some(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Verify a submitted code against the secret, tolerating one step of
/// clock skew in each direction.
#[must_use]
pub fn verify_totp(secret_base32: &str, code: &str, unix_secs: u64) -> bool {
    let submitted = code.trim();
    if submitted.len() != TOTP_DIGITS as usize {
        return false;
    }
    for skew in -TOTP_SKEW..=TOTP_SKEW {
        let at = unix_secs.saturating_add_signed(skew * TOTP_STEP as i64);
        if totp_code(secret_base32, at).as_deref() == Some(submitted) {
            return true;
        }
    }
    false
}

/// Generate a fresh base32 TOTP secret (20 random bytes).
#[must_use]
pub fn generate_totp_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    data_encoding::BASE32_NOPAD.encode(&bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionInfo {
    /// Unix seconds at which the session stops being valid.
    expires_at: u64,
    user_agent: String,
}

/// The in-memory session table, persisted to disk on every mutation.
pub struct SessionStore {
    path: PathBuf,
    sessions: Mutex<HashMap<String, SessionInfo>>,
    attempts: Mutex<HashMap<IpAddr, (u32, Instant)>>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl SessionStore {
    /// Load sessions from `path`, dropping expired entries.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let mut sessions: HashMap<String, SessionInfo> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        let now = now_unix();
        sessions.retain(|_, info| info.expires_at > now);

        Self {
            path,
            sessions: Mutex::new(sessions),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session and return its opaque token.
    pub fn create(&self, user_agent: &str) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let info = SessionInfo {
            expires_at: now_unix() + SESSION_LIFETIME.as_secs(),
            user_agent: user_agent.to_string(),
        };
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(token.clone(), info);
        }
        self.persist();
        token
    }

    /// Whether a token names a live session.
    #[must_use]
    pub fn check(&self, token: &str) -> bool {
        let Ok(sessions) = self.sessions.lock() else { return false };
        sessions.get(token).is_some_and(|info| info.expires_at > now_unix())
    }

    /// Remove a session (logout). Unknown tokens are a no-op.
    pub fn remove(&self, token: &str) {
        let removed = self
            .sessions
            .lock()
            .map(|mut sessions| sessions.remove(token).is_some())
            .unwrap_or(false);
        if removed {
            self.persist();
        }
    }

    /// Record a login attempt from an address; `false` means rate-limited.
    ///
    /// The window restarts once [`LOGIN_WINDOW`] has elapsed since the
    /// first attempt in it.
    pub fn check_rate_limit(&self, addr: IpAddr) -> bool {
        let Ok(mut attempts) = self.attempts.lock() else { return false };
        let now = Instant::now();
        let entry = attempts.entry(addr).or_insert((0, now));
        if now.duration_since(entry.1) > LOGIN_WINDOW {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0 <= MAX_LOGIN_ATTEMPTS
    }

    fn persist(&self) {
        let Ok(sessions) = self.sessions.lock() else { return };
        match serde_json::to_string_pretty(&*sessions) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    tracing::warn!(error = %e, "failed to persist sessions");
                }
            },
            Err(e) => tracing::warn!(error = %e, "failed to serialize sessions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test secret ("12345678901234567890" in base32)
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_sha1_vectors() {
        // The RFC vectors use 8 digits; checking the low 6 of each
        assert_eq!(totp_code(RFC_SECRET, 59).as_deref(), Some("287082"));
        assert_eq!(totp_code(RFC_SECRET, 1_111_111_109).as_deref(), Some("081804"));
        assert_eq!(totp_code(RFC_SECRET, 1_234_567_890).as_deref(), Some("005924"));
        assert_eq!(totp_code(RFC_SECRET, 2_000_000_000).as_deref(), Some("279037"));
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        let now = 1_234_567_890u64;
        let code = totp_code(RFC_SECRET, now).expect("code");
        assert!(verify_totp(RFC_SECRET, &code, now));
        assert!(verify_totp(RFC_SECRET, &code, now + TOTP_STEP));
        assert!(verify_totp(RFC_SECRET, &code, now - TOTP_STEP));
        assert!(!verify_totp(RFC_SECRET, &code, now + 3 * TOTP_STEP));
        assert!(!verify_totp(RFC_SECRET, "000000", now));
        assert!(!verify_totp(RFC_SECRET, "28708", now), "short code rejected");
    }

    #[test]
    fn bad_secret_yields_none() {
        assert!(totp_code("not base32 !!!", 59).is_none());
    }

    #[test]
    fn generated_secret_round_trips() {
        let secret = generate_totp_secret();
        assert!(totp_code(&secret, 59).is_some());
    }

    #[test]
    fn sessions_persist_and_expire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");

        let token = {
            let store = SessionStore::load(path.clone());
            let token = store.create("TestAgent/1.0");
            assert!(store.check(&token));
            assert!(!store.check("bogus"));
            token
        };

        // Reload: session survives the restart
        let store = SessionStore::load(path.clone());
        assert!(store.check(&token));

        store.remove(&token);
        assert!(!store.check(&token));
        let reloaded = SessionStore::load(path);
        assert!(!reloaded.check(&token));
    }

    #[test]
    fn rate_limit_cuts_off_after_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::load(dir.path().join("sessions.json"));
        let addr: IpAddr = "192.0.2.1".parse().expect("ip");

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            assert!(store.check_rate_limit(addr));
        }
        assert!(!store.check_rate_limit(addr));

        // A different address is unaffected
        let other: IpAddr = "192.0.2.2".parse().expect("ip");
        assert!(store.check_rate_limit(other));
    }
}
