//! Mutable HTTP-Digest state for one redirection session.
//!
//! The device answers the first real authentication attempt with a digest
//! challenge (realm, nonce, qop). The codec copies those into this struct
//! and from then on every synthesised auth frame carries an RFC 2617 MD5
//! response for `POST /RedirectionService`.

use rand::RngCore;

use super::REDIRECTION_URI;

/// Number of random hex characters in a client nonce.
const CNONCE_LEN: usize = 10;

/// Digest parameters accumulated over a session's authentication exchange.
///
/// `nonce_count` is strictly increasing for the lifetime of the session; it
/// is bumped exactly once per digest reply the codec synthesises.
/// Deliberately not `Debug`: the struct holds the device's plaintext
/// password.
#[derive(Default)]
pub struct AuthChallenge {
    pub username: String,
    password: String,
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub cnonce: String,
    pub nonce_count: u32,
}

impl AuthChallenge {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Whether the device has supplied a digest challenge yet.
    pub fn has_realm(&self) -> bool {
        !self.realm.is_empty()
    }

    /// Copy a digest challenge received from the device.
    pub fn set_challenge(&mut self, realm: String, nonce: String, qop: String) {
        self.realm = realm;
        self.nonce = nonce;
        self.qop = qop;
    }

    /// Generate a fresh cnonce and advance the nonce count.
    ///
    /// Called once per synthesised digest reply, before computing the
    /// response hash.
    pub fn next_cnonce(&mut self) {
        self.nonce_count += 1;
        self.cnonce = random_hex(CNONCE_LEN);
    }

    /// RFC 2617 response hash for the current challenge state.
    ///
    /// Falls back to the legacy RFC 2069 form when the device sent no qop.
    pub fn compute_response(&self) -> String {
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.username, self.realm, self.password
        ));
        let ha2 = md5_hex(&format!("POST:{REDIRECTION_URI}"));

        if self.qop.is_empty() {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        } else {
            md5_hex(&format!(
                "{ha1}:{}:{:08x}:{}:{}:{ha2}",
                self.nonce, self.nonce_count, self.cnonce, self.qop
            ))
        }
    }

    /// Zero the stored plaintext password. Called at session teardown; the
    /// secret must not outlive the session and is never logged.
    pub fn wipe_secret(&mut self) {
        // SAFETY: NUL bytes are valid UTF-8.
        unsafe {
            for b in self.password.as_bytes_mut() {
                *b = 0;
            }
        }
        self.password.clear();
    }

    #[cfg(test)]
    pub(crate) fn secret(&self) -> &str {
        &self.password
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Random lowercase-hex string of exactly `len` characters.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    hex.truncate(len);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_cnonce_increments_count_and_rotates_cnonce() {
        let mut ch = AuthChallenge::new("admin", "P@ssw0rd");
        assert_eq!(ch.nonce_count, 0);

        ch.next_cnonce();
        assert_eq!(ch.nonce_count, 1);
        assert_eq!(ch.cnonce.len(), CNONCE_LEN);
        let first = ch.cnonce.clone();

        ch.next_cnonce();
        assert_eq!(ch.nonce_count, 2);
        assert_ne!(ch.cnonce, first, "cnonce must rotate per reply");
    }

    #[test]
    fn response_is_deterministic_for_fixed_state() {
        let mut ch = AuthChallenge::new("admin", "P@ssw0rd");
        ch.set_challenge(
            "Digest:F60B0000".to_string(),
            "aGVsbG8gd29ybGQ=".to_string(),
            "auth".to_string(),
        );
        ch.nonce_count = 1;
        ch.cnonce = "0123456789".to_string();

        let a = ch.compute_response();
        let b = ch.compute_response();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn response_depends_on_nonce_and_count() {
        let mut ch = AuthChallenge::new("admin", "P@ssw0rd");
        ch.set_challenge("realm".to_string(), "nonce-a".to_string(), "auth".to_string());
        ch.nonce_count = 1;
        ch.cnonce = "aabbccddee".to_string();
        let with_first_nonce = ch.compute_response();

        ch.nonce = "nonce-b".to_string();
        assert_ne!(ch.compute_response(), with_first_nonce);

        ch.nonce = "nonce-a".to_string();
        ch.nonce_count = 2;
        assert_ne!(ch.compute_response(), with_first_nonce);
    }

    #[test]
    fn empty_qop_uses_legacy_form() {
        let mut ch = AuthChallenge::new("admin", "P@ssw0rd");
        ch.set_challenge("realm".to_string(), "nonce".to_string(), String::new());
        ch.nonce_count = 1;
        ch.cnonce = "aabbccddee".to_string();
        let legacy = ch.compute_response();

        ch.qop = "auth".to_string();
        assert_ne!(ch.compute_response(), legacy);
    }

    #[test]
    fn wipe_secret_clears_the_password() {
        let mut ch = AuthChallenge::new("admin", "P@ssw0rd");
        ch.wipe_secret();
        assert!(ch.secret().is_empty());
    }

    #[test]
    fn random_hex_honours_odd_lengths() {
        for len in [1, 2, 9, 10, 33] {
            let s = random_hex(len);
            assert_eq!(s.len(), len);
            assert!(s.bytes().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
