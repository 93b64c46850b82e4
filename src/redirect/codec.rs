//! Interception codec for the AMT redirection control plane.
//!
//! Until a session reaches direct-relay mode every frame in both directions
//! passes through here. A frame may be forwarded (possibly shortened),
//! replaced by a synthesised reply, or dropped (empty output). After the
//! device reports authentication success the relay stops consulting the
//! codec and traffic flows verbatim.
//!
//! Parsing never reads past the supplied buffer: truncated frames, declared
//! payload lengths exceeding the buffer, and zero-length challenge strings
//! all degrade to a dropped frame, not a panic.

use tracing::debug;

use super::challenge::AuthChallenge;
use super::{
    AUTH_HEADER_LEN, AUTH_STATUS_FAILURE, AUTH_STATUS_SUCCESS, AUTH_TYPE_DIGEST, AUTH_TYPE_QUERY,
    CMD_AUTHENTICATE_SESSION, CMD_AUTHENTICATE_SESSION_REPLY, CMD_END_REDIRECTION_SESSION,
    CMD_START_REDIRECTION_SESSION, CMD_START_REDIRECTION_SESSION_REPLY, REDIRECTION_URI,
    START_REPLY_LEN,
};
use crate::error::RedirectError;

/// Five-byte envelope opening every synthesised AuthenticateSession frame.
const AUTH_REPLY_HEADER: [u8; 5] = [0x13, 0x00, 0x00, 0x00, 0x04];

/// Bytes of length/padding overhead counted into a reply's content length.
const CONTENT_LENGTH_PADDING: u32 = 8;

/// Process one frame travelling browser → device.
///
/// Returns the bytes to forward; empty means drop. The only error is
/// [`RedirectError::DigestOverflow`], which is fatal to the session.
pub fn process_browser_frame(
    msg: &[u8],
    challenge: &mut AuthChallenge,
) -> Result<Vec<u8>, RedirectError> {
    match msg.first() {
        Some(&CMD_START_REDIRECTION_SESSION) if msg.len() >= 8 => Ok(msg[..8].to_vec()),
        Some(&CMD_END_REDIRECTION_SESSION) if msg.len() >= 4 => Ok(msg[..4].to_vec()),
        Some(&CMD_AUTHENTICATE_SESSION) => authenticate_session(msg, challenge),
        _ => Ok(Vec::new()),
    }
}

/// Process one frame travelling device → browser.
///
/// Returns the bytes to forward (empty means drop) and whether this frame
/// switched the session into direct-relay mode.
pub fn process_device_frame(msg: &[u8], challenge: &mut AuthChallenge) -> (Vec<u8>, bool) {
    match msg.first() {
        Some(&CMD_START_REDIRECTION_SESSION_REPLY) => (start_session_reply(msg), false),
        Some(&CMD_AUTHENTICATE_SESSION_REPLY) => authenticate_session_reply(msg, challenge),
        _ => (Vec::new(), false),
    }
}

/// StartRedirectionSessionReply: on status 0 forward the fixed header plus
/// the OEM-length trailer, otherwise drop.
fn start_session_reply(msg: &[u8]) -> Vec<u8> {
    if msg.len() < 4 || msg[1] != 0 {
        return Vec::new();
    }
    if msg.len() < START_REPLY_LEN {
        return Vec::new();
    }
    let oem_len = msg[12] as usize;
    if msg.len() < START_REPLY_LEN + oem_len {
        return Vec::new();
    }
    msg[..START_REPLY_LEN + oem_len].to_vec()
}

/// AuthenticateSessionReply from the device.
///
/// Digest + failure carries the challenge (realm, nonce, qop) which is
/// copied into the session state; the frame is still forwarded so the
/// browser sees the device's answer. Success on any non-query auth type
/// flips the session to direct relay.
fn authenticate_session_reply(msg: &[u8], challenge: &mut AuthChallenge) -> (Vec<u8>, bool) {
    if msg.len() < AUTH_HEADER_LEN {
        return (Vec::new(), false);
    }

    let auth_status = msg[1];
    let auth_type = msg[4];
    // lengths in the reply payload are little-endian
    let payload_len = u32::from_le_bytes([msg[5], msg[6], msg[7], msg[8]]) as usize;
    let Some(payload) = msg.get(AUTH_HEADER_LEN..AUTH_HEADER_LEN + payload_len) else {
        return (Vec::new(), false);
    };

    if auth_type == AUTH_TYPE_DIGEST && auth_status == AUTH_STATUS_FAILURE {
        match parse_digest_challenge(payload) {
            Ok((realm, nonce, qop)) => challenge.set_challenge(realm, nonce, qop),
            Err(err) => {
                debug!(%err, "dropping malformed digest challenge");
                return (Vec::new(), false);
            }
        }
        (msg.to_vec(), false)
    } else if auth_type != AUTH_TYPE_QUERY && auth_status == AUTH_STATUS_SUCCESS {
        (msg.to_vec(), true)
    } else {
        (msg.to_vec(), false)
    }
}

/// Three u8-length-prefixed strings: realm, nonce, qop. Zero lengths are
/// legal; truncation is not.
fn parse_digest_challenge(payload: &[u8]) -> Result<(String, String, String), RedirectError> {
    let mut off = 0;
    let realm = read_string(payload, &mut off)?;
    let nonce = read_string(payload, &mut off)?;
    let qop = read_string(payload, &mut off)?;
    Ok((realm, nonce, qop))
}

fn read_string(buf: &[u8], off: &mut usize) -> Result<String, RedirectError> {
    let len = *buf
        .get(*off)
        .ok_or(RedirectError::ProtocolDecode("missing string length"))? as usize;
    *off += 1;
    let bytes = buf
        .get(*off..*off + len)
        .ok_or(RedirectError::ProtocolDecode("string exceeds payload"))?;
    *off += len;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// AuthenticateSession from the browser.
fn authenticate_session(
    msg: &[u8],
    challenge: &mut AuthChallenge,
) -> Result<Vec<u8>, RedirectError> {
    if msg.len() < AUTH_HEADER_LEN {
        return Ok(Vec::new());
    }

    // The console client opens with an all-zero probe; let it through.
    if msg.len() == AUTH_HEADER_LEN && msg[1..].iter().all(|&b| b == 0) {
        return Ok(msg.to_vec());
    }

    // header past the command byte: status u8, unknown u16, auth type u8
    let auth_type = msg[4];
    if auth_type != AUTH_TYPE_DIGEST {
        return Ok(Vec::new());
    }

    if challenge.has_realm() {
        build_digest_reply(challenge)
    } else {
        build_empty_auth(challenge)
    }
}

/// First authentication attempt, before the device has issued a challenge:
/// announce the username and the redirection URI so the device answers with
/// its digest parameters.
fn build_empty_auth(challenge: &AuthChallenge) -> Result<Vec<u8>, RedirectError> {
    let username = challenge.username.as_bytes();
    let url = REDIRECTION_URI.as_bytes();
    if username.len() > usize::from(u8::MAX) {
        return Err(RedirectError::DigestOverflow);
    }

    let content_len = username.len() as u32 + url.len() as u32 + CONTENT_LENGTH_PADDING;

    let mut buf = Vec::with_capacity(AUTH_REPLY_HEADER.len() + 4 + content_len as usize);
    buf.extend_from_slice(&AUTH_REPLY_HEADER);
    buf.extend_from_slice(&content_len.to_le_bytes()); // flip flop endian for content length
    buf.push(username.len() as u8);
    buf.extend_from_slice(username);
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.push(url.len() as u8);
    buf.extend_from_slice(url);
    buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    Ok(buf)
}

/// Full digest reply once the challenge has a realm. Bumps the nonce count,
/// rotates the cnonce, and serialises the eight fields in wire order.
fn build_digest_reply(challenge: &mut AuthChallenge) -> Result<Vec<u8>, RedirectError> {
    challenge.next_cnonce();
    let response = challenge.compute_response();
    let nc_hex = format!("{:08x}", challenge.nonce_count);

    let fields: [&[u8]; 8] = [
        challenge.username.as_bytes(),
        challenge.realm.as_bytes(),
        challenge.nonce.as_bytes(),
        REDIRECTION_URI.as_bytes(),
        challenge.cnonce.as_bytes(),
        nc_hex.as_bytes(),
        response.as_bytes(),
        challenge.qop.as_bytes(),
    ];

    let total: u64 = fields.iter().map(|f| f.len() as u64).sum::<u64>()
        + u64::from(CONTENT_LENGTH_PADDING);
    if total > u64::from(u32::MAX) {
        return Err(RedirectError::DigestOverflow);
    }

    let mut buf = Vec::with_capacity(AUTH_REPLY_HEADER.len() + 4 + total as usize);
    buf.extend_from_slice(&AUTH_REPLY_HEADER);
    buf.extend_from_slice(&(total as u32).to_le_bytes()); // flip flop endian for content length
    for field in fields {
        write_field(&mut buf, field)?;
    }
    Ok(buf)
}

/// One wire field: u8 length followed by the raw bytes. Anything longer
/// than 255 bytes cannot be represented and is fatal.
fn write_field(buf: &mut Vec<u8>, field: &[u8]) -> Result<(), RedirectError> {
    if field.len() > usize::from(u8::MAX) {
        return Err(RedirectError::DigestOverflow);
    }
    buf.push(field.len() as u8);
    buf.extend_from_slice(field);
    Ok(())
}
