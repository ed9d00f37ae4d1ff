//! Verification of signed browser session cookies.
//!
//! Consumers authenticate with the session cookie minted by the legacy web
//! frontend (Flask / `itsdangerous` URL-safe timed format): an optionally
//! zlib-compressed URL-safe base64 JSON payload, a big-endian timestamp and
//! an HMAC-SHA1 signature whose key is derived as
//! `HMAC-SHA1(secret, "cookie-session")`. Verification must stay
//! bit-compatible with that format for the credential mode to interoperate.

use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

const SIGNING_SALT: &str = "cookie-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CookieError {
    /// Signature missing, malformed, or not produced with our key. Payloads
    /// that fail to decode land here too: a well-signed token always decodes.
    #[error("bad signature")]
    BadSignature,
    /// Signature valid but older than the allowed max age.
    #[error("signature expired")]
    Expired,
}

pub struct CookieVerifier {
    derived_key: Vec<u8>,
}

impl CookieVerifier {
    pub fn new(secret_key: &str) -> Self {
        let mut mac =
            HmacSha1::new_from_slice(secret_key.as_bytes()).expect("hmac accepts any key length");
        mac.update(SIGNING_SALT.as_bytes());
        Self {
            derived_key: mac.finalize().into_bytes().to_vec(),
        }
    }

    /// Verify `token` and return the decoded session payload. `max_age` is
    /// in seconds, measured against the timestamp embedded in the token.
    pub fn verify(&self, token: &str, max_age: u64) -> Result<Map<String, Value>, CookieError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.verify_at(token, max_age, now)
    }

    fn verify_at(
        &self,
        token: &str,
        max_age: u64,
        now: u64,
    ) -> Result<Map<String, Value>, CookieError> {
        // token = payload '.' timestamp '.' signature; the base64 alphabet
        // contains no '.', so splitting from the right is unambiguous.
        let (value, sig_b64) = token.rsplit_once('.').ok_or(CookieError::BadSignature)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| CookieError::BadSignature)?;
        let mut mac =
            HmacSha1::new_from_slice(&self.derived_key).expect("hmac accepts any key length");
        mac.update(value.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| CookieError::BadSignature)?;

        let (payload, ts_b64) = value.rsplit_once('.').ok_or(CookieError::BadSignature)?;
        let ts_bytes = URL_SAFE_NO_PAD
            .decode(ts_b64)
            .map_err(|_| CookieError::BadSignature)?;
        if ts_bytes.len() > 8 {
            return Err(CookieError::BadSignature);
        }
        let ts = ts_bytes
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        if now.saturating_sub(ts) > max_age {
            return Err(CookieError::Expired);
        }

        decode_payload(payload)
    }
}

/// Decode the payload part: a leading '.' marks a zlib-compressed body.
fn decode_payload(payload: &str) -> Result<Map<String, Value>, CookieError> {
    let (compressed, body) = match payload.strip_prefix('.') {
        Some(rest) => (true, rest),
        None => (false, payload),
    };
    let raw = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| CookieError::BadSignature)?;
    let json = if compressed {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|_| CookieError::BadSignature)?;
        out
    } else {
        raw
    };
    match serde_json::from_slice(&json) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(CookieError::BadSignature),
    }
}

#[cfg(test)]
impl CookieVerifier {
    /// Counterpart of `verify_at` so tests can mint cookies in the exact
    /// wire format without a running frontend.
    pub(crate) fn sign_payload_str(&self, payload: &str, timestamp: u64) -> String {
        let be = timestamp.to_be_bytes();
        let first = be.iter().position(|&b| b != 0).unwrap_or(be.len() - 1);
        let ts = URL_SAFE_NO_PAD.encode(&be[first..]);
        let value = format!("{payload}.{ts}");
        let mut mac =
            HmacSha1::new_from_slice(&self.derived_key).expect("hmac accepts any key length");
        mac.update(value.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{value}.{sig}")
    }

    pub(crate) fn sign_map(&self, map: &Map<String, Value>, timestamp: u64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(map).unwrap());
        self.sign_payload_str(&payload, timestamp)
    }

    pub(crate) fn sign_map_now(&self, map: &Map<String, Value>) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        self.sign_map(map, now)
    }
}
