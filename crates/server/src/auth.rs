//! Authentication gate for the WebSocket handshake.
//!
//! Runs exactly once per connection, before the upgrade completes. Producers
//! present a shared token cookie; consumers present the signed browser
//! session cookie. Rejections replace the upgrade with a plain HTTP response.

use axum::http::{HeaderMap, StatusCode, header};
use cookie::Cookie;
use serde_json::{Map, Value};
use switchboard_protocol::BrokerError;

use crate::config::{Config, UidSource};
use crate::signed_cookie::CookieVerifier;

pub const AUTH_TOKEN_COOKIE: &str = "sigsvc_authtoken";
pub const SESSION_COOKIE: &str = "session";
pub const WS_CONN_ID_COOKIE: &str = "sigsvc_wsconnid";
pub const X_AUTH_UID_HEADER: &str = "x-auth-uid";

/// Replaces the upgrade response when a handshake is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRejection {
    pub status: StatusCode,
    pub body: &'static str,
}

const INVALID_TOKEN: AuthRejection = AuthRejection {
    status: StatusCode::UNAUTHORIZED,
    body: "Invalid auth token\n",
};

const MISSING_TOKEN: AuthRejection = AuthRejection {
    status: StatusCode::UNAUTHORIZED,
    body: "Missing auth token\n",
};

pub struct AuthGate {
    debug_no_auth: bool,
    auth_token: Option<String>,
    verifier: Option<CookieVerifier>,
    session_lifetime_secs: u64,
    uid_source: UidSource,
}

impl AuthGate {
    pub fn new(config: &Config) -> Self {
        Self {
            debug_no_auth: config.debug_no_auth,
            auth_token: config.auth_token.clone(),
            verifier: config.secret_key.as_deref().map(CookieVerifier::new),
            session_lifetime_secs: config.session_lifetime_secs,
            uid_source: config.uid_source,
        }
    }

    /// Admit or reject a handshake based on its headers alone; with a fixed
    /// configuration this is a pure function of the cookie jar.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        if self.debug_no_auth {
            return Ok(());
        }
        if headers.contains_key(header::COOKIE) {
            if let Some(token) = cookie_value(headers, AUTH_TOKEN_COOKIE) {
                let ok = self
                    .auth_token
                    .as_deref()
                    .is_some_and(|expected| constant_time_eq(expected.as_bytes(), token.as_bytes()));
                if ok {
                    tracing::debug!("authenticated producer via shared token");
                    return Ok(());
                }
                return Err(INVALID_TOKEN);
            }
            if let Some(session) = cookie_value(headers, SESSION_COOKIE) {
                let Some(verifier) = &self.verifier else {
                    return Err(INVALID_TOKEN);
                };
                return match verifier.verify(&session, self.session_lifetime_secs) {
                    Ok(data) => {
                        tracing::debug!(
                            user_id = ?user_id_from_session(&data),
                            "authenticated consumer via session cookie"
                        );
                        Ok(())
                    }
                    Err(e) => {
                        tracing::debug!("session cookie rejected: {e}");
                        Err(INVALID_TOKEN)
                    }
                };
            }
        }
        Err(MISSING_TOKEN)
    }

    /// The user id carried by the handshake, per the configured source.
    /// Producers have none; a consumer without one can never create sessions.
    pub fn extract_user_id(&self, headers: &HeaderMap) -> Option<i64> {
        match self.uid_source {
            UidSource::Header => {
                let raw = headers.get(X_AUTH_UID_HEADER)?.to_str().ok()?;
                match raw.parse() {
                    Ok(uid) => Some(uid),
                    Err(_) => {
                        tracing::warn!("non-numeric {X_AUTH_UID_HEADER} header: {raw}");
                        None
                    }
                }
            }
            UidSource::SessionCookie => {
                let verifier = self.verifier.as_ref()?;
                let session = cookie_value(headers, SESSION_COOKIE)?;
                match verifier.verify(&session, self.session_lifetime_secs) {
                    Ok(data) => user_id_from_session(&data),
                    Err(e) => {
                        tracing::warn!("session cookie failed re-verification: {e}");
                        None
                    }
                }
            }
        }
    }
}

/// The sticky-routing token every client must present at handshake time.
pub fn ws_conn_id(headers: &HeaderMap) -> Result<String, BrokerError> {
    cookie_value(headers, WS_CONN_ID_COOKIE)
        .ok_or_else(|| BrokerError::validation(format!("no {WS_CONN_ID_COOKIE} cookie found")))
}

fn user_id_from_session(data: &Map<String, Value>) -> Option<i64> {
    // flask-login stores the id as a string; accept a bare number too
    match data.get("_user_id")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// First value of the named cookie across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for raw in headers.get_all(header::COOKIE) {
        let Ok(raw) = raw.to_str() else { continue };
        for parsed in Cookie::split_parse(raw) {
            if let Ok(c) = parsed
                && c.name() == name
            {
                return Some(c.value().to_string());
            }
        }
    }
    None
}

/// Constant-time byte comparison so token checks don't leak prefix length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SESSION_LIFETIME_SECS;

    const SECRET: &str = "test-flask-secret";
    const TOKEN: &str = "producer-token-abcd";

    fn gate() -> AuthGate {
        AuthGate::new(&test_config())
    }

    fn test_config() -> Config {
        Config {
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 0,
            sessionsvc_url: "http://sessionsvc".to_string(),
            secret_key: Some(SECRET.to_string()),
            session_lifetime_secs: DEFAULT_SESSION_LIFETIME_SECS,
            auth_token: Some(TOKEN.to_string()),
            debug_no_auth: false,
            uid_source: UidSource::Header,
        }
    }

    fn headers_with_cookie(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, raw.parse().unwrap());
        headers
    }

    fn session_cookie(user_id: &str) -> String {
        let mut map = Map::new();
        map.insert("_user_id".to_string(), Value::String(user_id.to_string()));
        CookieVerifier::new(SECRET).sign_map_now(&map)
    }

    #[test]
    fn valid_auth_token_is_allowed() {
        let headers = headers_with_cookie(&format!("sigsvc_authtoken={TOKEN}"));
        assert!(gate().authenticate(&headers).is_ok());
    }

    #[test]
    fn invalid_auth_token_is_rejected() {
        let headers = headers_with_cookie("sigsvc_authtoken=dcba");
        assert_eq!(gate().authenticate(&headers).unwrap_err(), INVALID_TOKEN);
    }

    #[test]
    fn valid_session_cookie_is_allowed() {
        let headers = headers_with_cookie(&format!("session={}", session_cookie("42")));
        assert!(gate().authenticate(&headers).is_ok());
    }

    #[test]
    fn invalid_session_cookie_is_rejected() {
        let headers = headers_with_cookie("session=.abc");
        assert_eq!(gate().authenticate(&headers).unwrap_err(), INVALID_TOKEN);
    }

    #[test]
    fn expired_session_cookie_is_rejected() {
        let mut map = Map::new();
        map.insert("_user_id".to_string(), Value::String("42".to_string()));
        let old = CookieVerifier::new(SECRET).sign_map(&map, 1);
        let headers = headers_with_cookie(&format!("session={old}"));
        assert_eq!(gate().authenticate(&headers).unwrap_err(), INVALID_TOKEN);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        assert_eq!(
            gate().authenticate(&HeaderMap::new()).unwrap_err(),
            MISSING_TOKEN
        );
        // cookies present, but none of ours
        let headers = headers_with_cookie("tracking=xyz");
        assert_eq!(gate().authenticate(&headers).unwrap_err(), MISSING_TOKEN);
    }

    #[test]
    fn auth_token_cookie_without_configured_token_is_rejected() {
        let mut config = test_config();
        config.auth_token = None;
        let gate = AuthGate::new(&config);
        let headers = headers_with_cookie(&format!("sigsvc_authtoken={TOKEN}"));
        assert_eq!(gate.authenticate(&headers).unwrap_err(), INVALID_TOKEN);
    }

    #[test]
    fn debug_bypass_allows_anything() {
        let mut config = test_config();
        config.debug_no_auth = true;
        let gate = AuthGate::new(&config);
        assert!(gate.authenticate(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn auth_is_idempotent_for_a_fixed_jar() {
        let headers = headers_with_cookie(&format!("sigsvc_authtoken={TOKEN}"));
        let gate = gate();
        assert_eq!(
            gate.authenticate(&headers).is_ok(),
            gate.authenticate(&headers).is_ok()
        );
    }

    #[test]
    fn user_id_from_header_variant() {
        let mut headers = HeaderMap::new();
        headers.insert(X_AUTH_UID_HEADER, "42".parse().unwrap());
        assert_eq!(gate().extract_user_id(&headers), Some(42));

        headers.insert(X_AUTH_UID_HEADER, "not-a-number".parse().unwrap());
        assert_eq!(gate().extract_user_id(&headers), None);

        assert_eq!(gate().extract_user_id(&HeaderMap::new()), None);
    }

    #[test]
    fn user_id_from_cookie_variant() {
        let mut config = test_config();
        config.uid_source = UidSource::SessionCookie;
        let gate = AuthGate::new(&config);
        let headers = headers_with_cookie(&format!(
            "sigsvc_wsconnid=abc; session={}",
            session_cookie("1337")
        ));
        assert_eq!(gate.extract_user_id(&headers), Some(1337));
    }

    #[test]
    fn ws_conn_id_extraction() {
        let headers = headers_with_cookie("sigsvc_wsconnid=abc; session=xyz");
        assert_eq!(ws_conn_id(&headers).unwrap(), "abc");

        let err = ws_conn_id(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.code(), 1400);
        assert!(err.to_string().contains("sigsvc_wsconnid"));
    }
}
