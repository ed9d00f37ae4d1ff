//! Environment-driven configuration. The broker has no CLI and no config
//! file; everything comes in through the environment.

use anyhow::{Context, Result, bail};

/// Cookie max age when `FLASK_PERMANENT_SESSION_LIFETIME` is not set (31 days).
pub const DEFAULT_SESSION_LIFETIME_SECS: u64 = 2_678_400;

/// Where a consumer's user id is taken from at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidSource {
    /// An upstream authenticator already verified the browser session and
    /// forwards the id in `X-Auth-UID`.
    Header,
    /// The broker re-verifies the `session` cookie itself and extracts the
    /// id from the signed payload.
    SessionCookie,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ip: String,
    pub listen_port: u16,
    /// Base URL of the upstream session service, without a trailing slash.
    pub sessionsvc_url: String,
    /// HMAC secret of the browser session cookie.
    pub secret_key: Option<String>,
    pub session_lifetime_secs: u64,
    /// Shared producer credential.
    pub auth_token: Option<String>,
    pub debug_no_auth: bool,
    pub uid_source: UidSource,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup. The binary passes
    /// `std::env::var`; tests pass a closure.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_ip = get("LISTEN_IP").unwrap_or_else(|| "0.0.0.0".to_string());
        let listen_port = match get("LISTEN_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid LISTEN_PORT: {raw}"))?,
            None => 8787,
        };
        let Some(sessionsvc_url) = get("SESSIONSVC_URL") else {
            bail!("SESSIONSVC_URL is not set");
        };
        let session_lifetime_secs = match get("FLASK_PERMANENT_SESSION_LIFETIME") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid FLASK_PERMANENT_SESSION_LIFETIME: {raw}"))?,
            None => DEFAULT_SESSION_LIFETIME_SECS,
        };
        let debug_no_auth = get("DEBUG_NO_AUTH").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let uid_source = match get("AUTH_UID_SOURCE").as_deref() {
            None | Some("header") => UidSource::Header,
            Some("cookie") => UidSource::SessionCookie,
            Some(other) => {
                bail!("invalid AUTH_UID_SOURCE: {other} (expected \"header\" or \"cookie\")")
            }
        };

        Ok(Self {
            listen_ip,
            listen_port,
            sessionsvc_url: sessionsvc_url.trim_end_matches('/').to_string(),
            secret_key: get("FLASK_SECRET_KEY"),
            session_lifetime_secs,
            auth_token: get("AUTH_TOKEN"),
            debug_no_auth,
            uid_source,
        })
    }

    /// Non-fatal configuration issues, logged once at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.debug_no_auth {
            if self.auth_token.is_none() {
                issues.push(
                    "AUTH_TOKEN is not set; producer handshakes will be rejected".to_string(),
                );
            }
            if self.secret_key.is_none() {
                issues.push(
                    "FLASK_SECRET_KEY is not set; consumer session cookies cannot be verified"
                        .to_string(),
                );
            }
        }
        if self.uid_source == UidSource::SessionCookie && self.secret_key.is_none() {
            issues.push("AUTH_UID_SOURCE=cookie requires FLASK_SECRET_KEY".to_string());
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_with_minimal_env() {
        let config =
            Config::from_lookup(lookup(&[("SESSIONSVC_URL", "http://sessionsvc:8080")])).unwrap();
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.listen_port, 8787);
        assert_eq!(config.session_lifetime_secs, DEFAULT_SESSION_LIFETIME_SECS);
        assert!(!config.debug_no_auth);
        assert_eq!(config.uid_source, UidSource::Header);
    }

    #[test]
    fn sessionsvc_url_is_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn sessionsvc_url_trailing_slash_is_trimmed() {
        let config =
            Config::from_lookup(lookup(&[("SESSIONSVC_URL", "http://sessionsvc:8080/")])).unwrap();
        assert_eq!(config.sessionsvc_url, "http://sessionsvc:8080");
    }

    #[test]
    fn invalid_port_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("SESSIONSVC_URL", "http://sessionsvc"),
            ("LISTEN_PORT", "not-a-port"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn debug_no_auth_parses_case_insensitively() {
        let config = Config::from_lookup(lookup(&[
            ("SESSIONSVC_URL", "http://sessionsvc"),
            ("DEBUG_NO_AUTH", "True"),
        ]))
        .unwrap();
        assert!(config.debug_no_auth);
    }

    #[test]
    fn uid_source_cookie() {
        let config = Config::from_lookup(lookup(&[
            ("SESSIONSVC_URL", "http://sessionsvc"),
            ("AUTH_UID_SOURCE", "cookie"),
        ]))
        .unwrap();
        assert_eq!(config.uid_source, UidSource::SessionCookie);
    }

    #[test]
    fn uid_source_rejects_unknown_value() {
        let result = Config::from_lookup(lookup(&[
            ("SESSIONSVC_URL", "http://sessionsvc"),
            ("AUTH_UID_SOURCE", "ldap"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn validate_flags_missing_credentials() {
        let config =
            Config::from_lookup(lookup(&[("SESSIONSVC_URL", "http://sessionsvc")])).unwrap();
        let issues = config.validate();
        assert_eq!(issues.len(), 2);

        let config = Config::from_lookup(lookup(&[
            ("SESSIONSVC_URL", "http://sessionsvc"),
            ("AUTH_TOKEN", "secret"),
            ("FLASK_SECRET_KEY", "key"),
        ]))
        .unwrap();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn validate_accepts_debug_bypass_without_credentials() {
        let config = Config::from_lookup(lookup(&[
            ("SESSIONSVC_URL", "http://sessionsvc"),
            ("DEBUG_NO_AUTH", "true"),
        ]))
        .unwrap();
        assert!(config.validate().is_empty());
    }
}
