//! Session model and the HTTP bodies exchanged with the session service.
//! Shapes must stay in sync with the service's own DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Lifecycle state of a session as reported by the session service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Closed,
}

/// WebSocket connection parameters bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsConn {
    /// Sticky-routing token supplied by the client cookie.
    pub id: String,
    /// Peer id of the party awaiting a stream.
    pub consumer_id: String,
    /// Peer id of the party producing a stream; set from session start onward.
    #[serde(default)]
    pub producer_id: Option<String>,
}

/// Container placement descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub node_id: String,
    pub region: String,
}

/// A session as seen by this broker: the upstream record plus the
/// broker-local `ending` teardown mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub id: String,
    pub app_release_uuid: String,
    #[serde(default)]
    pub container: Option<Container>,
    pub updated: DateTime<Utc>,
    pub user_id: i64,
    pub ws_conn: WsConn,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    /// Teardown is in progress on this broker. Sticky for the lifetime of
    /// the cached entry; never reported by the session service.
    #[serde(default)]
    pub ending: bool,
}

impl Session {
    /// The counterpart of `peer_id` in this session, if one is attached yet.
    ///
    /// Errors when `peer_id` holds neither seat, e.g. a new peer trying to
    /// act on an orphaned session between two other peers.
    pub fn other_peer_id(&self, peer_id: &str) -> Result<Option<&str>, BrokerError> {
        if peer_id == self.ws_conn.consumer_id {
            Ok(self.ws_conn.producer_id.as_deref())
        } else if self.ws_conn.producer_id.as_deref() == Some(peer_id) {
            Ok(Some(self.ws_conn.consumer_id.as_str()))
        } else {
            Err(BrokerError::unknown_peer(format!(
                "invalid peer_id: {peer_id}"
            )))
        }
    }
}

/// Body of `POST /sessions/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub app_release_uuid: String,
    #[serde(default)]
    pub preferred_dcs: Option<Vec<String>>,
    pub user_id: i64,
    pub ws_conn: CreateSessionWsConn,
}

/// The `ws_conn` of a create call; no producer is attached yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionWsConn {
    pub id: String,
    pub consumer_id: String,
}

/// Body of the `POST /sessions/create` response. A creation ack only; the
/// full record is fetched separately once the container is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

/// Body of `POST /sessions/{id}/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub ws_conn: WsConn,
}

/// Body of the `GET /sessions/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionResponse {
    pub session: Session,
}

/// Body of the session-list responses (`/users/{uid}/sessions` and friends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionsResponse {
    pub sessions: Vec<Session>,
}

/// Body of `POST /sessions/{id}/stats`; `stats` is an opaque JSON-encoded
/// blob produced by the consumer's WebRTC stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitStatsRequest {
    pub stats: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(consumer: &str, producer: Option<&str>) -> Session {
        Session {
            id: "s1".to_string(),
            app_release_uuid: "APP-1".to_string(),
            container: None,
            updated: Utc::now(),
            user_id: 7,
            ws_conn: WsConn {
                id: "wsc-1".to_string(),
                consumer_id: consumer.to_string(),
                producer_id: producer.map(str::to_string),
            },
            status: Some(SessionStatus::Active),
            ending: false,
        }
    }

    #[test]
    fn other_peer_id_resolves_both_seats() {
        let s = session("pc", Some("pp"));
        assert_eq!(s.other_peer_id("pc").unwrap(), Some("pp"));
        assert_eq!(s.other_peer_id("pp").unwrap(), Some("pc"));
    }

    #[test]
    fn other_peer_id_without_producer() {
        let s = session("pc", None);
        assert_eq!(s.other_peer_id("pc").unwrap(), None);
    }

    #[test]
    fn other_peer_id_rejects_strangers() {
        let s = session("pc", Some("pp"));
        let err = s.other_peer_id("intruder").unwrap_err();
        assert_eq!(err.code(), 1404);
        assert!(err.to_string().contains("intruder"));
    }

    #[test]
    fn session_parses_upstream_shape() {
        // What the session service actually returns: no `ending` field,
        // nullable container, lowercase status.
        let json = r#"{
            "id": "s1",
            "app_release_uuid": "APP-1",
            "container": {"id": "c1", "node_id": "n1", "region": "eu-1"},
            "updated": "2024-05-02T11:22:33Z",
            "user_id": 42,
            "ws_conn": {"id": "wsc", "consumer_id": "pc"},
            "status": "pending"
        }"#;
        let s: Session = serde_json::from_str(json).unwrap();
        assert_eq!(s.status, Some(SessionStatus::Pending));
        assert_eq!(s.ws_conn.producer_id, None);
        assert_eq!(s.container.as_ref().unwrap().region, "eu-1");
        assert!(!s.ending);
    }

    #[test]
    fn start_request_carries_all_conn_fields() {
        let req = StartSessionRequest {
            ws_conn: WsConn {
                id: "wsc".to_string(),
                consumer_id: "pc".to_string(),
                producer_id: Some("pp".to_string()),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""id":"wsc""#));
        assert!(json.contains(r#""consumer_id":"pc""#));
        assert!(json.contains(r#""producer_id":"pp""#));
    }
}
