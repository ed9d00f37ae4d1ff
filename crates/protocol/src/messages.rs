use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;
use crate::session::Session;

/// Requests a peer may send to the broker, tagged by the wire `type` field.
///
/// `startSession`, `sessionStarted` and `endSession` double as broker-sent
/// frames: the broker serializes them when notifying the counterpart of a
/// session. An unknown `type` fails deserialization and is answered with a
/// validation error frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    #[serde(rename = "setPeerStatus")]
    SetPeerStatus {
        meta: Map<String, Value>,
        roles: Vec<String>,
        #[serde(rename = "peerId", default)]
        peer_id: Option<String>,
    },
    #[serde(rename = "list")]
    List,
    #[serde(rename = "createSession")]
    CreateSession {
        app_release_uuid: String,
        #[serde(default)]
        preferred_dcs: Option<Vec<String>>,
    },
    #[serde(rename = "startSession")]
    StartSession {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "sessionStarted")]
    SessionStarted {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Opaque WebRTC negotiation payload. Only `sessionId` is interpreted;
    /// the broker relays the original frame text verbatim.
    #[serde(rename = "peer")]
    Peer {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "endSession")]
    EndSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        soft: bool,
    },
    #[serde(rename = "getSessions")]
    GetSessions,
    #[serde(rename = "getSession")]
    GetSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "submitWebRtcStats")]
    SubmitWebRtcStats {
        #[serde(rename = "sessionId")]
        session_id: String,
        stats: String,
    },
}

/// Messages the broker sends back to a peer, tagged by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "peerStatusChanged")]
    PeerStatusChanged {
        roles: Vec<String>,
        meta: Map<String, Value>,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "list")]
    List { producers: Vec<ProducerEntry> },
    #[serde(rename = "sessionCreated")]
    SessionCreated { session_id: String },
    #[serde(rename = "session")]
    Session { session: Session },
    #[serde(rename = "sessionsList")]
    SessionsList { sessions: Vec<Session> },
    #[serde(rename = "sessionEnded")]
    SessionEnded { session_id: String },
    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

/// One producer entry of a `list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerEntry {
    pub id: String,
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,
}

impl From<&BrokerError> for Response {
    fn from(err: &BrokerError) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
