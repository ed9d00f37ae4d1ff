use thiserror::Error;

/// Classified broker errors. The numeric codes travel on the wire inside
/// `error` frames and must stay stable across releases.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Malformed or unsupported client request.
    #[error("{0}")]
    RequestValidation(String),
    /// The referenced peer is not connected to this broker.
    #[error("{0}")]
    UnknownPeer(String),
    /// The session service has no record of the session.
    #[error("{0}")]
    SessionNotFound(String),
    /// The user has exhausted their session quota upstream.
    #[error("sessions quota limit exceeded for user")]
    QuotaExceeded,
    /// A broker-side precondition failed.
    #[error("{0}")]
    Operational(String),
    /// The session service returned a failure or could not be reached.
    #[error("{0}")]
    SessionSvc(String),
}

impl BrokerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::RequestValidation(message.into())
    }

    pub fn unknown_peer(message: impl Into<String>) -> Self {
        Self::UnknownPeer(message.into())
    }

    pub fn session_not_found(message: impl Into<String>) -> Self {
        Self::SessionNotFound(message.into())
    }

    pub fn operational(message: impl Into<String>) -> Self {
        Self::Operational(message.into())
    }

    pub fn session_svc(message: impl Into<String>) -> Self {
        Self::SessionSvc(message.into())
    }

    /// Wire error code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            Self::RequestValidation(_) => 1400,
            Self::UnknownPeer(_) | Self::SessionNotFound(_) => 1404,
            Self::QuotaExceeded => 1429,
            Self::Operational(_) | Self::SessionSvc(_) => 1409,
        }
    }
}
