//! Session cache and lifecycle coordination against the session service.
//!
//! The service is the authority; the cache only spares repeat lookups
//! between lifecycle changes. Every mutating call invalidates the entry
//! before returning so the next read observes upstream truth.

use std::collections::HashMap;
use std::sync::Mutex;

use switchboard_protocol::{
    BrokerError, CreateSessionRequest, CreateSessionResponse, CreateSessionWsConn, Session,
    StartSessionRequest, SubmitStatsRequest, WsConn,
};

use crate::peer::{Peer, PeerRole};
use crate::sessionsvc::SessionSvcClient;

pub struct SessionsManager {
    client: SessionSvcClient,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionsManager {
    pub fn new(client: SessionSvcClient) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn invalidate(&self, session_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    /// Atomically claim the teardown of a session. Returns false when an
    /// earlier caller already claimed it; the `ending` mark stays set for
    /// the lifetime of the cache entry.
    pub fn try_mark_ending(&self, session_id: &str) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get_mut(session_id) {
            Some(session) if session.ending => false,
            Some(session) => {
                session.ending = true;
                true
            }
            None => {
                tracing::warn!(session_id = %session_id, "marking uncached session as ending");
                true
            }
        }
    }

    /// Run a new app for the consumer. If the app already exists in a paused
    /// state upstream, it resumes with the new connection parameters. The
    /// response is a creation ack only; the cache is untouched.
    pub async fn create_session(
        &self,
        peer: &Peer,
        app_release_uuid: String,
        preferred_dcs: Option<Vec<String>>,
    ) -> Result<CreateSessionResponse, BrokerError> {
        if peer.role() != Some(PeerRole::Consumer) {
            return Err(BrokerError::operational("only consumers can run apps"));
        }
        let Some(user_id) = peer.user_id else {
            return Err(BrokerError::operational("user_id is undefined"));
        };
        self.client
            .create_session(&CreateSessionRequest {
                app_release_uuid,
                preferred_dcs,
                user_id,
                ws_conn: CreateSessionWsConn {
                    id: peer.ws_conn_id.clone(),
                    consumer_id: peer.id.clone(),
                },
            })
            .await
    }

    /// Attach the producer and start streaming. The cache entry is refreshed
    /// from upstream before returning so readers observe the new status.
    pub async fn start_session(
        &self,
        session_id: &str,
        ws_conn_id: &str,
        producer_id: &str,
        consumer_id: &str,
    ) -> Result<(), BrokerError> {
        self.client
            .start_session(
                session_id,
                &StartSessionRequest {
                    ws_conn: WsConn {
                        id: ws_conn_id.to_string(),
                        consumer_id: consumer_id.to_string(),
                        producer_id: Some(producer_id.to_string()),
                    },
                },
            )
            .await?;
        self.invalidate(session_id);
        self.get_session(session_id).await?;
        Ok(())
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<(), BrokerError> {
        self.client.pause_session(session_id).await?;
        self.invalidate(session_id);
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), BrokerError> {
        self.client.close_session(session_id).await?;
        self.invalidate(session_id);
        Ok(())
    }

    /// Cache-first read. `None` means upstream has no such session.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, BrokerError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = cache.get(session_id) {
                return Ok(Some(session.clone()));
            }
        }
        let res = match self.client.get_session(session_id).await {
            Ok(res) => res,
            Err(BrokerError::SessionNotFound(_)) => {
                tracing::warn!(session_id = %session_id, "session wasn't found upstream");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let mut session = res.session;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        // a concurrent caller may have repopulated the entry while we were
        // fetching; its ending mark must survive the replace
        if let Some(old) = cache.get(session_id) {
            session.ending = old.ending;
        }
        cache.insert(session_id.to_string(), session.clone());
        Ok(Some(session))
    }

    pub async fn get_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, BrokerError> {
        Ok(self.client.get_user_sessions(user_id).await?.sessions)
    }

    pub async fn get_consumer_sessions(
        &self,
        consumer_id: &str,
    ) -> Result<Vec<Session>, BrokerError> {
        Ok(self
            .client
            .get_consumer_sessions(consumer_id)
            .await?
            .sessions)
    }

    pub async fn get_producer_sessions(
        &self,
        producer_id: &str,
    ) -> Result<Vec<Session>, BrokerError> {
        Ok(self
            .client
            .get_producer_sessions(producer_id)
            .await?
            .sessions)
    }

    pub async fn submit_webrtc_stats(
        &self,
        session_id: &str,
        stats: String,
    ) -> Result<(), BrokerError> {
        self.client
            .submit_webrtc_stats(session_id, &SubmitStatsRequest { stats })
            .await
    }
}
