//! Typed HTTP facade over the upstream session service.

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use switchboard_protocol::{
    BrokerError, CreateSessionRequest, CreateSessionResponse, GetSessionResponse,
    GetSessionsResponse, StartSessionRequest, SubmitStatsRequest,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Session creation waits for a container to boot.
const CREATE_READ_TIMEOUT: Duration = Duration::from_secs(55);

pub struct SessionSvcClient {
    base_url: String,
    http: reqwest::Client,
    /// Transport-level retries per call. Shipped at 0 (single shot); the
    /// knob stays wired for future tuning.
    max_retries: u32,
}

impl SessionSvcClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
            max_retries: 0,
        })
    }

    pub async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, BrokerError> {
        let body = self
            .request(|| {
                self.http
                    .post(self.url("/sessions/create"))
                    .timeout(CREATE_READ_TIMEOUT)
                    .json(req)
            })
            .await?;
        decode(body)
    }

    pub async fn start_session(
        &self,
        session_id: &str,
        req: &StartSessionRequest,
    ) -> Result<(), BrokerError> {
        self.request(|| {
            self.http
                .post(self.url(&format!("/sessions/{session_id}/start")))
                .json(req)
        })
        .await?;
        Ok(())
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<(), BrokerError> {
        self.request(|| self.http.post(self.url(&format!("/sessions/{session_id}/pause"))))
            .await?;
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), BrokerError> {
        self.request(|| self.http.post(self.url(&format!("/sessions/{session_id}/close"))))
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<GetSessionResponse, BrokerError> {
        let body = self
            .request(|| self.http.get(self.url(&format!("/sessions/{session_id}"))))
            .await?;
        decode(body)
    }

    pub async fn get_user_sessions(&self, user_id: i64) -> Result<GetSessionsResponse, BrokerError> {
        let body = self
            .request(|| self.http.get(self.url(&format!("/users/{user_id}/sessions"))))
            .await?;
        decode(body)
    }

    pub async fn get_consumer_sessions(
        &self,
        consumer_id: &str,
    ) -> Result<GetSessionsResponse, BrokerError> {
        let body = self
            .request(|| {
                self.http
                    .get(self.url(&format!("/consumers/{consumer_id}/sessions")))
            })
            .await?;
        decode(body)
    }

    pub async fn get_producer_sessions(
        &self,
        producer_id: &str,
    ) -> Result<GetSessionsResponse, BrokerError> {
        let body = self
            .request(|| {
                self.http
                    .get(self.url(&format!("/producers/{producer_id}/sessions")))
            })
            .await?;
        decode(body)
    }

    pub async fn submit_webrtc_stats(
        &self,
        session_id: &str,
        req: &SubmitStatsRequest,
    ) -> Result<(), BrokerError> {
        self.request(|| {
            self.http
                .post(self.url(&format!("/sessions/{session_id}/stats")))
                .json(req)
        })
        .await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue the request and map the response per the service contract:
    /// 200 yields the JSON body, 409 with nested `code == 1404` means the
    /// session is gone, a nested `code == 1429` is the quota signal, and
    /// everything else (including transport failures and timeouts) surfaces
    /// the upstream payload verbatim.
    async fn request(&self, build: impl Fn() -> RequestBuilder) -> Result<Value, BrokerError> {
        let mut attempt = 0;
        let response = loop {
            match build().send().await {
                Ok(res) => break res,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!("session service request failed (attempt {attempt}): {e}");
                }
                Err(e) => {
                    return Err(BrokerError::session_svc(format!(
                        "session service unreachable: {e}"
                    )));
                }
            }
        };

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            BrokerError::session_svc(format!("failed reading session service response: {e}"))
        })?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status == StatusCode::OK {
            return Ok(body);
        }
        let code = body.get("code").and_then(Value::as_i64);
        if status == StatusCode::CONFLICT && code == Some(1404) {
            return Err(BrokerError::session_not_found("sessionsvc: session not found"));
        }
        if code == Some(1429) {
            return Err(BrokerError::QuotaExceeded);
        }
        Err(BrokerError::session_svc(if body.is_null() {
            format!("session service returned {status}")
        } else {
            body.to_string()
        }))
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, BrokerError> {
    serde_json::from_value(body)
        .map_err(|e| BrokerError::session_svc(format!("undecodable session service response: {e}")))
}
