//! HTTP surface: the WebSocket handshake and a health probe.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::auth::{self, AuthGate};
use crate::peer::Registry;
use crate::sessions::SessionsManager;
use crate::signaling::{self, Handshake};

/// Shared application state.
pub struct AppState {
    pub auth: AuthGate,
    pub registry: Registry,
    pub sessions: SessionsManager,
}

/// Build the axum router. Clients may be routed here under arbitrary path
/// prefixes by the ingress, so the upgrade handler doubles as the fallback.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/", get(ws_upgrade))
        .fallback(get(ws_upgrade))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Authenticate one handshake and upgrade it. Rejections replace the
/// upgrade with the plain HTTP response the auth gate dictates.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    if let Err(rejection) = state.auth.authenticate(&headers) {
        return (rejection.status, rejection.body).into_response();
    }

    let ws_conn_id = match auth::ws_conn_id(&headers) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("rejecting handshake: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let user_id = state.auth.extract_user_id(&headers);
    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let handshake = Handshake {
        ws_conn_id,
        user_id,
        remote_addr,
    };
    ws.on_upgrade(move |socket| signaling::handle_socket(socket, state, handshake))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, UidSource};
    use crate::sessionsvc::SessionSvcClient;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TOKEN: &str = "producer-token-abcd";

    fn test_state() -> Arc<AppState> {
        let config = Config {
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 0,
            sessionsvc_url: "http://127.0.0.1:1".to_string(),
            secret_key: Some("test-secret".to_string()),
            session_lifetime_secs: 60,
            auth_token: Some(TOKEN.to_string()),
            debug_no_auth: false,
            uid_source: UidSource::Header,
        };
        let client = SessionSvcClient::new(config.sessionsvc_url.clone()).unwrap();
        Arc::new(AppState {
            auth: AuthGate::new(&config),
            registry: Registry::default(),
            sessions: SessionsManager::new(client),
        })
    }

    /// A syntactically valid WebSocket handshake for the given path.
    fn upgrade_request(path: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(path)
            .header("host", "broker.test")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "x3JJHMbDL1EzLkh9GBhXDw==");
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_string(response: axum::response::Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("ok"));
    }

    #[tokio::test]
    async fn handshake_without_credentials_is_rejected() {
        let app = build_router(test_state());
        let response = app.oneshot(upgrade_request("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Missing auth token\n");
    }

    #[tokio::test]
    async fn handshake_with_bad_token_is_rejected() {
        let app = build_router(test_state());
        let response = app
            .oneshot(upgrade_request(
                "/",
                Some("sigsvc_wsconnid=abc; sigsvc_authtoken=wrong"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Invalid auth token\n");
    }

    #[tokio::test]
    async fn handshake_without_conn_id_cookie_is_rejected() {
        let app = build_router(test_state());
        let response = app
            .oneshot(upgrade_request(
                "/",
                Some(&format!("sigsvc_authtoken={TOKEN}")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("sigsvc_wsconnid"));
    }

    #[tokio::test]
    async fn valid_handshake_upgrades() {
        let app = build_router(test_state());
        let response = app
            .oneshot(upgrade_request(
                "/",
                Some(&format!("sigsvc_wsconnid=abc; sigsvc_authtoken={TOKEN}")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn upgrade_works_under_any_path() {
        let app = build_router(test_state());
        let response = app
            .oneshot(upgrade_request(
                "/signaling/v1",
                Some(&format!("sigsvc_wsconnid=abc; sigsvc_authtoken={TOKEN}")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
}
