//! Per-connection signaling dispatcher and request handlers.
//!
//! One task drives each accepted WebSocket: it registers the peer, greets it
//! with `welcome`, then processes frames strictly in arrival order. A second
//! task drains the peer's outbound channel into the socket so handlers can
//! write to any live peer. When the read loop exits, the disconnect
//! procedure runs exactly once.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use switchboard_protocol::{BrokerError, ClientRequest, ProducerEntry, Response};
use tokio::sync::mpsc;

use crate::peer::{Peer, PeerRole};
use crate::web::AppState;

/// Credentials and routing data pulled from the handshake before upgrade.
pub struct Handshake {
    pub ws_conn_id: String,
    pub user_id: Option<i64>,
    pub remote_addr: Option<String>,
}

fn send_response(peer: &Peer, resp: &Response) {
    match serde_json::to_string(resp) {
        Ok(json) => peer.send(json),
        Err(e) => tracing::error!("failed to encode response frame: {e}"),
    }
}

fn send_request(peer: &Peer, req: &ClientRequest) {
    match serde_json::to_string(req) {
        Ok(json) => peer.send(json),
        Err(e) => tracing::error!("failed to encode relay frame: {e}"),
    }
}

/// Drive one accepted WebSocket until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, handshake: Handshake) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let peer = Peer::new(handshake.ws_conn_id, handshake.user_id, tx);

    tracing::info!(
        peer_id = %peer.id,
        remote_addr = handshake.remote_addr.as_deref().unwrap_or("-"),
        "peer connected"
    );

    state.registry.insert(Arc::clone(&peer));

    let send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    send_response(
        &peer,
        &Response::Welcome {
            peer_id: peer.id.clone(),
        },
    );

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                tracing::debug!(peer_id = %peer.id, role = ?peer.role(), "<<< {text}");
                if let Err(e) = dispatch(&state, &peer, text.as_str()).await {
                    tracing::error!(peer_id = %peer.id, "request failed: {e}");
                    send_response(&peer, &Response::from(&e));
                }
            }
            Ok(Message::Close(_)) => break,
            // pings are answered by the protocol layer; binary frames have
            // no meaning in this protocol
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(peer_id = %peer.id, "connection error: {e}");
                break;
            }
        }
    }

    handle_disconnect(&state, &peer).await;
    send_task.abort();
    tracing::info!(peer_id = %peer.id, "peer disconnected");
}

/// Route one inbound frame. A returned error becomes an `error` frame to the
/// sender and the connection stays up.
async fn dispatch(state: &AppState, peer: &Arc<Peer>, text: &str) -> Result<(), BrokerError> {
    let req: ClientRequest = serde_json::from_str(text)
        .map_err(|e| BrokerError::validation(format!("invalid request: {e}")))?;
    match req {
        ClientRequest::SetPeerStatus { meta, roles, .. } => {
            handle_set_peer_status(state, peer, meta, roles)
        }
        ClientRequest::List => handle_list(state, peer),
        ClientRequest::CreateSession {
            app_release_uuid,
            preferred_dcs,
        } => handle_create_session(state, peer, app_release_uuid, preferred_dcs).await,
        ClientRequest::StartSession { peer_id, session_id } => {
            handle_start_session(state, peer, &session_id, &peer_id).await
        }
        ClientRequest::SessionStarted { .. } => Err(BrokerError::validation(
            "unsupported request type: sessionStarted",
        )),
        ClientRequest::Peer { session_id } => {
            handle_peer_frame(state, peer, &session_id, text).await
        }
        ClientRequest::EndSession { session_id, soft } => {
            handle_end_session(state, peer, &session_id, soft).await
        }
        ClientRequest::GetSessions => handle_get_sessions(state, peer).await,
        ClientRequest::GetSession { session_id } => {
            handle_get_session(state, peer, &session_id).await
        }
        ClientRequest::SubmitWebRtcStats { session_id, stats } => {
            state.sessions.submit_webrtc_stats(&session_id, stats).await
        }
    }
}

fn handle_set_peer_status(
    state: &AppState,
    peer: &Arc<Peer>,
    meta: Map<String, Value>,
    roles: Vec<String>,
) -> Result<(), BrokerError> {
    let new_role = if roles.iter().any(|r| r == "listener") {
        PeerRole::Consumer
    } else if roles.iter().any(|r| r == "producer") {
        PeerRole::Producer
    } else {
        return Err(BrokerError::validation(format!(
            "unknown peer role: {roles:?}"
        )));
    };
    // the role is assigned once; repeating it only refreshes the metadata
    if let Some(current) = peer.role()
        && current != new_role
    {
        return Err(BrokerError::validation("peer role cannot change"));
    }

    peer.set_meta(meta.clone());
    peer.set_role(new_role);

    let response = Response::PeerStatusChanged {
        roles,
        meta: meta.clone(),
        peer_id: peer.id.clone(),
    };

    if new_role == PeerRole::Producer {
        // the producer has a stream ready for this consumer; a consumer that
        // is not connected yet learns about us from a later `list` call
        if let Some(consumer_id) = meta.get("consumerId").and_then(Value::as_str) {
            state.registry.announce_producer(consumer_id, &peer.id);
            if let Some(consumer) = state.registry.get(consumer_id) {
                send_response(&consumer, &response);
            }
        }
    }

    send_response(peer, &response);
    Ok(())
}

fn handle_list(state: &AppState, peer: &Arc<Peer>) -> Result<(), BrokerError> {
    let producers = match state.registry.producer_for_consumer(&peer.id) {
        Some(producer) => vec![ProducerEntry {
            id: producer.id.clone(),
            meta: producer.meta(),
        }],
        None => Vec::new(),
    };
    send_response(peer, &Response::List { producers });
    Ok(())
}

async fn handle_create_session(
    state: &AppState,
    peer: &Arc<Peer>,
    app_release_uuid: String,
    preferred_dcs: Option<Vec<String>>,
) -> Result<(), BrokerError> {
    let res = state
        .sessions
        .create_session(peer, app_release_uuid, preferred_dcs)
        .await?;
    send_response(
        peer,
        &Response::SessionCreated {
            session_id: res.session_id,
        },
    );
    Ok(())
}

/// Attach a producer to a created session and notify both sides.
async fn handle_start_session(
    state: &AppState,
    consumer: &Arc<Peer>,
    session_id: &str,
    producer_id: &str,
) -> Result<(), BrokerError> {
    tracing::debug!(
        session_id = %session_id,
        producer_id = %producer_id,
        consumer_id = %consumer.id,
        "starting session"
    );
    if consumer.role() != Some(PeerRole::Consumer) {
        return Err(BrokerError::operational("only consumers can start sessions"));
    }
    let producer = state.registry.get(producer_id).ok_or_else(|| {
        BrokerError::unknown_peer(format!("producer peer (id: {producer_id}) is unknown"))
    })?;
    state
        .sessions
        .start_session(session_id, &consumer.ws_conn_id, &producer.id, &consumer.id)
        .await?;
    send_request(
        &producer,
        &ClientRequest::StartSession {
            peer_id: consumer.id.clone(),
            session_id: session_id.to_string(),
        },
    );
    send_request(
        consumer,
        &ClientRequest::SessionStarted {
            peer_id: producer.id.clone(),
            session_id: session_id.to_string(),
        },
    );
    Ok(())
}

/// Relay an opaque negotiation frame to the session counterpart, verbatim.
async fn handle_peer_frame(
    state: &AppState,
    peer: &Arc<Peer>,
    session_id: &str,
    raw: &str,
) -> Result<(), BrokerError> {
    let session = match state.sessions.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::warn!(session_id = %session_id, "dropping frame for unknown session");
            return Ok(());
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, "dropping frame, session lookup failed: {e}");
            return Ok(());
        }
    };
    if let Some(other_id) = session.other_peer_id(&peer.id)?
        && let Some(other) = state.registry.get(other_id)
    {
        other.send(raw.to_string());
    }
    Ok(())
}

/// Tear down one session from either seat.
///
/// Reached directly from an `endSession` request, or indirectly from the
/// disconnect procedure; in the indirect case the sender is already gone
/// from the registry and no ack is owed. The `ending` mark plus counterpart
/// eviction guarantee at most one upstream pause/close per teardown.
async fn handle_end_session(
    state: &AppState,
    peer: &Arc<Peer>,
    session_id: &str,
    soft: bool,
) -> Result<(), BrokerError> {
    let direct = state.registry.contains(&peer.id);
    tracing::debug!(
        peer_id = %peer.id,
        session_id = %session_id,
        direct,
        soft,
        "ending session"
    );

    let session = match state.sessions.get_session(session_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(session_id = %session_id, "session lookup failed during teardown: {e}");
            return Ok(());
        }
    };
    let Some(session) = session else {
        // nothing to do upstream; only direct consumers understand the ack
        if direct && peer.role() == Some(PeerRole::Consumer) {
            send_response(
                peer,
                &Response::SessionEnded {
                    session_id: session_id.to_string(),
                },
            );
        }
        return Ok(());
    };
    if !state.sessions.try_mark_ending(&session.id) {
        // the other peer is already tearing this session down
        if direct && peer.role() == Some(PeerRole::Consumer) {
            send_response(
                peer,
                &Response::SessionEnded {
                    session_id: session.id.clone(),
                },
            );
        }
        return Ok(());
    }

    match session.other_peer_id(&peer.id) {
        Ok(Some(other_id)) => {
            if let Some(other) = state.registry.get(other_id) {
                send_request(
                    &other,
                    &ClientRequest::EndSession {
                        session_id: session.id.clone(),
                        soft,
                    },
                );
                // evict the counterpart so its own disconnect becomes a no-op
                state.registry.remove(other_id);
            }
        }
        Ok(None) => {}
        // a peer outside the session may still reap it (orphaned session);
        // skip the notification and fall through to the upstream call
        Err(e) => tracing::warn!(session_id = %session.id, "{e}"),
    }

    if soft {
        tracing::debug!(session_id = %session.id, "pausing session");
        state.sessions.pause_session(&session.id).await?;
    } else {
        tracing::debug!(session_id = %session.id, "closing session");
        state.sessions.close_session(&session.id).await?;
    }

    if direct && peer.role() == Some(PeerRole::Consumer) {
        send_response(
            peer,
            &Response::SessionEnded {
                session_id: session.id.clone(),
            },
        );
    }
    Ok(())
}

async fn handle_get_sessions(state: &AppState, peer: &Arc<Peer>) -> Result<(), BrokerError> {
    let sessions = match peer.role() {
        Some(PeerRole::Consumer) => {
            let user_id = peer
                .user_id
                .ok_or_else(|| BrokerError::operational("user_id is undefined"))?;
            state.sessions.get_user_sessions(user_id).await?
        }
        Some(PeerRole::Producer) => state.sessions.get_producer_sessions(&peer.id).await?,
        None => return Err(BrokerError::validation("unknown peer role")),
    };
    send_response(peer, &Response::SessionsList { sessions });
    Ok(())
}

async fn handle_get_session(
    state: &AppState,
    peer: &Arc<Peer>,
    session_id: &str,
) -> Result<(), BrokerError> {
    match state.sessions.get_session(session_id).await? {
        Some(session) => send_response(peer, &Response::Session { session }),
        None => peer.send("{}".to_string()),
    }
    Ok(())
}

/// Runs once when a connection goes away.
///
/// A peer already displaced by a terminating session lands here too (e.g. a
/// resumed container closing its stale connection); that case is a no-op.
/// Sessions left behind by a consumer are paused so the container can be
/// reused; sessions left behind by a producer are closed for good.
async fn handle_disconnect(state: &AppState, peer: &Arc<Peer>) {
    tracing::debug!(peer_id = %peer.id, role = ?peer.role(), "connection closed");
    if state.registry.remove(&peer.id).is_none() {
        tracing::debug!(peer_id = %peer.id, "already displaced, nothing to clean up");
        return;
    }
    let role = peer.role();
    let sessions = match role {
        Some(PeerRole::Consumer) => state.sessions.get_consumer_sessions(&peer.id).await,
        Some(PeerRole::Producer) => state.sessions.get_producer_sessions(&peer.id).await,
        None => return,
    };
    let sessions = match sessions {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::error!(peer_id = %peer.id, "failed to list sessions on disconnect: {e}");
            return;
        }
    };
    let soft = role == Some(PeerRole::Consumer);
    for session in sessions {
        if let Err(e) = handle_end_session(state, peer, &session.id, soft).await {
            tracing::error!(session_id = %session.id, "teardown on disconnect failed: {e}");
        }
    }
}
