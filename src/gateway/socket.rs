//! WebSocket session handler
//!
//! Handshake verification happens before upgrade; after that the
//! session is a read loop with an idle timeout plus a writer task
//! draining the registry's outbound channel. Any exit path, normal or
//! abnormal, runs the same disconnect cleanup.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::AppContext;
use crate::error::AuctionError;
use crate::gateway::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// `GET /ws?token=...` — bearer token as a connection parameter.
pub async fn ws_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AuctionError> {
    let token = params
        .token
        .ok_or_else(|| AuctionError::Unauthorized("Missing authentication token".into()))?;
    let user = ctx.verifier.verify(&token)?;

    // Mirror claims into the durable users table so bid and settlement
    // paths can reference the caller. Best effort on this path.
    if let Err(err) = ctx.directory.sync(&user).await {
        warn!(user_id = %user.user_id, error = %err, "user sync failed on connect");
    }

    Ok(ws.on_upgrade(move |socket| serve_session(ctx, user, socket)))
}

async fn serve_session(ctx: AppContext, user: crate::auth::VerifiedUser, socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = match ctx.gateway.register_session(&user, tx).await {
        Ok(session) => session,
        Err(err) => {
            warn!(user_id = %user.user_id, error = %err, "session registration failed");
            return;
        }
    };
    let session_id = session.session_id;

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = Duration::from_secs(ctx.gateway.settings().timeout_seconds);
    loop {
        let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                debug!(%session_id, "session idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => dispatch(&ctx, session_id, &text).await,
            Message::Close(_) => break,
            // Transport-level ping/pong and binary frames are ignored;
            // liveness rides the application-level ping.
            _ => {}
        }
    }

    ctx.gateway.disconnect(session_id).await;
    writer.abort();
}

async fn dispatch(ctx: &AppContext, session_id: Uuid, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(%session_id, error = %err, "malformed client frame");
            ctx.gateway.send_error(session_id, "Malformed frame");
            return;
        }
    };
    let result = match event {
        ClientEvent::JoinAuction { auction_id } => {
            ctx.gateway.join_auction(session_id, auction_id).await
        }
        ClientEvent::LeaveAuction { auction_id } => {
            ctx.gateway.leave_auction(session_id, auction_id).await
        }
        ClientEvent::ChatMessage {
            auction_id,
            message,
        } => ctx.gateway.chat(session_id, auction_id, &message).await,
        ClientEvent::Ping => {
            ctx.gateway.pong(session_id);
            Ok(())
        }
    };
    // Typed error frame, never a dropped session.
    if let Err(err) = result {
        ctx.gateway.send_error(session_id, &err.public_message());
    }
}
