use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::broadcast::Channel;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenParam {
    pub token: Option<String>,
}

/// `GET /api/ws/{channel}` — stream broadcast messages for one channel.
///
/// Clients authenticate with a bearer token query parameter and keep the
/// connection alive with `__ping__`/`__pong__`.
pub async fn channel_ws(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(params): Query<TokenParam>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(channel) = Channel::parse(&channel) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let token = params.token.unwrap_or_default();
    if !(state.ws_auth)(&token) {
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| serve_channel(state, channel, socket))
}

async fn serve_channel(state: AppState, channel: Channel, socket: WebSocket) {
    let mut subscription = match state.engine.broadcaster().subscribe(channel).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(channel = %channel.as_str(), error = %e, "Websocket subscribe failed");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // The settings channel starts with the current status so clients do
    // not have to wait for the next transition.
    if channel == Channel::EngineSettings {
        if let Ok(status) = state.engine.settings().status().await {
            let payload = json!({"engine-status": status}).to_string();
            if sink.send(Message::Text(payload.into())).await.is_err() {
                return;
            }
        }
    }

    tracing::debug!(channel = %channel.as_str(), "Websocket client connected");

    loop {
        tokio::select! {
            message = subscription.recv() => {
                match message {
                    Some(message) => {
                        if sink.send(Message::Text(message.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text.as_str() == "__ping__" => {
                        if sink.send(Message::Text("__pong__".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    tracing::debug!(channel = %channel.as_str(), "Websocket client disconnected");
}
