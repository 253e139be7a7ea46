//! WebSocket bridge: one socket per hub connection

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use ehub_core::{EhubError, LocationId};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AppState;
use crate::error::{Error, Result};
use crate::pubsub::{PubSubHub, Role, ServerReply, SubscriberTransport};

/// Frames buffered per socket before sends start to wait
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub location_id: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Comma separated channel names
    #[serde(default)]
    pub channels: Option<String>,
    #[serde(default)]
    pub components: Option<String>,
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Outbound half of a socket, fed through a bounded queue drained by a
/// writer task.
struct WsTransport {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl SubscriberTransport for WsTransport {
    async fn send(&self, text: &str) -> ehub_core::Result<()> {
        self.tx
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|_| EhubError::Network("websocket closed".into()))
    }

    async fn close(&self) {
        let _ = self.tx.try_send(Message::Close(None));
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> Result<impl IntoResponse> {
    if params.location_id.trim().is_empty() {
        return Err(Error::InvalidRequest("location_id is required".into()));
    }
    let role = match params.role.as_deref() {
        Some(raw) => raw.parse::<Role>().map_err(Error::InvalidRequest)?,
        None => Role::default(),
    };
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, params, role)))
}

async fn handle_socket(socket: WebSocket, hub: PubSubHub, params: ConnectParams, role: Role) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let connection_id = hub.connect(
        Arc::new(WsTransport { tx: tx.clone() }),
        LocationId::new(params.location_id.trim()),
        role,
        &split_list(params.channels.as_deref()),
        &split_list(params.components.as_deref()),
    );

    let channels = hub
        .connection(&connection_id)
        .map(|c| c.channels)
        .unwrap_or_default();
    let welcome = ServerReply::Connected {
        connection_id: connection_id.clone(),
        channels,
    };
    if send_reply(&tx, &welcome).await {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let reply = hub.handle_client_frame(&connection_id, text.as_str());
                    if !send_reply(&tx, &reply).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_) | Message::Pong(_)) => hub.touch(&connection_id),
                Ok(_) => {}
                Err(e) => {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                    break;
                }
            }
        }
    }

    hub.disconnect(&connection_id).await;
    drop(tx);
    if let Err(e) = writer.await {
        warn!(connection_id = %connection_id, error = %e, "WebSocket writer task failed");
    }
}

async fn send_reply(tx: &mpsc::Sender<Message>, reply: &ServerReply) -> bool {
    match serde_json::to_string(reply) {
        Ok(json) => tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize reply");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(Some("dashboard, leads,,")), vec!["dashboard", "leads"]);
        assert!(split_list(None).is_empty());
    }
}
