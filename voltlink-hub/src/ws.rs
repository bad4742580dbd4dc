//! WebSocket viewer endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::hub::{Hub, VIEWER_QUEUE};

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, hub))
}

/// Serve one viewer until either side goes away.
pub async fn serve_viewer(socket: WebSocket, hub: Arc<Hub>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(VIEWER_QUEUE);

    let Some(viewer) = hub.on_connect(tx) else {
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    // Writer: drains the outbound queue in order. The queue ends when the
    // hub drops this viewer.
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let reader_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    reader_hub.on_viewer_message(viewer, text.as_str()).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => {
                    debug!(viewer = %viewer, "Ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(viewer = %viewer, error = %e, "Viewer socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.on_disconnect(viewer);
}
