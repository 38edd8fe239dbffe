use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use freespeak_common::ServerFrame;

use crate::registry::Outbox;
use crate::router::Connection;
use crate::RelayState;

/// Transport-level cap. Frames between this and the configured protocol
/// limit still reach the router, which answers them with an `error` frame.
const WS_MAX_MESSAGE_BYTES: usize = 64 * 1024;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_MESSAGE_BYTES)
        .max_frame_size(WS_MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(stream: WebSocket, state: RelayState, addr: SocketAddr) {
    info!("client connecting from {}", addr);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbox_capacity);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let outbox = Outbox::new(tx);
    let mut connection = Connection::new(state.registry.clone(), state.config.clone(), outbox.clone());

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("dropping socket from {}: {}", addr, e);
                        let _ = outbox
                            .send(&ServerFrame::error(format!("Closing connection: {e}")))
                            .await;
                        break;
                    }
                };

                match msg {
                    Message::Text(text) => connection.handle_text(&text).await,
                    Message::Binary(_) => {
                        let _ = outbox
                            .send(&ServerFrame::error("Binary messages are not supported"))
                            .await;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                }
            }
        }
    }

    debug!("socket from {} closed", addr);
    connection.close().await;
}
