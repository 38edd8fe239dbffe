//! Relay transport.
//!
//! The client only needs a pair of text channels to the relay. [`WsConnector`]
//! provides them over a WebSocket; tests swap in in-memory channels.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 128;

/// Text frames to and from the relay. The connection is gone once `incoming`
/// yields `None`; dropping `outgoing` closes it from our side.
pub struct Transport {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl Transport {
    /// Two connected ends, each seeing the other's writes.
    pub fn pair(capacity: usize) -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Transport {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Transport {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>> {
        let url = url.to_string();
        async move {
            let (ws, _) = connect_async(url.as_str()).await?;
            debug!("websocket connected to {}", url);
            let (mut sink, mut stream) = ws.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("websocket send failed: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if in_tx.send(text.as_str().to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("websocket error: {}", e);
                            break;
                        }
                    }
                }
            });

            Ok(Transport {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
        .boxed()
    }
}
