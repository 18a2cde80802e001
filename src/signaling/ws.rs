use crate::error::CallError;
use crate::signaling::channel::SignalingChannel;
use crate::signaling::message::SignalMessage;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

impl SignalingChannel {
    /// Connects to a relay WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub async fn connect(url: &str) -> Result<Self, CallError> {
        let (stream, _response) = connect_async(url).await?;
        tracing::info!(url, "Connected to signaling relay");
        let (mut ws_sender, mut ws_receiver) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to serialize signal"),
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Dropping malformed signal"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {} // ping/pong answered by tungstenite, binary unused
                    Err(e) => {
                        tracing::warn!(error = %e, "Signaling socket error");
                        break;
                    }
                }
            }
            // dropping in_tx tells the dispatcher the transport is gone
        });

        Ok(Self::with_tasks(out_tx, in_rx, vec![writer, reader]))
    }
}
