//! Per-connection relay logic.
//!
//! [`serve_connection`] runs for the lifetime of one client regardless of
//! transport: the axum WebSocket handler and the in-process link both feed
//! it parsed messages.

use crate::relay::state::RelayState;
use crate::signaling::SignalMessage;
use crate::utils::random_id;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// Handles one WebSocket connection until it closes.
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let conn_id = random_id();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalMessage>();

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize relay message"),
            }
        }
    });

    let reader_task = tokio::spawn({
        let conn_id = conn_id.clone();
        let out_tx = out_tx.clone();
        async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(conn_id = conn_id.as_str(), error = %e, "Failed to parse client message");
                            let _ = out_tx.send(SignalMessage::error(
                                None,
                                format!("Invalid message format: {e}"),
                            ));
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::debug!(conn_id = conn_id.as_str(), "Client sent close frame");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = conn_id.as_str(), error = %e, "WebSocket error");
                        break;
                    }
                    _ => {} // Binary, Ping, Pong
                }
            }
        }
    });

    serve_connection(state, conn_id, out_tx, in_rx).await;
    reader_task.abort();
    sender_task.abort();
}

/// Registers the client, processes its messages until `inbound` closes, then
/// removes it from every room and tells the remaining members.
pub async fn serve_connection(
    state: RelayState,
    conn_id: String,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
) {
    state.register_client(&conn_id, outbound);

    while let Some(msg) = inbound.recv().await {
        handle_client_message(&state, &conn_id, msg);
    }

    for departure in state.remove_from_all_rooms(&conn_id) {
        for peer in &departure.remaining {
            state.send_to_client(
                peer,
                SignalMessage::PeerLeft {
                    room_id: departure.room_id.clone(),
                    user_id: departure.user_id.clone(),
                },
            );
        }
    }
    state.unregister_client(&conn_id);
    tracing::debug!(conn_id = conn_id.as_str(), "Client disconnected");
}

pub fn handle_client_message(state: &RelayState, conn_id: &str, msg: SignalMessage) {
    match msg {
        SignalMessage::JoinCallRoom { room_id, user_id } => {
            handle_join(state, conn_id, &room_id, &user_id);
        }

        SignalMessage::LeaveCallRoom { room_id } => {
            if let Some(departure) = state.leave_room(&room_id, conn_id) {
                for peer in &departure.remaining {
                    state.send_to_client(
                        peer,
                        SignalMessage::PeerLeft {
                            room_id: room_id.clone(),
                            user_id: departure.user_id.clone(),
                        },
                    );
                }
            }
        }

        msg if msg.is_relayed() => forward(state, conn_id, msg),

        other => {
            tracing::warn!(conn_id, event = other.event_name(), "Client sent relay-only event");
            state.send_to_client(
                conn_id,
                SignalMessage::error(
                    other.room_id(),
                    format!("unexpected event {}", other.event_name()),
                ),
            );
        }
    }
}

fn handle_join(state: &RelayState, conn_id: &str, room_id: &str, user_id: &str) {
    if user_id.is_empty() {
        state.send_to_client(conn_id, SignalMessage::error(Some(room_id), "userId is required"));
        return;
    }

    match state.join_room(room_id, conn_id, user_id) {
        Ok(existing) => {
            state.send_to_client(
                conn_id,
                SignalMessage::RoomMembers {
                    room_id: room_id.to_string(),
                    members: existing,
                },
            );
            for peer in state.room_peers(room_id, conn_id) {
                state.send_to_client(
                    &peer,
                    SignalMessage::PeerJoined {
                        room_id: room_id.to_string(),
                        user_id: user_id.to_string(),
                    },
                );
            }
        }
        Err(e) => {
            state.send_to_client(conn_id, SignalMessage::error(Some(room_id), e.message()));
        }
    }
}

/// Offer/answer/candidate: verbatim to every other member of the room.
fn forward(state: &RelayState, conn_id: &str, msg: SignalMessage) {
    let Some(room_id) = msg.room_id().map(str::to_string) else {
        return;
    };
    if !state.is_member(&room_id, conn_id) {
        state.send_to_client(
            conn_id,
            SignalMessage::error(Some(&room_id), "join the room before signaling"),
        );
        return;
    }

    let peers = state.room_peers(&room_id, conn_id);
    tracing::debug!(
        conn_id,
        room_id = room_id.as_str(),
        event = msg.event_name(),
        recipients = peers.len(),
        "Forwarding signal"
    );
    for peer in peers {
        state.send_to_client(&peer, msg.clone());
    }
}

impl RelayState {
    /// In-process client link running the same logic as a WebSocket
    /// connection. Returns the client's outbound sender and inbound receiver,
    /// ready for `SignalingChannel::from_parts`.
    pub fn connect_local(
        &self,
    ) -> (
        mpsc::UnboundedSender<SignalMessage>,
        mpsc::UnboundedReceiver<SignalMessage>,
    ) {
        let (client_tx, relay_rx) = mpsc::unbounded_channel();
        let (relay_tx, client_rx) = mpsc::unbounded_channel();
        let state = self.clone();
        tokio::spawn(serve_connection(state, random_id(), relay_tx, relay_rx));
        (client_tx, client_rx)
    }
}
