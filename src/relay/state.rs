//! Relay state: connected clients and call rooms.
//!
//! Both maps are DashMaps so connection tasks can touch them without a
//! global lock.

use crate::signaling::SignalMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One exchange call has two participants.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 2;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub max_participants: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomMember {
    pub conn_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CallRoom {
    pub room_id: String,
    pub members: Vec<RoomMember>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    RoomFull,
}

impl JoinError {
    pub fn message(&self) -> &'static str {
        match self {
            JoinError::RoomFull => "room full",
        }
    }
}

/// Who left a room and which connections are still in it.
#[derive(Debug, Clone)]
pub struct Departure {
    pub room_id: String,
    pub user_id: String,
    pub remaining: Vec<String>,
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<SignalMessage>;

#[derive(Clone)]
pub struct RelayState {
    /// Connection id → outbound channel.
    pub clients: Arc<DashMap<String, ClientSender>>,
    /// Room id → call room.
    pub rooms: Arc<DashMap<String, CallRoom>>,
    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            rooms: Arc::new(DashMap::new()),
            config,
        }
    }

    // ── Client Management ─────────────────────────────────────────────────

    pub fn register_client(&self, conn_id: &str, sender: ClientSender) {
        tracing::debug!(conn_id, "Client registered");
        self.clients.insert(conn_id.to_string(), sender);
    }

    pub fn unregister_client(&self, conn_id: &str) {
        tracing::debug!(conn_id, "Client unregistered");
        self.clients.remove(conn_id);
    }

    /// Returns true if the message was queued for the client.
    pub fn send_to_client(&self, conn_id: &str, message: SignalMessage) -> bool {
        if let Some(sender) = self.clients.get(conn_id) {
            sender.send(message).is_ok()
        } else {
            false
        }
    }

    pub fn online_count(&self) -> usize {
        self.clients.len()
    }

    // ── Room Management ───────────────────────────────────────────────────

    /// Adds the connection to the room, creating the room on first join.
    /// Returns the user ids of the members already there.
    pub fn join_room(
        &self,
        room_id: &str,
        conn_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, JoinError> {
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| CallRoom {
                room_id: room_id.to_string(),
                members: Vec::new(),
                created_at: Utc::now(),
            });

        let others: Vec<String> = room
            .members
            .iter()
            .filter(|m| m.conn_id != conn_id)
            .map(|m| m.user_id.clone())
            .collect();

        if room.members.iter().any(|m| m.conn_id == conn_id) {
            return Ok(others);
        }

        if room.members.len() >= self.config.max_participants {
            tracing::warn!(room_id, user_id, "Call room full");
            return Err(JoinError::RoomFull);
        }

        room.members.push(RoomMember {
            conn_id: conn_id.to_string(),
            user_id: user_id.to_string(),
            joined_at: Utc::now(),
        });

        tracing::info!(
            room_id,
            user_id,
            participant_count = room.members.len(),
            "Participant joined call room"
        );
        Ok(others)
    }

    /// Removes the connection from the room; empty rooms are dropped.
    pub fn leave_room(&self, room_id: &str, conn_id: &str) -> Option<Departure> {
        let departure = {
            let mut room = self.rooms.get_mut(room_id)?;
            let idx = room.members.iter().position(|m| m.conn_id == conn_id)?;
            let member = room.members.remove(idx);
            Departure {
                room_id: room_id.to_string(),
                user_id: member.user_id,
                remaining: room.members.iter().map(|m| m.conn_id.clone()).collect(),
            }
        };

        tracing::info!(
            room_id,
            user_id = departure.user_id.as_str(),
            remaining = departure.remaining.len(),
            "Participant left call room"
        );

        if departure.remaining.is_empty() {
            self.rooms.remove(room_id);
            tracing::debug!(room_id, "Removed empty call room");
        }
        Some(departure)
    }

    /// Connection ids of everyone in the room except `conn_id`.
    pub fn room_peers(&self, room_id: &str, conn_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .filter(|m| m.conn_id != conn_id)
                    .map(|m| m.conn_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &str, conn_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().any(|m| m.conn_id == conn_id))
            .unwrap_or(false)
    }

    pub fn room_members(&self, room_id: &str) -> Option<Vec<String>> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().map(|m| m.user_id.clone()).collect())
    }

    /// Removes a disconnected client from every room it was in.
    pub fn remove_from_all_rooms(&self, conn_id: &str) -> Vec<Departure> {
        let room_ids: Vec<String> = self
            .rooms
            .iter()
            .filter(|r| r.members.iter().any(|m| m.conn_id == conn_id))
            .map(|r| r.room_id.clone())
            .collect();

        room_ids
            .iter()
            .filter_map(|room_id| self.leave_room(room_id, conn_id))
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
