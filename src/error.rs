//! Error types for the call signaling flow.
//!
//! Every failure is terminal for the call it happens in: nothing here is
//! retried automatically, callers surface the error and the user restarts
//! the call.

use crate::media::MediaError;
use crate::peer::state::CallStatus;
use crate::role::Role;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Debug, Error)]
pub enum CallError {
    /// Camera/microphone could not be acquired
    #[error("media access failed: {0}")]
    Media(#[from] MediaError),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("malformed signaling message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("relay rejected request: {0}")]
    Rejected(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("cannot {operation} while role is {role:?}")]
    WrongRole {
        operation: &'static str,
        role: Option<Role>,
    },

    #[error("no peer connection is open")]
    NoConnection,

    #[error("local description already set")]
    DescriptionAlreadySet,

    #[error("answer received before an offer was sent")]
    OfferNotSent,

    #[error("expected an {expected} description, got {actual}")]
    UnexpectedDescription {
        expected: &'static str,
        actual: String,
    },

    #[error("participant identifier must not be empty")]
    EmptyParticipant,

    #[error("participants must have distinct identifiers (both are {0:?})")]
    SameParticipant(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("call task failed: {0}")]
    Task(String),
}

impl CallError {
    /// Messages that arrive out of sequence (duplicate offer, answer without
    /// offer, offer sent to the offerer). The call keeps going when it sees one.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CallError::InvalidTransition { .. }
                | CallError::WrongRole { .. }
                | CallError::DescriptionAlreadySet
                | CallError::OfferNotSent
                | CallError::UnexpectedDescription { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CallError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CallError::Transport(e.to_string())
    }
}
