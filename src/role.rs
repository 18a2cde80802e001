//! Offerer/answerer selection.
//!
//! Both participants run [`negotiate`] independently with their own id and the
//! counterpart id learned from room membership; the rule is symmetric, so the
//! two sides always agree without exchanging anything first.

use crate::error::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

/// The lexicographically smaller identifier creates the offer.
pub fn negotiate(local_id: &str, remote_id: &str) -> Result<Role, CallError> {
    if local_id.is_empty() || remote_id.is_empty() {
        return Err(CallError::EmptyParticipant);
    }
    if local_id == remote_id {
        return Err(CallError::SameParticipant(local_id.to_string()));
    }
    if local_id < remote_id {
        Ok(Role::Offerer)
    } else {
        Ok(Role::Answerer)
    }
}
