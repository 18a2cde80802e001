pub mod connection;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::{CandidateDisposition, PeerConnectionManager, PeerEvent};
pub use ice::{probe_ice_server, CandidateStats, PendingCandidates};
pub use state::{CallStatus, StatusTracker};
pub use types::{IceCandidate, IceServerKind, ServerConfig};
