//! Call signaling for peer-to-peer skill exchange sessions.
//!
//! Two participants of an exchange meet in the relay room `call-<exchangeId>`,
//! agree on who offers, trade SDP and ICE candidates through the relay and
//! end up with a direct WebRTC audio/video connection.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod relay;
pub mod role;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::CallConfig;
pub use error::{CallError, Result};
pub use media::{LocalMediaStream, MediaConstraints, MediaDevices, MediaError, SyntheticDevices, TrackKind};
pub use peer::{CallStatus, IceCandidate, PeerConnectionManager, ServerConfig};
pub use relay::{RelayConfig, RelayState};
pub use role::{negotiate, Role};
pub use session::{CallHandle, CallSession, CallSummary};
pub use signaling::{ChannelEvent, SignalMessage, SignalingChannel, Subscription};
