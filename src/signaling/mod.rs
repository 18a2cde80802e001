pub mod channel;
pub mod message;
mod ws;

pub use channel::{ChannelEvent, SignalSender, SignalingChannel, Subscription};
pub use message::SignalMessage;
