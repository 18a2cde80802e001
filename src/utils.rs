use crate::peer::types::ServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Room identifier shared by both participants of an exchange.
pub fn room_id_for(exchange_id: &str) -> String {
    format!("call-{exchange_id}")
}

// Adds the stun:/turn: scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        format!("{}{}", config.kind.scheme(), config.url)
    }
}
