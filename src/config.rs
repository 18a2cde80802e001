// Call configuration
// Logging verbosity is controlled through RUST_LOG, see logger::init

use crate::error::CallError;
use crate::peer::ice::ice_servers;
use crate::peer::types::{IceServerKind, ServerConfig};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Used when no ICE servers are configured
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> =
    Lazy::new(|| vec![ServerConfig::stun("default-stun", DEFAULT_STUN_URL)]);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Gather 127.0.0.1 candidates too (same-host calls and tests)
    pub include_loopback_candidates: bool,
    /// Feed Opus silence into the local audio track while it is enabled
    pub send_silence: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ice_candidate_pool_size: 10,
            include_loopback_candidates: false,
            send_silence: false,
        }
    }
}

impl CallConfig {
    /// Config for calls between processes on the same machine: no public
    /// STUN lookups, loopback candidates allowed.
    pub fn local() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback_candidates: true,
            ..Self::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn validate(&self) -> Result<(), CallError> {
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(CallError::Config(format!(
                    "ICE server {:?} has an empty URL",
                    server.id
                )));
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::Config(format!(
                    "TURN server {:?} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    /// Parses a command-line ICE server: `stun:host:port`, `stuns:host:port`,
    /// `turn:user:credential@host:port` or `turns:user:credential@host:port`.
    /// A bare `host:port` is a STUN server.
    pub fn parse_ice_server(id: impl Into<String>, value: &str) -> Result<ServerConfig, CallError> {
        let value = value.trim();
        let (kind, scheme, rest) = [
            (IceServerKind::Turn, "turns:"),
            (IceServerKind::Turn, "turn:"),
            (IceServerKind::Stun, "stuns:"),
            (IceServerKind::Stun, "stun:"),
        ]
        .into_iter()
        .find_map(|(kind, scheme)| value.strip_prefix(scheme).map(|rest| (kind, scheme, rest)))
        .unwrap_or((IceServerKind::Stun, IceServerKind::Stun.scheme(), value));
        if rest.is_empty() {
            return Err(CallError::Config(format!("ICE server {value:?} has no host")));
        }

        let mut server = ServerConfig::stun(id, format!("{scheme}{rest}"));
        server.kind = kind;
        if let Some((auth, host)) = rest.rsplit_once('@') {
            let (username, credential) = auth
                .split_once(':')
                .ok_or_else(|| CallError::Config(format!("ICE server {value:?}: expected user:credential")))?;
            server.url = format!("{scheme}{host}");
            server.username = Some(username.to_string());
            server.credential = Some(credential.to_string());
        }
        Ok(server)
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: ice_servers(&self.ice_servers),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_one_public_stun_server() {
        let cfg = CallConfig::default();
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.ice_servers[0].url, DEFAULT_STUN_URL);
        assert!(cfg.validate().is_ok());

        let rtc = cfg.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let cfg = CallConfig::default().with_ice_servers(vec![ServerConfig {
            id: "turn-1".into(),
            kind: IceServerKind::Turn,
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        }]);
        assert!(matches!(cfg.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn empty_url_is_rejected() {
        let cfg = CallConfig::default().with_ice_servers(vec![ServerConfig::stun("s", " ")]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_command_line_servers() {
        let stun = CallConfig::parse_ice_server("s", "stun.example.org:3478").unwrap();
        assert_eq!(stun.kind, IceServerKind::Stun);
        assert_eq!(stun.url, "stun:stun.example.org:3478");

        let turn = CallConfig::parse_ice_server("t", "turn:alice:s3cret@turn.example.org:3478").unwrap();
        assert_eq!(turn.kind, IceServerKind::Turn);
        assert_eq!(turn.url, "turn:turn.example.org:3478");
        assert_eq!(turn.username.as_deref(), Some("alice"));
        assert_eq!(turn.credential.as_deref(), Some("s3cret"));

        let secure = CallConfig::parse_ice_server("t", "turns:u:p@turn.example.org:5349").unwrap();
        assert_eq!(secure.kind, IceServerKind::Turn);
        assert_eq!(secure.url, "turns:turn.example.org:5349");
        assert_eq!(secure.username.as_deref(), Some("u"));

        let stuns = CallConfig::parse_ice_server("s", "stuns:stun.example.org:5349").unwrap();
        assert_eq!(stuns.kind, IceServerKind::Stun);
        assert_eq!(stuns.url, "stuns:stun.example.org:5349");

        assert!(CallConfig::parse_ice_server("x", "turn:").is_err());
        assert!(CallConfig::parse_ice_server("x", "turns:").is_err());
        assert!(CallConfig::parse_ice_server("x", "turn:nopass@host:1").is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: CallConfig = serde_json::from_str(r#"{"send_silence":true}"#).unwrap();
        assert!(cfg.send_silence);
        assert_eq!(cfg.ice_servers, *DEFAULT_ICE_SERVERS);
    }
}
