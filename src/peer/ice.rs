use crate::error::CallError;
use crate::peer::types::{IceCandidate, IceServerKind, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Converts configured servers to the webrtc representation
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Remote candidates received before a remote description was set.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Applies everything queued so far, in arrival order. A candidate the
    /// connection rejects is logged and skipped.
    pub async fn flush(&mut self, pc: &RTCPeerConnection) -> usize {
        let mut applied = 0;
        for candidate in self.queue.drain(..) {
            tracing::debug!(candidate = candidate.candidate.as_str(), "Applying pending candidate");
            match pc.add_ice_candidate(RTCIceCandidateInit::from(candidate)).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(error = %e, "Failed to apply pending candidate"),
            }
        }
        applied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

/// Reads the `typ` attribute of an SDP candidate line
pub fn candidate_type(candidate: &str) -> Option<CandidateType> {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return match parts.next()? {
                "host" => Some(CandidateType::Host),
                "srflx" => Some(CandidateType::Srflx),
                "prflx" => Some(CandidateType::Prflx),
                "relay" => Some(CandidateType::Relay),
                _ => None,
            };
        }
    }
    None
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &str) {
        match candidate_type(candidate) {
            Some(CandidateType::Host) => self.host += 1,
            Some(CandidateType::Srflx) => self.srflx += 1,
            Some(CandidateType::Prflx) => self.prflx += 1,
            Some(CandidateType::Relay) => self.relay += 1,
            None => {}
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.prflx + self.relay
    }
}

/// Checks that an ICE server answers: gathers candidates against it alone and
/// waits for a server-reflexive (STUN) or relay (TURN) candidate.
pub async fn probe_ice_server(config: &ServerConfig, wait: Duration) -> Result<bool, CallError> {
    let rtc_config = RTCConfiguration {
        ice_servers: ice_servers(std::slice::from_ref(config)),
        ..Default::default()
    };
    tracing::info!(
        server = config.id.as_str(),
        url = add_ice_url_scheme(config).as_str(),
        "Probing ICE server"
    );

    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

    let expected = match config.kind {
        IceServerKind::Stun => CandidateType::Srflx,
        IceServerKind::Turn => CandidateType::Relay,
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        let line = cand.map(|c| c.to_json().map(|init| init.candidate).unwrap_or_default());
        let _ = tx.send(line);
        Box::pin(async {})
    }));

    // a data channel gives the offer an m-line to gather for
    pc.create_data_channel("probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let found = timeout(wait, async {
        while let Some(line) = rx.recv().await {
            match line {
                Some(line) if candidate_type(&line) == Some(expected) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if let Err(e) = pc.close().await {
        tracing::debug!(error = %e, "Probe connection close failed");
    }
    tracing::info!(server = config.id.as_str(), reachable = found, "ICE probe finished");
    Ok(found)
}
