use crate::peer::ice::CandidateStats;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Installs the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Calling it twice is harmless.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skillswap_call=info,tower_http=info".into()),
        )
        .try_init();
}

/// Logs an ICE candidate as it appears (trickle ICE)
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        tracing::debug!(
            label,
            candidate = init.candidate.as_str(),
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            "Trickle candidate"
        );
    }
}

pub fn dump_candidate_stats(label: &str, stats: &CandidateStats) {
    tracing::info!(
        label,
        host = stats.host,
        srflx = stats.srflx,
        prflx = stats.prflx,
        relay = stats.relay,
        "Candidate gathering complete"
    );
    if stats.relay == 0 {
        tracing::debug!(label, "No TURN relay candidates, calls across strict NATs may fail");
    }
}

/// Quick getStats snapshot of the nominated candidate pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                tracing::info!(
                    moment,
                    local = pair.local_candidate_id.as_str(),
                    remote = pair.remote_candidate_id.as_str(),
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "Selected candidate pair"
                );
            }
        }
    }
}
