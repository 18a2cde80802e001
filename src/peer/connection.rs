use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::{dump_candidate, dump_candidate_stats, dump_selected_pair};
use crate::media::{LocalMediaStream, TrackKind};
use crate::peer::ice::{CandidateStats, PendingCandidates};
use crate::peer::state::{CallStatus, StatusTracker};
use crate::peer::types::IceCandidate;
use crate::role::Role;
use crate::signaling::{SignalMessage, SignalSender};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Events raised by the handlers registered in [`PeerConnectionManager::open`].
/// `generation` identifies the connection that raised them.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        generation: u64,
        state: RTCPeerConnectionState,
    },
    RemoteTrack {
        generation: u64,
        kind: TrackKind,
        track_id: String,
    },
}

impl PeerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PeerEvent::StateChanged { generation, .. } | PeerEvent::RemoteTrack { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until a remote description is set
    Buffered,
}

/// Owns the single peer connection of a call.
pub struct PeerConnectionManager {
    config: CallConfig,
    room_id: String,
    media: Arc<LocalMediaStream>,
    signaling: SignalSender,
    status: StatusTracker,
    events: mpsc::UnboundedSender<PeerEvent>,
    pc: Option<Arc<RTCPeerConnection>>,
    generation: u64,
    role: Option<Role>,
    offer_sent: bool,
    pending: PendingCandidates,
    remote_tracks: Vec<TrackKind>,
}

impl PeerConnectionManager {
    pub fn new(
        config: CallConfig,
        room_id: impl Into<String>,
        media: Arc<LocalMediaStream>,
        signaling: SignalSender,
        status: StatusTracker,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            room_id: room_id.into(),
            media,
            signaling,
            status,
            events,
            pc: None,
            generation: 0,
            role: None,
            offer_sent: false,
            pending: PendingCandidates::default(),
            remote_tracks: Vec::new(),
        };
        (manager, events_rx)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn status(&self) -> CallStatus {
        self.status.current()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        tracing::info!(room_id = self.room_id.as_str(), %role, "Role negotiated");
        self.role = Some(role);
    }

    /// Number of connections opened so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_tracks(&self) -> &[TrackKind] {
        &self.remote_tracks
    }

    /// Replaces any existing connection with a fresh one carrying all local
    /// tracks.
    pub async fn open(&mut self) -> Result<(), CallError> {
        self.release_connection().await;
        self.generation += 1;
        let generation = self.generation;

        let api = build_api(&self.config)?;
        let pc = Arc::new(api.new_peer_connection(self.config.rtc_configuration()).await?);

        for track in self.media.tracks() {
            pc.add_track(track.as_track_local()).await?;
            tracing::debug!(kind = %track.kind(), id = track.id(), "Local track attached");
        }

        // local candidates go straight out (trickle ICE)
        let signaling = self.signaling.clone();
        let room_id = self.room_id.clone();
        let mut gathered = CandidateStats::default();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    dump_candidate("LOCAL", &c);
                    match c.to_json() {
                        Ok(init) => {
                            gathered.record(&init.candidate);
                            let msg = SignalMessage::WebrtcIceCandidate {
                                candidate: IceCandidate::from(init),
                                room_id: room_id.clone(),
                            };
                            if let Err(e) = signaling.send(msg) {
                                tracing::warn!(error = %e, "Dropping local candidate");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                    }
                }
                None => {
                    dump_candidate_stats("LOCAL", &gathered);
                    gathered = CandidateStats::default();
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            tracing::debug!(generation, ?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!(generation, ?state, "Peer connection state changed");
            let _ = events.send(PeerEvent::StateChanged { generation, state });
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let Ok(kind) = TrackKind::try_from(track.kind()) else {
                    return;
                };
                let _ = events.send(PeerEvent::RemoteTrack {
                    generation,
                    kind,
                    track_id: track.id().to_string(),
                });
                // keep the receive buffers moving; rendering is not our job
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            })
        }));

        tracing::info!(
            room_id = self.room_id.as_str(),
            generation,
            tracks = self.media.tracks().len(),
            "Peer connection opened"
        );
        self.pc = Some(pc);
        Ok(())
    }

    /// Answerer side: nothing to do until the offer arrives.
    pub fn await_offer(&mut self) -> Result<(), CallError> {
        if self.role != Some(Role::Answerer) {
            return Err(CallError::WrongRole {
                operation: "wait for an offer",
                role: self.role,
            });
        }
        self.status.transition(CallStatus::WaitingForOffer)?;
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<(), CallError> {
        if self.role != Some(Role::Offerer) {
            return Err(CallError::WrongRole {
                operation: "create an offer",
                role: self.role,
            });
        }
        let pc = self.connection().ok_or(CallError::NoConnection)?;
        if pc.local_description().await.is_some() {
            return Err(CallError::DescriptionAlreadySet);
        }
        self.status.transition(CallStatus::CreatingOffer)?;

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        let sdp = pc.local_description().await.ok_or(CallError::NoConnection)?;

        self.signaling.send(SignalMessage::WebrtcOffer {
            sdp,
            room_id: self.room_id.clone(),
        })?;
        self.offer_sent = true;
        tracing::info!(room_id = self.room_id.as_str(), "Offer sent");
        Ok(())
    }

    pub async fn accept_offer(&mut self, offer: RTCSessionDescription) -> Result<(), CallError> {
        if self.role != Some(Role::Answerer) {
            return Err(CallError::WrongRole {
                operation: "accept an offer",
                role: self.role,
            });
        }
        expect_type(&offer, RTCSdpType::Offer, "offer")?;
        let pc = self.connection().ok_or(CallError::NoConnection)?;
        // one offer per connection; a repeat would renegotiate
        if pc.remote_description().await.is_some() || pc.local_description().await.is_some() {
            return Err(CallError::DescriptionAlreadySet);
        }
        if self.status.current() == CallStatus::Waiting {
            self.status.transition(CallStatus::WaitingForOffer)?;
        }
        self.status.transition(CallStatus::CreatingAnswer)?;

        pc.set_remote_description(offer).await?;
        let applied = self.pending.flush(&pc).await;
        if applied > 0 {
            tracing::debug!(applied, "Buffered candidates applied after offer");
        }

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let sdp = pc.local_description().await.ok_or(CallError::NoConnection)?;

        self.signaling.send(SignalMessage::WebrtcAnswer {
            sdp,
            room_id: self.room_id.clone(),
        })?;
        tracing::info!(room_id = self.room_id.as_str(), "Answer sent");
        Ok(())
    }

    pub async fn accept_answer(&mut self, answer: RTCSessionDescription) -> Result<(), CallError> {
        if !self.offer_sent {
            return Err(CallError::OfferNotSent);
        }
        expect_type(&answer, RTCSdpType::Answer, "answer")?;
        let pc = self.connection().ok_or(CallError::NoConnection)?;
        if pc.remote_description().await.is_some() {
            return Err(CallError::DescriptionAlreadySet);
        }

        pc.set_remote_description(answer).await?;
        let applied = self.pending.flush(&pc).await;
        if applied > 0 {
            tracing::debug!(applied, "Buffered candidates applied after answer");
        }
        tracing::info!(room_id = self.room_id.as_str(), "Answer applied");
        Ok(())
    }

    /// Applies a remote candidate, or buffers it while no remote description
    /// is set yet.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, CallError> {
        let Some(pc) = self.connection() else {
            self.pending.push(candidate);
            return Ok(CandidateDisposition::Buffered);
        };
        if pc.remote_description().await.is_none() {
            tracing::debug!("Remote description not set yet, queuing candidate");
            self.pending.push(candidate);
            return Ok(CandidateDisposition::Buffered);
        }
        pc.add_ice_candidate(RTCIceCandidateInit::from(candidate)).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Both sides of the description exchange are in place.
    pub async fn descriptions_exchanged(&self) -> bool {
        match &self.pc {
            Some(pc) => pc.local_description().await.is_some() && pc.remote_description().await.is_some(),
            None => false,
        }
    }

    pub async fn handle_event(&mut self, event: PeerEvent) -> Result<(), CallError> {
        if event.generation() != self.generation || self.pc.is_none() {
            tracing::debug!(
                event_generation = event.generation(),
                current = self.generation,
                "Ignoring event from a released connection"
            );
            return Ok(());
        }

        match event {
            PeerEvent::StateChanged { state, .. } => match state {
                RTCPeerConnectionState::Connected => {
                    if !self.descriptions_exchanged().await {
                        tracing::warn!("Connected reported before the description exchange finished");
                        return Ok(());
                    }
                    self.status.transition(CallStatus::Connected)?;
                    if let Some(pc) = &self.pc {
                        dump_selected_pair(pc, "CONNECTED").await;
                    }
                }
                RTCPeerConnectionState::Failed => {
                    if let Some(pc) = &self.pc {
                        dump_selected_pair(pc, "FAILED").await;
                    }
                    self.status.transition(CallStatus::Error)?;
                }
                RTCPeerConnectionState::Disconnected => {
                    tracing::warn!(room_id = self.room_id.as_str(), "Peer connection interrupted");
                }
                other => tracing::debug!(state = ?other, "Peer connection state ignored"),
            },
            PeerEvent::RemoteTrack { kind, track_id, .. } => {
                tracing::info!(%kind, track_id = track_id.as_str(), "Remote track arrived");
                self.remote_tracks.push(kind);
            }
        }
        Ok(())
    }

    /// Marks the call failed; terminal.
    pub fn fail(&self, reason: &CallError) {
        tracing::error!(room_id = self.room_id.as_str(), error = %reason, "Call failed");
        let _ = self.status.transition(CallStatus::Error);
    }

    /// Releases the connection and stops every local track. Safe to call
    /// any number of times.
    pub async fn close(&mut self) {
        self.release_connection().await;
        self.media.stop_all();
    }

    async fn release_connection(&mut self) {
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                tracing::warn!(error = %e, "Peer connection close failed");
            }
            tracing::info!(generation = self.generation, "Peer connection released");
        }
        self.pending.clear();
        self.offer_sent = false;
    }
}

fn build_api(config: &CallConfig) -> Result<API, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(config.include_loopback_candidates);

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build())
}

fn expect_type(
    desc: &RTCSessionDescription,
    expected: RTCSdpType,
    name: &'static str,
) -> Result<(), CallError> {
    if desc.sdp_type == expected {
        Ok(())
    } else {
        Err(CallError::UnexpectedDescription {
            expected: name,
            actual: format!("{:?}", desc.sdp_type),
        })
    }
}
