//! One exchange call from mount to teardown.
//!
//! [`CallSession::start`] spawns a single task that owns the peer connection
//! manager, the room subscription and the local media. Commands from the
//! [`CallHandle`], signaling messages and peer connection events are all
//! handled on that task, one at a time.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{spawn_silence, LocalMediaStream, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::connection::{CandidateDisposition, PeerConnectionManager};
use crate::peer::state::{CallStatus, StatusTracker};
use crate::role::{negotiate, Role};
use crate::signaling::{ChannelEvent, SignalMessage, SignalSender, SignalingChannel, Subscription};
use crate::utils::room_id_for;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CallSession {
    exchange_id: String,
    user_id: String,
    room_id: String,
    config: CallConfig,
}

#[derive(Debug)]
pub enum CallCommand {
    Toggle(TrackKind, oneshot::Sender<Option<bool>>),
    End,
}

/// What is left of a call once it has been torn down.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub room_id: String,
    pub role: Option<Role>,
    pub counterpart: Option<String>,
    pub final_status: CallStatus,
    pub remote_tracks: Vec<TrackKind>,
}

impl CallSession {
    pub fn new(exchange_id: impl Into<String>, user_id: impl Into<String>, config: CallConfig) -> Self {
        let exchange_id = exchange_id.into();
        Self {
            room_id: room_id_for(&exchange_id),
            exchange_id,
            user_id: user_id.into(),
            config,
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Acquires local media and starts the call task. Must be called from
    /// within a tokio runtime.
    pub fn start(
        self,
        channel: &SignalingChannel,
        devices: &dyn MediaDevices,
        constraints: MediaConstraints,
    ) -> CallHandle {
        let status = StatusTracker::new();
        let subscription = channel.subscribe(&self.room_id);
        // a bad config must not leave devices open
        let media = self
            .config
            .validate()
            .and_then(|()| devices.get_user_media(&constraints).map_err(CallError::from));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        tracing::info!(
            room_id = self.room_id.as_str(),
            user_id = self.user_id.as_str(),
            audio = constraints.audio,
            video = constraints.video,
            "Starting call"
        );

        let room_id = self.room_id.clone();
        let task = tokio::spawn(run_call(
            self,
            status.clone(),
            channel.sender(),
            subscription,
            media,
            commands_rx,
        ));

        CallHandle {
            room_id,
            status,
            commands: commands_tx,
            task,
        }
    }
}

/// Control surface of a running call. Dropping it ends the call.
pub struct CallHandle {
    room_id: String,
    status: StatusTracker,
    commands: mpsc::UnboundedSender<CallCommand>,
    task: JoinHandle<CallSummary>,
}

impl CallHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn status(&self) -> CallStatus {
        self.status.current()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    /// Resolves with the first status matching `pred`, checking the current
    /// one first.
    pub async fn wait_for_status<F>(&self, pred: F, wait: Duration) -> Result<CallStatus, CallError>
    where
        F: Fn(CallStatus) -> bool,
    {
        let mut rx = self.status.subscribe();
        let watched = async {
            loop {
                let status = *rx.borrow_and_update();
                if pred(status) {
                    return Ok(status);
                }
                if rx.changed().await.is_err() {
                    return Err(CallError::ChannelClosed);
                }
            }
        };
        tokio::time::timeout(wait, watched)
            .await
            .map_err(|_| CallError::Timeout("call status"))?
    }

    /// Returns the new `enabled` flag, or `None` without an audio track.
    pub async fn toggle_audio(&self) -> Result<Option<bool>, CallError> {
        self.toggle(TrackKind::Audio).await
    }

    /// Returns the new `enabled` flag, or `None` without a video track.
    pub async fn toggle_video(&self) -> Result<Option<bool>, CallError> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Result<Option<bool>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(CallCommand::Toggle(kind, tx))
            .map_err(|_| CallError::ChannelClosed)?;
        rx.await.map_err(|_| CallError::ChannelClosed)
    }

    /// Ends the call and waits for teardown to finish.
    pub async fn end(self) -> Result<CallSummary, CallError> {
        // the task may already be gone, in which case this is a no-op
        let _ = self.commands.send(CallCommand::End);
        self.task.await.map_err(|e| CallError::Task(e.to_string()))
    }
}

struct CallTask {
    user_id: String,
    room_id: String,
    status: StatusTracker,
    signaling: SignalSender,
    manager: PeerConnectionManager,
    counterpart: Option<String>,
    disconnected: bool,
}

async fn run_call(
    session: CallSession,
    status: StatusTracker,
    signaling: SignalSender,
    mut subscription: Subscription,
    media: Result<LocalMediaStream, CallError>,
    mut commands: mpsc::UnboundedReceiver<CallCommand>,
) -> CallSummary {
    let CallSession {
        user_id,
        room_id,
        config,
        ..
    } = session;

    let media = match media {
        Ok(media) => Arc::new(media),
        Err(e) => {
            tracing::error!(room_id = room_id.as_str(), error = %e, "Call could not start");
            let _ = status.transition(CallStatus::Error);
            return CallSummary {
                room_id,
                role: None,
                counterpart: None,
                final_status: status.current(),
                remote_tracks: Vec::new(),
            };
        }
    };

    let silence = match media.track(TrackKind::Audio) {
        Some(track) if config.send_silence => Some(spawn_silence(track.clone())),
        _ => None,
    };

    let (manager, mut peer_events) = PeerConnectionManager::new(
        config,
        room_id.clone(),
        media.clone(),
        signaling.clone(),
        status.clone(),
    );
    let mut call = CallTask {
        user_id,
        room_id,
        status,
        signaling,
        manager,
        counterpart: None,
        disconnected: false,
    };

    let opened = call.manager.open().await;
    if let Err(e) = opened {
        call.manager.fail(&e);
    } else if let Err(e) = call.signaling.send(SignalMessage::JoinCallRoom {
        room_id: call.room_id.clone(),
        user_id: call.user_id.clone(),
    }) {
        call.on_failure("join room", e);
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(CallCommand::Toggle(kind, reply)) => {
                    let _ = reply.send(media.toggle(kind));
                }
                Some(CallCommand::End) => {
                    tracing::info!(room_id = call.room_id.as_str(), "Ending call");
                    break;
                }
                None => {
                    tracing::info!(room_id = call.room_id.as_str(), "Call handle dropped, ending call");
                    break;
                }
            },
            event = subscription.recv(), if !call.disconnected => match event {
                Some(ChannelEvent::Message(msg)) => call.on_signal(msg).await,
                Some(ChannelEvent::Disconnected) | None => call.on_transport_lost(),
            },
            Some(event) = peer_events.recv() => {
                let result = call.manager.handle_event(event).await;
                if let Err(e) = result {
                    call.on_failure("peer event", e);
                }
            }
        }
    }

    call.teardown(silence).await;
    drop(subscription);

    CallSummary {
        room_id: call.room_id,
        role: call.manager.role(),
        counterpart: call.counterpart,
        final_status: call.status.current(),
        remote_tracks: call.manager.remote_tracks().to_vec(),
    }
}

impl CallTask {
    async fn on_signal(&mut self, msg: SignalMessage) {
        if self.status.current().is_terminal() {
            tracing::debug!(event = msg.event_name(), "Call over, ignoring signal");
            return;
        }

        match msg {
            SignalMessage::RoomMembers { members, .. } => {
                tracing::debug!(?members, "Room members");
                if let Some(other) = members.into_iter().find(|m| *m != self.user_id) {
                    self.on_counterpart(other).await;
                }
            }
            SignalMessage::PeerJoined { user_id, .. } => {
                if user_id != self.user_id {
                    self.on_counterpart(user_id).await;
                }
            }
            SignalMessage::PeerLeft { user_id, .. } => {
                if self.counterpart.as_deref() == Some(user_id.as_str()) {
                    tracing::warn!(user_id = user_id.as_str(), "Counterpart left the room");
                }
            }
            SignalMessage::WebrtcOffer { sdp, .. } => {
                tracing::info!(room_id = self.room_id.as_str(), "Offer received");
                let result = self.manager.accept_offer(sdp).await;
                self.check("accept offer", result);
            }
            SignalMessage::WebrtcAnswer { sdp, .. } => {
                tracing::info!(room_id = self.room_id.as_str(), "Answer received");
                let result = self.manager.accept_answer(sdp).await;
                self.check("accept answer", result);
            }
            SignalMessage::WebrtcIceCandidate { candidate, .. } => {
                match self.manager.add_remote_candidate(candidate).await {
                    Ok(CandidateDisposition::Applied) => tracing::trace!("Remote candidate applied"),
                    Ok(CandidateDisposition::Buffered) => tracing::debug!(
                        pending = self.manager.pending_candidates(),
                        "Remote candidate buffered"
                    ),
                    // a bad candidate only loses one path
                    Err(e) => tracing::warn!(error = %e, "Failed to add remote candidate"),
                }
            }
            SignalMessage::Error { room_id, message } => {
                if room_id.is_none() || room_id.as_deref() == Some(self.room_id.as_str()) {
                    self.on_failure("relay", CallError::Rejected(message));
                }
            }
            other => {
                tracing::debug!(event = other.event_name(), "Ignoring client-only event");
            }
        }
    }

    async fn on_counterpart(&mut self, user_id: String) {
        match &self.counterpart {
            Some(known) if *known == user_id => return,
            Some(known) => {
                tracing::warn!(
                    known = known.as_str(),
                    other = user_id.as_str(),
                    "Ignoring extra participant"
                );
                return;
            }
            None => {}
        }

        let role = match negotiate(&self.user_id, &user_id) {
            Ok(role) => role,
            Err(e) => return self.on_failure("negotiate role", e),
        };
        tracing::info!(
            room_id = self.room_id.as_str(),
            counterpart = user_id.as_str(),
            %role,
            "Counterpart found"
        );
        self.counterpart = Some(user_id);
        self.manager.set_role(role);

        let result = match role {
            Role::Offerer => self.manager.create_offer().await,
            Role::Answerer => self.manager.await_offer(),
        };
        self.check("start negotiation", result);
    }

    fn on_transport_lost(&mut self) {
        self.disconnected = true;
        if self.status.current().is_terminal() {
            return;
        }
        tracing::warn!(room_id = self.room_id.as_str(), "Signaling lost");
        let _ = self.status.transition(CallStatus::Disconnected);
    }

    fn check(&mut self, operation: &str, result: Result<(), CallError>) {
        if let Err(e) = result {
            self.on_failure(operation, e);
        }
    }

    fn on_failure(&mut self, operation: &str, error: CallError) {
        match error {
            e if e.is_protocol_violation() => {
                tracing::warn!(operation, error = %e, "Ignoring out-of-sequence event");
            }
            CallError::ChannelClosed => {
                tracing::warn!(operation, "Signaling channel closed");
                self.on_transport_lost();
            }
            e => {
                tracing::error!(operation, "Call operation failed");
                self.manager.fail(&e);
            }
        }
    }

    async fn teardown(&mut self, silence: Option<JoinHandle<()>>) {
        if !self.disconnected && !self.signaling.is_closed() {
            if let Err(e) = self.signaling.send(SignalMessage::LeaveCallRoom {
                room_id: self.room_id.clone(),
            }) {
                tracing::debug!(error = %e, "Could not announce leaving");
            }
        }
        self.manager.close().await;
        if let Some(task) = silence {
            task.abort();
        }
        tracing::info!(
            room_id = self.room_id.as_str(),
            status = %self.status.current(),
            "Call torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticDevices;

    fn local_channel() -> (
        SignalingChannel,
        mpsc::UnboundedReceiver<SignalMessage>,
        mpsc::UnboundedSender<SignalMessage>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (SignalingChannel::from_parts(out_tx, in_rx), out_rx, in_tx)
    }

    async fn next_sent(rx: &mut mpsc::UnboundedReceiver<SignalMessage>) -> SignalMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(SignalMessage::WebrtcIceCandidate { .. }) => continue,
                    Some(msg) => return msg,
                    None => panic!("outbound closed"),
                }
            }
        })
        .await
        .expect("nothing sent")
    }

    #[test]
    fn room_id_derives_from_exchange() {
        let session = CallSession::new("ex123", "a1", CallConfig::local());
        assert_eq!(session.room_id(), "call-ex123");
        assert_eq!(session.exchange_id(), "ex123");
        assert_eq!(session.user_id(), "a1");
    }

    #[tokio::test]
    async fn joins_room_then_leaves_on_end() {
        let (channel, mut sent, _inbound) = local_channel();
        let handle = CallSession::new("ex123", "a1", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::default(),
        );

        match next_sent(&mut sent).await {
            SignalMessage::JoinCallRoom { room_id, user_id } => {
                assert_eq!(room_id, "call-ex123");
                assert_eq!(user_id, "a1");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(handle.status(), CallStatus::Waiting);

        let summary = handle.end().await.unwrap();
        assert_eq!(summary.final_status, CallStatus::Waiting);
        assert!(summary.role.is_none());
        assert!(matches!(
            next_sent(&mut sent).await,
            SignalMessage::LeaveCallRoom { ref room_id } if room_id == "call-ex123"
        ));
    }

    #[tokio::test]
    async fn smaller_id_offers_when_peer_joins() {
        let (channel, mut sent, inbound) = local_channel();
        let handle = CallSession::new("ex123", "a1", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::default(),
        );
        next_sent(&mut sent).await;

        inbound
            .send(SignalMessage::PeerJoined {
                room_id: "call-ex123".into(),
                user_id: "b2".into(),
            })
            .unwrap();

        match next_sent(&mut sent).await {
            SignalMessage::WebrtcOffer { room_id, .. } => assert_eq!(room_id, "call-ex123"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(handle.status(), CallStatus::CreatingOffer);

        let summary = handle.end().await.unwrap();
        assert_eq!(summary.role, Some(Role::Offerer));
        assert_eq!(summary.counterpart.as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn larger_id_waits_for_offer() {
        let (channel, mut sent, inbound) = local_channel();
        let handle = CallSession::new("ex123", "b2", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::default(),
        );
        next_sent(&mut sent).await;

        inbound
            .send(SignalMessage::RoomMembers {
                room_id: "call-ex123".into(),
                members: vec!["a1".into()],
            })
            .unwrap();

        let status = handle
            .wait_for_status(|s| s == CallStatus::WaitingForOffer, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, CallStatus::WaitingForOffer);
        handle.end().await.unwrap();
    }

    #[tokio::test]
    async fn stray_answer_is_ignored() {
        let (channel, mut sent, inbound) = local_channel();
        let handle = CallSession::new("ex123", "b2", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::default(),
        );
        next_sent(&mut sent).await;

        let sdp = serde_json::from_value(serde_json::json!({"type": "answer", "sdp": "v=0\r\n"})).unwrap();
        inbound
            .send(SignalMessage::WebrtcAnswer {
                sdp,
                room_id: "call-ex123".into(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.status(), CallStatus::Waiting);
        handle.end().await.unwrap();
    }

    #[tokio::test]
    async fn relay_error_for_our_room_fails_the_call() {
        let (channel, mut sent, inbound) = local_channel();
        let handle = CallSession::new("ex123", "c3", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::default(),
        );
        next_sent(&mut sent).await;

        inbound
            .send(SignalMessage::error(Some("call-ex123"), "room full"))
            .unwrap();
        handle
            .wait_for_status(|s| s == CallStatus::Error, Duration::from_secs(5))
            .await
            .unwrap();
        handle.end().await.unwrap();
    }

    #[tokio::test]
    async fn toggles_flip_only_their_kind() {
        let (channel, _sent, _inbound) = local_channel();
        let handle = CallSession::new("ex123", "a1", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::default(),
        );

        assert_eq!(handle.toggle_audio().await.unwrap(), Some(false));
        assert_eq!(handle.toggle_video().await.unwrap(), Some(false));
        assert_eq!(handle.toggle_audio().await.unwrap(), Some(true));
        handle.end().await.unwrap();
    }

    #[tokio::test]
    async fn audio_only_call_has_no_video_toggle() {
        let (channel, _sent, _inbound) = local_channel();
        let handle = CallSession::new("ex123", "a1", CallConfig::local()).start(
            &channel,
            &SyntheticDevices,
            MediaConstraints::audio_only(),
        );
        assert_eq!(handle.toggle_video().await.unwrap(), None);
        handle.end().await.unwrap();
    }
}
