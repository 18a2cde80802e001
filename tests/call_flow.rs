//! End-to-end call flows against an in-process relay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use skillswap_call::media::LocalTrack;
use skillswap_call::peer::{IceServerKind, StatusTracker};
use skillswap_call::signaling::SignalSender;
use skillswap_call::{
    CallConfig, CallHandle, CallSession, CallStatus, LocalMediaStream, MediaConstraints,
    MediaDevices, MediaError, PeerConnectionManager, RelayConfig, RelayState, Role, ServerConfig,
    SignalMessage, SignalingChannel, SyntheticDevices, TrackKind,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SHORT: Duration = Duration::from_secs(5);

/// Hands out synthetic streams and remembers their tracks.
#[derive(Default)]
struct RecordingDevices {
    handed_out: Mutex<Vec<Arc<LocalTrack>>>,
}

impl RecordingDevices {
    fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.handed_out.lock().unwrap().clone()
    }
}

impl MediaDevices for RecordingDevices {
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        let stream = SyntheticDevices.get_user_media(constraints)?;
        self.handed_out
            .lock()
            .unwrap()
            .extend(stream.tracks().iter().cloned());
        Ok(stream)
    }
}

struct DeniedCamera;

impl MediaDevices for DeniedCamera {
    fn get_user_media(&self, _: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        Err(MediaError::PermissionDenied(TrackKind::Video))
    }
}

fn relay_channel(relay: &RelayState) -> SignalingChannel {
    let (outbound, inbound) = relay.connect_local();
    SignalingChannel::from_parts(outbound, inbound)
}

fn start(channel: &SignalingChannel, user: &str, devices: &dyn MediaDevices) -> CallHandle {
    CallSession::new("ex123", user, CallConfig::local()).start(
        channel,
        devices,
        MediaConstraints::default(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_participants_connect_through_the_relay() {
    let relay = RelayState::new(RelayConfig::default());
    let a_channel = relay_channel(&relay);
    let b_channel = relay_channel(&relay);
    let a_devices = RecordingDevices::default();
    let b_devices = RecordingDevices::default();

    let a = start(&a_channel, "a1", &a_devices);
    let b = start(&b_channel, "b2", &b_devices);
    assert_eq!(a.room_id(), "call-ex123");

    let connected = |s: CallStatus| s == CallStatus::Connected;
    assert_eq!(
        a.wait_for_status(connected, CONNECT_TIMEOUT).await.unwrap(),
        CallStatus::Connected
    );
    assert_eq!(
        b.wait_for_status(connected, CONNECT_TIMEOUT).await.unwrap(),
        CallStatus::Connected
    );
    assert_eq!(relay.room_members("call-ex123").unwrap().len(), 2);

    // mute flips audio only
    assert_eq!(a.toggle_audio().await.unwrap(), Some(false));
    let a_tracks = a_devices.tracks();
    let audio = a_tracks.iter().find(|t| t.kind() == TrackKind::Audio).unwrap();
    let video = a_tracks.iter().find(|t| t.kind() == TrackKind::Video).unwrap();
    assert!(!audio.is_enabled());
    assert!(video.is_enabled());

    assert_eq!(a.toggle_video().await.unwrap(), Some(false));
    assert!(!video.is_enabled());

    let (a_summary, b_summary) = tokio::join!(a.end(), b.end());
    let a_summary = a_summary.unwrap();
    let b_summary = b_summary.unwrap();

    assert_eq!(a_summary.role, Some(Role::Offerer));
    assert_eq!(b_summary.role, Some(Role::Answerer));
    assert_eq!(a_summary.counterpart.as_deref(), Some("b2"));
    assert_eq!(b_summary.counterpart.as_deref(), Some("a1"));

    for track in a_devices.tracks().iter().chain(b_devices.tracks().iter()) {
        assert!(track.is_stopped(), "{} track still live", track.kind());
    }
}

#[tokio::test]
async fn media_denial_fails_the_call() {
    let relay = RelayState::new(RelayConfig::default());
    let channel = relay_channel(&relay);
    let handle = start(&channel, "a1", &DeniedCamera);

    handle
        .wait_for_status(|s| s == CallStatus::Error, SHORT)
        .await
        .unwrap();
    let summary = handle.end().await.unwrap();
    assert_eq!(summary.final_status, CallStatus::Error);
    assert!(summary.role.is_none());
    // never joined
    assert!(relay.room_members("call-ex123").is_none());
}

#[tokio::test]
async fn losing_signaling_disconnects_the_call() {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let channel = SignalingChannel::from_parts(out_tx, in_rx);
    let devices = RecordingDevices::default();
    let handle = start(&channel, "a1", &devices);

    assert!(matches!(
        out_rx.recv().await,
        Some(SignalMessage::JoinCallRoom { .. })
    ));
    drop(in_tx);

    handle
        .wait_for_status(|s| s == CallStatus::Disconnected, SHORT)
        .await
        .unwrap();
    let summary = handle.end().await.unwrap();
    assert_eq!(summary.final_status, CallStatus::Disconnected);
    assert!(devices.tracks().iter().all(|t| t.is_stopped()));

    // no leave over a dead transport
    while let Ok(msg) = out_rx.try_recv() {
        assert!(!matches!(msg, SignalMessage::LeaveCallRoom { .. }));
    }
}

#[tokio::test]
async fn third_participant_is_turned_away() {
    let relay = RelayState::new(RelayConfig::default());
    let a_channel = relay_channel(&relay);
    let b_channel = relay_channel(&relay);
    let c_channel = relay_channel(&relay);

    let a = start(&a_channel, "a1", &SyntheticDevices);
    let b = start(&b_channel, "b2", &SyntheticDevices);
    tokio::time::timeout(SHORT, async {
        while relay.room_members("call-ex123").map_or(0, |m| m.len()) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let c = start(&c_channel, "c3", &SyntheticDevices);
    c.wait_for_status(|s| s == CallStatus::Error, SHORT)
        .await
        .unwrap();
    assert_eq!(c.end().await.unwrap().counterpart, None);

    a.end().await.unwrap();
    b.end().await.unwrap();
}

#[tokio::test]
async fn dropping_the_handle_leaves_the_room() {
    let relay = RelayState::new(RelayConfig::default());
    let channel = relay_channel(&relay);
    let devices = RecordingDevices::default();
    let handle = start(&channel, "a1", &devices);

    tokio::time::timeout(SHORT, async {
        while relay.room_members("call-ex123").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    drop(handle);
    tokio::time::timeout(SHORT, async {
        while relay.room_members("call-ex123").is_some() || !devices.tracks().iter().all(|t| t.is_stopped()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn invalid_config_never_opens_devices() {
    let relay = RelayState::new(RelayConfig::default());
    let channel = relay_channel(&relay);
    let devices = RecordingDevices::default();
    let config = CallConfig::local().with_ice_servers(vec![ServerConfig {
        id: "turn-1".into(),
        kind: IceServerKind::Turn,
        url: "turn.example.org:3478".into(),
        username: None,
        credential: None,
    }]);

    let handle = CallSession::new("ex123", "a1", config).start(
        &channel,
        &devices,
        MediaConstraints::default(),
    );
    let summary = handle.end().await.unwrap();

    assert_eq!(summary.final_status, CallStatus::Error);
    assert!(devices.tracks().is_empty());
    assert!(relay.room_members("call-ex123").is_none());
}

async fn next_from_relay(rx: &mut mpsc::UnboundedReceiver<SignalMessage>) -> SignalMessage {
    timeout(SHORT, rx.recv())
        .await
        .expect("relay went quiet")
        .expect("relay link closed")
}

/// Drives a bare offerer against a real answerer session: candidates go out
/// before the offer, and the offer goes out twice.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn answerer_session_buffers_early_candidates_and_ignores_a_repeated_offer() {
    let relay = RelayState::new(RelayConfig::default());
    let (a_tx, mut a_rx) = relay.connect_local();
    a_tx.send(SignalMessage::JoinCallRoom {
        room_id: "call-ex123".into(),
        user_id: "a1".into(),
    })
    .unwrap();
    assert!(matches!(
        next_from_relay(&mut a_rx).await,
        SignalMessage::RoomMembers { .. }
    ));

    let b_channel = relay_channel(&relay);
    let b = start(&b_channel, "b2", &SyntheticDevices);
    assert!(matches!(
        next_from_relay(&mut a_rx).await,
        SignalMessage::PeerJoined { ref user_id, .. } if user_id == "b2"
    ));
    b.wait_for_status(|s| s == CallStatus::WaitingForOffer, SHORT)
        .await
        .unwrap();

    // the offerer's signals are captured so the test decides their order
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    let media = Arc::new(LocalMediaStream::new(&MediaConstraints::default()));
    let (mut offerer, mut offerer_events) = PeerConnectionManager::new(
        CallConfig::local(),
        "call-ex123",
        media,
        SignalSender::new(held_tx),
        StatusTracker::new(),
    );
    offerer.open().await.unwrap();
    offerer.set_role(Role::Offerer);
    offerer.create_offer().await.unwrap();

    let mut offer = None;
    let mut early = Vec::new();
    timeout(SHORT, async {
        while offer.is_none() || early.is_empty() {
            match held_rx.recv().await.expect("offerer signaling closed") {
                msg @ SignalMessage::WebrtcOffer { .. } => offer = Some(msg),
                msg => early.push(msg),
            }
        }
    })
    .await
    .expect("no offer or candidate gathered");
    let offer = offer.unwrap();

    for candidate in early {
        a_tx.send(candidate).unwrap();
    }
    a_tx.send(offer.clone()).unwrap();
    a_tx.send(offer).unwrap();

    let mut answers = 0;
    timeout(CONNECT_TIMEOUT, async {
        loop {
            tokio::select! {
                Some(msg) = held_rx.recv() => a_tx.send(msg).unwrap(),
                Some(msg) = a_rx.recv() => match msg {
                    SignalMessage::WebrtcAnswer { sdp, .. } => {
                        answers += 1;
                        if answers == 1 {
                            offerer.accept_answer(sdp).await.unwrap();
                        }
                    }
                    SignalMessage::WebrtcIceCandidate { candidate, .. } => {
                        let _ = offerer.add_remote_candidate(candidate).await;
                    }
                    _ => {}
                },
                Some(event) = offerer_events.recv() => {
                    let _ = offerer.handle_event(event).await;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            if b.status() == CallStatus::Connected && offerer.status() == CallStatus::Connected {
                break;
            }
        }
    })
    .await
    .expect("answerer never connected");

    // anything still in flight from the repeated offer
    let _ = timeout(Duration::from_millis(500), async {
        while let Some(msg) = a_rx.recv().await {
            if matches!(msg, SignalMessage::WebrtcAnswer { .. }) {
                answers += 1;
            }
        }
    })
    .await;

    assert_eq!(answers, 1);
    assert_eq!(b.status(), CallStatus::Connected);

    let summary = b.end().await.unwrap();
    assert_eq!(summary.role, Some(Role::Answerer));
    assert_eq!(summary.counterpart.as_deref(), Some("a1"));
    offerer.close().await;
}
