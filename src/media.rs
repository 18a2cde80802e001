//! Local media: the camera/microphone stream a call sends.
//!
//! Device capture itself sits behind [`MediaDevices`]; the call flow only
//! needs tracks it can attach to a peer connection and the per-kind
//! `enabled` flags the user controls flip.

use crate::error::CallError;
use crate::utils::random_id;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Opus TOC byte plus padding for a 20 ms silent frame
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

impl TryFrom<RTPCodecType> for TrackKind {
    type Error = ();

    fn try_from(kind: RTPCodecType) -> Result<Self, Self::Error> {
        match kind {
            RTPCodecType::Audio => Ok(TrackKind::Audio),
            RTPCodecType::Video => Ok(TrackKind::Video),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission to use the {0} device was denied")]
    PermissionDenied(TrackKind),

    #[error("no media devices requested")]
    NoDevices,

    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// One local track. `enabled` is the mute / video-off switch; `stopped` is
/// final and set when the call releases its devices.
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            kind.codec(),
            format!("{kind}-{}", random_id()),
            stream_id.to_string(),
        );
        Self {
            kind,
            track: Arc::new(track),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(kind = %self.kind, id = self.id(), "Local track stopped");
        }
    }

    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Writes one media sample. Returns `false` when the sample was dropped
    /// because the track is disabled or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, CallError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.track.write_sample(sample).await?;
        Ok(true)
    }
}

/// Local audio/video stream owned by one call.
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMediaStream {
    pub fn new(constraints: &MediaConstraints) -> Self {
        let id = format!("stream-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio, &id)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video, &id)));
        }
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Returns `false` when the stream has no track of that kind.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        match self.track(kind) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Flips the enabled flag of the `kind` track and returns the new value.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::info!(kind = %kind, enabled, "Local track toggled");
        Some(enabled)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Source of local media for a call.
pub trait MediaDevices: Send + Sync {
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError>;
}

/// Device source without capture hardware: hands out encoder-ready tracks the
/// caller feeds itself (see [`spawn_silence`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticDevices;

impl MediaDevices for SyntheticDevices {
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::NoDevices);
        }
        Ok(LocalMediaStream::new(constraints))
    }
}

/// Feeds 20 ms Opus silence frames into an audio track until it is stopped.
/// Frames written while the track is muted are dropped.
pub fn spawn_silence(track: Arc<LocalTrack>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME_DURATION);
        let sample = Sample {
            data: Bytes::from_static(&OPUS_SILENCE_FRAME),
            duration: OPUS_FRAME_DURATION,
            ..Default::default()
        };
        while !track.is_stopped() {
            ticker.tick().await;
            if let Err(e) = track.write_sample(&sample).await {
                tracing::warn!(error = %e, "Silence pump stopped");
                break;
            }
        }
    })
}
