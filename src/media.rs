use crate::config::MediaConstraints;
use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(value: RTPCodecType) -> Self {
        match value {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

impl From<TrackKind> for RTPCodecType {
    fn from(value: TrackKind) -> Self {
        match value {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        }
    }
}

/// Outgoing media track produced by a local capture device.
///
/// Clones share the same underlying track and the same enabled flag. Disabling a track keeps it
/// attached to every peer connection but drops the samples written into it.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        LocalTrack {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates an Opus encoded audio track.
    pub fn audio(id: &str, stream_id: &str) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        };
        let track = TrackLocalStaticSample::new(codec, id.to_owned(), stream_id.to_owned());
        Self::new(TrackKind::Audio, Arc::new(track))
    }

    /// Creates a VP8 encoded video track.
    pub fn video(id: &str, stream_id: &str) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        };
        let track = TrackLocalStaticSample::new(codec, id.to_owned(), stream_id.to_owned());
        Self::new(TrackKind::Video, Arc::new(track))
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Checks if both handles refer to the same underlying track.
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }

    /// Writes an encoded media frame. Returns `false` when the frame was dropped because the track
    /// is disabled.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<bool, Error> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track.write_sample(&sample).await?;
        Ok(true)
    }

    pub fn rtp(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Set of tracks produced by a single capture, ie. camera + microphone or a screen.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: Arc<str>,
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    fn stop(&self) {
        for track in self.tracks() {
            track.set_enabled(false);
        }
    }
}

/// Track received from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub stream_id: Arc<str>,
    pub track_id: Arc<str>,
    pub kind: TrackKind,
    rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(stream_id: &str, track_id: &str, kind: TrackKind) -> Self {
        RemoteTrack {
            stream_id: Arc::from(stream_id),
            track_id: Arc::from(track_id),
            kind,
            rtp: None,
        }
    }

    pub(crate) fn from_rtp(track: Arc<TrackRemote>) -> Self {
        let stream_id = track.stream_id().to_string();
        let track_id = track.id().to_string();
        let kind = TrackKind::from(track.kind());
        RemoteTrack {
            stream_id: Arc::from(stream_id),
            track_id: Arc::from(track_id),
            kind,
            rtp: Some(track),
        }
    }

    /// Underlying RTP track, used by the renderer to read incoming packets.
    pub fn rtp(&self) -> Option<&Arc<TrackRemote>> {
        self.rtp.as_ref()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Capture device access. Implemented by the embedding application.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquires camera and microphone. Fails with [Error::MediaAccessDenied] when permission was
    /// not granted.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, Error>;

    /// Acquires a screen capture. Fails with [Error::UserCancelled] when the user dismissed the
    /// picker.
    async fn acquire_screen(&self) -> Result<LocalStream, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaSnapshot {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub camera_ready: bool,
}

#[derive(Debug, Clone)]
pub struct LocalMediaState {
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl LocalMediaState {
    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Video track currently sent to peers: screen capture while sharing, camera otherwise.
    pub fn outgoing_video(&self) -> Option<&LocalTrack> {
        match &self.screen {
            Some(screen) => screen.video.as_ref(),
            None => self.camera.as_ref().and_then(|c| c.video.as_ref()),
        }
    }

    pub fn outgoing_audio(&self) -> Option<&LocalTrack> {
        self.camera.as_ref().and_then(|c| c.audio.as_ref())
    }

    /// Tracks a newly created peer connection should be seeded with.
    pub fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        self.outgoing_audio()
            .into_iter()
            .chain(self.outgoing_video())
            .cloned()
            .collect()
    }
}

/// Owner of the local capture streams. The only place where [LocalMediaState] is mutated.
#[derive(Debug)]
pub struct LocalMedia {
    state: LocalMediaState,
    screen_pending: bool,
}

impl LocalMedia {
    pub fn new() -> Self {
        LocalMedia {
            state: LocalMediaState {
                camera: None,
                screen: None,
                audio_enabled: true,
                video_enabled: true,
            },
            screen_pending: false,
        }
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub fn snapshot(&self) -> LocalMediaSnapshot {
        LocalMediaSnapshot {
            audio_enabled: self.state.audio_enabled,
            video_enabled: self.state.video_enabled,
            screen_sharing: self.state.is_screen_sharing(),
            camera_ready: self.state.camera.is_some(),
        }
    }

    /// Installs a freshly acquired camera stream, applying current enabled flags to it. Returns
    /// tracks which should be attached to already existing sessions.
    pub fn set_camera(&mut self, stream: LocalStream) -> Vec<LocalTrack> {
        if let Some(audio) = &stream.audio {
            audio.set_enabled(self.state.audio_enabled);
        }
        if let Some(video) = &stream.video {
            video.set_enabled(self.state.video_enabled);
        }
        if let Some(old) = self.state.camera.replace(stream) {
            old.stop();
        }
        self.state.outgoing_tracks()
    }

    pub fn toggle_audio(&mut self) -> bool {
        self.state.audio_enabled = !self.state.audio_enabled;
        if let Some(audio) = self.state.outgoing_audio() {
            audio.set_enabled(self.state.audio_enabled);
        }
        self.state.audio_enabled
    }

    /// Toggles the camera track. Screen capture (if any) is not affected.
    pub fn toggle_video(&mut self) -> bool {
        self.state.video_enabled = !self.state.video_enabled;
        if let Some(video) = self.state.camera.as_ref().and_then(|c| c.video.as_ref()) {
            video.set_enabled(self.state.video_enabled);
        }
        self.state.video_enabled
    }

    /// Marks that screen capture acquisition is in flight. Returns `false` if it already was.
    pub fn begin_screen_share(&mut self) -> bool {
        if self.screen_pending || self.state.is_screen_sharing() {
            false
        } else {
            self.screen_pending = true;
            true
        }
    }

    /// Completes a screen share request. Returns the new outgoing video track if sharing started.
    pub fn finish_screen_share(&mut self, result: Result<LocalStream, Error>) -> Result<Option<LocalTrack>, Error> {
        self.screen_pending = false;
        let stream = result?;
        if stream.video.is_none() {
            stream.stop();
            return Ok(None);
        }
        if let Some(old) = self.state.screen.replace(stream) {
            old.stop();
        }
        Ok(self.state.outgoing_video().cloned())
    }

    /// Stops screen sharing. Returns the camera track which becomes outgoing again, or `None` if
    /// screen was not shared or there's no camera.
    pub fn stop_screen_share(&mut self) -> Option<LocalTrack> {
        let screen = self.state.screen.take()?;
        screen.stop();
        self.state.outgoing_video().cloned()
    }
}

impl LocalMedia {
    /// Stops every capture. Enabled flags are kept.
    pub fn release(&mut self) {
        self.screen_pending = false;
        if let Some(screen) = self.state.screen.take() {
            screen.stop();
        }
        if let Some(camera) = self.state.camera.take() {
            camera.stop();
        }
    }
}

impl Default for LocalMedia {
    fn default() -> Self {
        LocalMedia::new()
    }
}
