use crate::device::FacingMode;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const TRACK_FRAMES_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl Display for TrackKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl TrackCodec {
    pub fn opus() -> Self {
        Self {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 2,
        }
    }

    pub fn vp8() -> Self {
        Self {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: 0,
        }
    }
}

/// One encoded frame produced by a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// A local capture track, shared by `Arc` between the media source and every peer session.
///
/// Toggling `enabled` happens in place and never requires renegotiation: a disabled track keeps
/// running but frames are not forwarded to subscribers.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    codec: TrackCodec,
    device_id: Option<String>,
    facing: Option<FacingMode>,
    enabled: AtomicBool,
    frames_tx: broadcast::Sender<MediaFrame>,
    last_frame: Mutex<Option<MediaFrame>>,
    stop_token: CancellationToken,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        codec: TrackCodec,
        device_id: Option<String>,
        facing: Option<FacingMode>,
    ) -> Arc<Self> {
        let (frames_tx, _) = broadcast::channel(TRACK_FRAMES_CAPACITY);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            codec,
            device_id,
            facing,
            enabled: AtomicBool::new(true),
            frames_tx,
            last_frame: Mutex::new(None),
            stop_token: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[inline]
    pub fn codec(&self) -> &TrackCodec {
        &self.codec
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns whether the value changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::AcqRel) != enabled
    }

    pub fn is_live(&self) -> bool {
        !self.stop_token.is_cancelled()
    }

    /// Called by the capture device for every produced frame.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.is_live() || !self.is_enabled() {
            return false;
        }
        *self.last_frame.lock() = Some(frame.clone());
        // No subscribers is fine, the track is simply not attached to any session yet.
        let _ = self.frames_tx.send(frame);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames_tx.subscribe()
    }

    pub fn last_frame(&self) -> Option<MediaFrame> {
        self.last_frame.lock().clone()
    }

    /// Stops the track permanently, releasing the capture device.
    pub fn stop(&self) {
        if self.is_live() {
            tracing::trace!(track_id = ?self.id, kind = %self.kind, "Stopping local track");
            self.stop_token.cancel();
        }
    }

    pub async fn ended(&self) {
        self.stop_token.cancelled().await;
    }
}
