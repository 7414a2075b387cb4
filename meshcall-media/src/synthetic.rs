//! Headless capture backend generating placeholder frames, used by the binary and in tests.

use crate::FRAME_DURATION;
use crate::device::{CameraDevice, CaptureBackend, FacingMode, VideoConstraints};
use crate::error::MediaError;
use crate::track::{LocalTrack, MediaFrame, TrackCodec, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Opus encoding of a 20ms silence frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Default)]
struct SyntheticShared {
    failing_video_opens: AtomicUsize,
    opened: Mutex<Vec<Arc<LocalTrack>>>,
}

#[derive(Clone)]
pub struct SyntheticBackend {
    cameras: Vec<CameraDevice>,
    capture_available: bool,
    permission_denied: bool,
    facing_mode_supported: bool,
    enumeration_fails: bool,
    shared: Arc<SyntheticShared>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            cameras: vec![
                CameraDevice {
                    device_id: "synthetic-front".to_string(),
                    label: "Synthetic front camera".to_string(),
                    facing: Some(FacingMode::User),
                },
                CameraDevice {
                    device_id: "synthetic-back".to_string(),
                    label: "Synthetic back camera".to_string(),
                    facing: Some(FacingMode::Environment),
                },
            ],
            capture_available: true,
            permission_denied: false,
            facing_mode_supported: true,
            enumeration_fails: false,
            shared: Arc::new(SyntheticShared::default()),
        }
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(mut self, cameras: Vec<CameraDevice>) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn single_camera() -> Self {
        let backend = Self::default();
        let cameras = backend.cameras[..1].to_vec();
        backend.with_cameras(cameras)
    }

    /// Capture is not supported at all, as in an insecure context.
    pub fn unavailable(mut self) -> Self {
        self.capture_available = false;
        self
    }

    pub fn permission_denied(mut self) -> Self {
        self.permission_denied = true;
        self
    }

    /// Selecting a camera by facing mode fails, only explicit device selection works.
    pub fn without_facing_mode(mut self) -> Self {
        self.facing_mode_supported = false;
        self
    }

    pub fn failing_enumeration(mut self) -> Self {
        self.enumeration_fails = true;
        self
    }

    /// Makes the next `count` video opens fail, regardless of constraints.
    pub fn fail_next_video_opens(&self, count: usize) {
        self.shared
            .failing_video_opens
            .store(count, Ordering::Release);
    }

    pub fn opened_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.shared.opened.lock().clone()
    }

    pub fn live_tracks(&self, kind: TrackKind) -> usize {
        self.shared
            .opened
            .lock()
            .iter()
            .filter(|track| track.kind() == kind && track.is_live())
            .count()
    }

    fn check_access(&self) -> Result<(), MediaError> {
        if !self.capture_available {
            return Err(MediaError::MediaUnavailable(
                "no capture devices can be used in this context".to_string(),
            ));
        }
        if self.permission_denied {
            return Err(MediaError::DevicePermissionDenied);
        }
        Ok(())
    }

    fn start(&self, track: Arc<LocalTrack>, payload: impl Fn(u64) -> Bytes + Send + 'static) {
        self.shared.opened.lock().push(Arc::clone(&track));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_DURATION);
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = track.ended() => break,
                    _ = interval.tick() => {
                        track.push_frame(MediaFrame {
                            data: payload(seq),
                            duration: FRAME_DURATION,
                        });
                        seq = seq.wrapping_add(1);
                    }
                }
            }
            tracing::trace!(track_id = ?track.id(), "Synthetic capture stopped");
        });
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    async fn enumerate_cameras(&self) -> Result<Vec<CameraDevice>, MediaError> {
        if self.enumeration_fails {
            return Err(MediaError::Other(anyhow::anyhow!(
                "device enumeration not supported"
            )));
        }
        Ok(self.cameras.clone())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn open_audio(&self) -> Result<Arc<LocalTrack>, MediaError> {
        self.check_access()?;
        let track = LocalTrack::new(
            TrackKind::Audio,
            TrackCodec::opus(),
            Some("synthetic-microphone".to_string()),
            None,
        );
        self.start(Arc::clone(&track), |_| Bytes::from_static(&OPUS_SILENCE));
        Ok(track)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn open_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Arc<LocalTrack>, MediaError> {
        self.check_access()?;

        let failing = self.shared.failing_video_opens.load(Ordering::Acquire);
        if failing > 0 {
            self.shared
                .failing_video_opens
                .store(failing - 1, Ordering::Release);
            return Err(MediaError::DeviceNotFound(
                "could not start video source".to_string(),
            ));
        }

        let camera = match constraints {
            VideoConstraints::Facing(_) if !self.facing_mode_supported => {
                return Err(MediaError::DeviceNotFound(
                    "facing mode constraint not supported".to_string(),
                ));
            }
            // Facing mode is a soft constraint, any camera satisfies it if none matches.
            VideoConstraints::Facing(mode) => self
                .cameras
                .iter()
                .find(|camera| camera.facing == Some(*mode))
                .or_else(|| self.cameras.first()),
            VideoConstraints::Device(device_id) => self
                .cameras
                .iter()
                .find(|camera| &camera.device_id == device_id),
        }
        .cloned()
        .ok_or_else(|| MediaError::DeviceNotFound(format!("{constraints:?}")))?;

        let track = LocalTrack::new(
            TrackKind::Video,
            TrackCodec::vp8(),
            Some(camera.device_id.clone()),
            camera.facing,
        );
        let device_id = camera.device_id;
        self.start(Arc::clone(&track), move |seq| {
            Bytes::from(format!("{device_id}:{seq}"))
        });
        Ok(track)
    }
}
