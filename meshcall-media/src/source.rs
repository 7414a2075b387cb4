use crate::device::{CameraDevice, CaptureBackend, FacingMode, MediaConstraints, VideoConstraints};
use crate::error::{CameraSwitchFailure, MediaError};
use crate::track::{LocalTrack, MediaFrame, TrackKind};
use crate::MEDIA_EVENTS_CAPACITY;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A track ended without being stopped by the source, e.g. the device was unplugged.
    TrackEnded { kind: TrackKind, track_id: String },
    MuteChanged(bool),
    CameraOffChanged(bool),
    CameraSwitched {
        facing_mode: FacingMode,
        device_id: Option<String>,
    },
    /// A camera switch stopped the previous track but could not acquire a new one.
    VideoLost,
}

/// Receives a freshly acquired video track to put on every active outbound connection.
#[async_trait]
pub trait OutboundVideo: Send + Sync {
    /// Replaces the outbound video track in place, returning the number of updated connections.
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> usize;
}

#[derive(Debug, Clone)]
pub struct LocalMediaState {
    pub audio_track: Option<Arc<LocalTrack>>,
    pub video_track: Option<Arc<LocalTrack>>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub active_camera_device_id: Option<String>,
    pub facing_mode: FacingMode,
    pub available_cameras: Vec<CameraDevice>,
    /// Last frame shown before the camera was turned off.
    pub still_frame: Option<MediaFrame>,
}

/// The local participant's capture state for the lifetime of a room session.
pub struct LocalMediaSource {
    backend: Arc<dyn CaptureBackend>,
    state: RwLock<LocalMediaState>,
    switch_lock: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<MediaEvent>,
    switch_grace: Duration,
    /// Tracks stopped by a camera switch, whose end is not reported.
    retired_tracks: Mutex<HashSet<String>>,
    stop_token: CancellationToken,
}

impl LocalMediaSource {
    #[instrument(level = "info", skip(backend), err)]
    pub async fn acquire(
        backend: Arc<dyn CaptureBackend>,
        constraints: MediaConstraints,
        switch_grace: Duration,
    ) -> Result<Arc<Self>, MediaError> {
        let available_cameras = match backend.enumerate_cameras().await {
            Ok(cameras) => {
                tracing::debug!(count = cameras.len(), "Enumerated cameras");
                cameras
            }
            Err(err) => {
                tracing::warn!(?err, "Failed to enumerate cameras");
                Vec::new()
            }
        };

        let audio_track = if constraints.audio {
            Some(backend.open_audio().await?)
        } else {
            None
        };

        let video_track = if constraints.video {
            match backend
                .open_video(&VideoConstraints::Facing(constraints.facing_mode))
                .await
            {
                Ok(track) => Some(track),
                Err(err) => {
                    if let Some(audio) = &audio_track {
                        audio.stop();
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let state = LocalMediaState {
            active_camera_device_id: video_track
                .as_ref()
                .and_then(|t| t.device_id().map(str::to_string)),
            facing_mode: video_track
                .as_ref()
                .and_then(|t| t.facing())
                .unwrap_or(constraints.facing_mode),
            audio_track,
            video_track,
            audio_enabled: true,
            video_enabled: true,
            available_cameras,
            still_frame: None,
        };

        let (events_tx, _) = broadcast::channel(MEDIA_EVENTS_CAPACITY);
        let source = Arc::new(Self {
            backend,
            state: RwLock::new(state),
            switch_lock: tokio::sync::Mutex::new(()),
            events_tx,
            switch_grace,
            retired_tracks: Mutex::new(HashSet::new()),
            stop_token: CancellationToken::new(),
        });

        for track in source.local_tracks() {
            source.watch_track(track);
        }

        tracing::info!("Local media acquired");
        Ok(source)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> LocalMediaState {
        self.state.read().clone()
    }

    pub fn audio_track(&self) -> Option<Arc<LocalTrack>> {
        self.state.read().audio_track.clone()
    }

    pub fn video_track(&self) -> Option<Arc<LocalTrack>> {
        self.state.read().video_track.clone()
    }

    /// All current tracks, audio first.
    pub fn local_tracks(&self) -> Vec<Arc<LocalTrack>> {
        let state = self.state.read();
        state
            .audio_track
            .iter()
            .chain(state.video_track.iter())
            .cloned()
            .collect()
    }

    pub fn is_muted(&self) -> bool {
        !self.state.read().audio_enabled
    }

    pub fn is_camera_off(&self) -> bool {
        !self.state.read().video_enabled
    }

    pub fn facing_mode(&self) -> FacingMode {
        self.state.read().facing_mode
    }

    pub fn still_frame(&self) -> Option<MediaFrame> {
        self.state.read().still_frame.clone()
    }

    pub fn set_muted(&self, muted: bool) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.audio_enabled == muted;
            state.audio_enabled = !muted;
            if let Some(track) = &state.audio_track {
                track.set_enabled(!muted);
            }
            changed
        };
        if changed {
            tracing::debug!(?muted, "Microphone toggled");
            let _ = self.events_tx.send(MediaEvent::MuteChanged(muted));
        }
    }

    pub fn set_camera_off(&self, off: bool) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.video_enabled == off;
            state.video_enabled = !off;
            if let Some(track) = state.video_track.clone() {
                if off && changed {
                    state.still_frame = track.last_frame();
                }
                track.set_enabled(!off);
            }
            if !off {
                state.still_frame = None;
            }
            changed
        };
        if changed {
            tracing::debug!(?off, "Camera toggled");
            let _ = self.events_tx.send(MediaEvent::CameraOffChanged(off));
        }
    }

    /// Switches to another camera, by default the one facing the opposite direction.
    ///
    /// All pre-checks run before the current track is touched. Once it has been stopped, failing to
    /// acquire a replacement leaves the source with a dead video track; see
    /// [`Self::reacquire_video`].
    #[instrument(level = "info", skip(self, outbound), err)]
    pub async fn switch_camera(
        self: &Arc<Self>,
        requested: Option<FacingMode>,
        outbound: &dyn OutboundVideo,
    ) -> Result<FacingMode, MediaError> {
        let _guard = self
            .switch_lock
            .try_lock()
            .map_err(|_| CameraSwitchFailure::InProgress)?;

        let (old_track, target) = {
            let state = self.state.read();
            if !state.video_enabled {
                return Err(CameraSwitchFailure::CameraOff.into());
            }
            if state.available_cameras.len() < 2 {
                return Err(CameraSwitchFailure::SingleCamera.into());
            }
            let Some(old_track) = state.video_track.clone().filter(|t| t.is_live()) else {
                return Err(CameraSwitchFailure::NoVideoTrack.into());
            };
            (
                old_track,
                requested.unwrap_or_else(|| state.facing_mode.opposite()),
            )
        };

        // The device must be released before it can be opened again. The stopped track stays in
        // place until a replacement is installed, so sessions created meanwhile still get a video
        // sender to replace.
        self.retired_tracks.lock().insert(old_track.id().to_string());
        old_track.stop();
        tokio::time::sleep(self.switch_grace).await;

        let result = match self
            .backend
            .open_video(&VideoConstraints::Facing(target))
            .await
        {
            Ok(track) => Ok(track),
            Err(err) => {
                tracing::warn!(?err, "Opening camera by facing mode failed, trying device ID");
                let other_camera = self
                    .state
                    .read()
                    .available_cameras
                    .iter()
                    .find(|camera| Some(camera.device_id.as_str()) != old_track.device_id())
                    .map(|camera| camera.device_id.clone());
                match other_camera {
                    Some(device_id) => {
                        self.backend
                            .open_video(&VideoConstraints::Device(device_id))
                            .await
                    }
                    None => Err(err),
                }
            }
        };

        let track = match result {
            Ok(track) => track,
            Err(err) => {
                tracing::warn!(?err, "Failed to acquire new camera, local video lost");
                self.state.write().active_camera_device_id = None;
                let _ = self.events_tx.send(MediaEvent::VideoLost);
                return Err(CameraSwitchFailure::Acquisition {
                    reason: err.to_string(),
                    video_lost: true,
                }
                .into());
            }
        };

        let facing_mode = track.facing().unwrap_or(target);
        let device_id = track.device_id().map(str::to_string);
        self.install_video_track(Arc::clone(&track), facing_mode);

        let replaced = outbound.replace_video_track(track).await;
        tracing::info!(%facing_mode, ?device_id, ?replaced, "Camera switched");
        let _ = self.events_tx.send(MediaEvent::CameraSwitched {
            facing_mode,
            device_id,
        });
        Ok(facing_mode)
    }

    /// Acquires a new video track after it was lost, using the last known facing mode.
    ///
    /// Does nothing if a live video track exists.
    #[instrument(level = "info", skip(self, outbound), err)]
    pub async fn reacquire_video(
        self: &Arc<Self>,
        outbound: &dyn OutboundVideo,
    ) -> Result<(), MediaError> {
        let _guard = self
            .switch_lock
            .try_lock()
            .map_err(|_| CameraSwitchFailure::InProgress)?;

        let facing_mode = {
            let state = self.state.read();
            if state.video_track.as_ref().is_some_and(|t| t.is_live()) {
                tracing::debug!("Video track still live, nothing to reacquire");
                return Ok(());
            }
            state.facing_mode
        };

        let track = self
            .backend
            .open_video(&VideoConstraints::Facing(facing_mode))
            .await?;
        let facing_mode = track.facing().unwrap_or(facing_mode);
        self.install_video_track(Arc::clone(&track), facing_mode);

        let replaced = outbound.replace_video_track(track).await;
        tracing::info!(?replaced, "Video reacquired");
        Ok(())
    }

    /// Stops every local track. The source cannot be used afterwards.
    #[instrument(level = "debug", skip(self))]
    pub fn stop(&self) {
        self.stop_token.cancel();
        let tracks = {
            let mut state = self.state.write();
            [state.audio_track.take(), state.video_track.take()]
        };
        for track in tracks.into_iter().flatten() {
            track.stop();
        }
        tracing::debug!("Local media stopped");
    }

    fn install_video_track(self: &Arc<Self>, track: Arc<LocalTrack>, facing_mode: FacingMode) {
        {
            let mut state = self.state.write();
            track.set_enabled(state.video_enabled);
            state.active_camera_device_id = track.device_id().map(str::to_string);
            state.facing_mode = facing_mode;
            state.video_track = Some(Arc::clone(&track));
        }
        self.watch_track(track);
    }

    fn watch_track(self: &Arc<Self>, track: Arc<LocalTrack>) {
        let source: Weak<Self> = Arc::downgrade(self);
        let stop_token = self.stop_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop_token.cancelled() => {}
                _ = track.ended() => {
                    if let Some(source) = source.upgrade() {
                        source.on_track_ended(&track);
                    }
                }
            }
        });
    }

    fn on_track_ended(&self, track: &LocalTrack) {
        if self.retired_tracks.lock().remove(track.id()) {
            tracing::trace!(track_id = ?track.id(), "Retired track ended");
            return;
        }

        let ended = {
            let mut state = self.state.write();
            let slot = match track.kind() {
                TrackKind::Audio => &mut state.audio_track,
                TrackKind::Video => &mut state.video_track,
            };
            if slot.as_ref().is_some_and(|t| t.id() == track.id()) {
                slot.take();
                true
            } else {
                false
            }
        };

        if ended {
            tracing::warn!(track_id = ?track.id(), kind = %track.kind(), "Local track ended");
            let _ = self.events_tx.send(MediaEvent::TrackEnded {
                kind: track.kind(),
                track_id: track.id().to_string(),
            });
        }
    }
}

impl Drop for LocalMediaSource {
    fn drop(&mut self) {
        self.stop();
    }
}
