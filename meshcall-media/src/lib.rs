mod device;
pub mod error;
pub mod source;
pub mod synthetic;
mod track;

pub use device::{CameraDevice, CaptureBackend, FacingMode, MediaConstraints, VideoConstraints};
pub use error::{CameraSwitchFailure, MediaError};
pub use source::{LocalMediaSource, LocalMediaState, MediaEvent, OutboundVideo};
pub use track::{LocalTrack, MediaFrame, TrackCodec, TrackKind};

use std::time::Duration;

pub const FRAME_DURATION_MS: u64 = 20;
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_DURATION_MS);
pub const DEFAULT_SWITCH_GRACE: Duration = Duration::from_millis(100);
pub const MEDIA_EVENTS_CAPACITY: usize = 32;
