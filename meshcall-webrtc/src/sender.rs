use anyhow::{Context, Result};
use meshcall_media::{LocalTrack, TrackKind};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, instrument};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Pumps the frames of a [`LocalTrack`] into an outbound RTP track.
pub struct Sender {
    track_id: String,
    kind: TrackKind,
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl Sender {
    #[instrument(level = "trace", skip_all, fields(track_id = %local.id(), kind = %local.kind()))]
    pub fn new(track: Arc<TrackLocalStaticSample>, local: Arc<LocalTrack>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let mut frames_rx = local.subscribe();
        let track_id = local.id().to_string();
        let kind = local.kind();

        let task = tokio::runtime::Handle::current().spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping sending");
                            break;
                        }
                        _ = local.ended() => {
                            tracing::trace!("Local track ended, stopping sending");
                            break;
                        }
                        frame = frames_rx.recv() => {
                            match frame {
                                Ok(frame) => {
                                    let sample = Sample {
                                        data: frame.data,
                                        duration: frame.duration,
                                        ..Default::default()
                                    };

                                    if let Err(err) = track.write_sample(&sample).await {
                                        tracing::warn!(?err, "Failed to write sample to track");
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    tracing::trace!(?skipped, "Sender lagged behind, skipping frames");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );

        Self {
            track_id,
            kind,
            shutdown_tx,
            task,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        tracing::trace!("Waiting for sender task to finish");
        self.task.await.context("Failed to join sender task")
    }
}
