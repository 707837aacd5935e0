//! Session Coordinator (component G): starts and stops the per-camera
//! pipeline (frame source, resampler, aggregator) and keeps the shared
//! detector's active-camera set in sync, without ever restarting the
//! detector itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::aggregator::AggregatorHandle;
use crate::bus::EventBus;
use crate::config::AggregatorConfig;
use crate::error::AppError;
use crate::pipeline::detector::MultiStreamDetector;
use crate::pipeline::resampler::run_resampler;
use crate::pipeline::source::{open_frame_source, run_opened_frame_source};

/// How long to wait after cancelling the resampler before flushing, so
/// frames already in flight through the detector and into the aggregator
/// have a chance to land.
const DRAIN_INTERVAL: Duration = Duration::from_millis(800);

pub struct CameraSession {
    camera_id: String,
    source_task: JoinHandle<Result<(), AppError>>,
    resampler_task: JoinHandle<()>,
    aggregator: AggregatorHandle,
}

pub struct SessionCoordinator {
    bus: Arc<EventBus>,
    detector: Arc<MultiStreamDetector>,
}

impl SessionCoordinator {
    pub fn new(bus: Arc<EventBus>, detector: Arc<MultiStreamDetector>) -> Self {
        Self { bus, detector }
    }

    /// Opens the frame source for one camera, then -- only once that
    /// succeeds -- starts B's run loop, C, and F in parallel and joins the
    /// camera onto the shared detector's active set. A `FatalInit` failure
    /// opening the source is returned directly: no session is created and
    /// nothing is spawned, so the caller sees the failure synchronously
    /// instead of discovering a dead `source_task` later at shutdown.
    pub async fn start_camera(
        &self,
        camera_id: String,
        source: String,
        simulate_realtime: bool,
        target_fps: f64,
        session_id: String,
        agg_params: AggregatorConfig,
    ) -> Result<CameraSession, AppError> {
        let (pipeline, appsink) = open_frame_source(camera_id.clone(), source.clone()).await?;

        let source_task = tokio::spawn(run_opened_frame_source(
            self.bus.clone(),
            camera_id.clone(),
            pipeline,
            appsink,
            source,
            simulate_realtime,
        ));
        let resampler_task = tokio::spawn(run_resampler(self.bus.clone(), camera_id.clone(), target_fps));
        let aggregator = AggregatorHandle::spawn(self.bus.clone(), camera_id.clone(), session_id, agg_params);

        self.detector.join(&camera_id);

        Ok(CameraSession {
            camera_id,
            source_task,
            resampler_task,
            aggregator,
        })
    }

    /// Runs the full per-camera shutdown sequence: await source
    /// completion, cancel the resampler, wait out the drain interval,
    /// flush the aggregator, cancel it, then leave the detector's active
    /// set.
    pub async fn stop_camera(&self, session: CameraSession) {
        match session.source_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(camera_id = %session.camera_id, error = %e, "frame source failed");
            }
            Err(e) => {
                warn!(camera_id = %session.camera_id, error = %e, "frame source task panicked");
            }
        }
        session.resampler_task.abort();
        tokio::time::sleep(DRAIN_INTERVAL).await;
        session.aggregator.flush(&self.bus);
        session.aggregator.cancel();
        self.detector.leave(&session.camera_id);
    }

    /// Applies the per-camera shutdown sequence to every session, then
    /// stops the detector.
    pub async fn stop_all(&self, sessions: Vec<CameraSession>) {
        for session in sessions {
            self.stop_camera(session).await;
        }
        self.detector.stop();
    }
}
