//! Multi-Stream Detector (component E): one singleton worker that
//! round-robin micro-batches frames from every active camera through the
//! shared inference engine and publishes per-frame detections.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bus::{EventBus, Mode};
use crate::model::{Detection, Frame, Message, TOPIC_ACCIDENT, TOPIC_FRAMES};

use super::engine::InferenceEngine;

const BUFFER_CAPACITY: usize = 128;
const COLLECTOR_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

struct CameraState {
    buffer: Arc<Mutex<VecDeque<Frame>>>,
    collector: JoinHandle<()>,
}

/// Singleton across all cameras. `join`/`leave` mutate the active set
/// without restarting the engine or the round-robin loop.
pub struct MultiStreamDetector {
    bus: Arc<EventBus>,
    engine: InferenceEngine,
    state: Mutex<IndexMap<String, CameraState>>,
    batch_size: usize,
    poll_ms: u64,
    decision_threshold: f32,
    stopped: Arc<AtomicBool>,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MultiStreamDetector {
    pub fn start(
        bus: Arc<EventBus>,
        engine: InferenceEngine,
        batch_size: usize,
        poll_ms: u64,
        decision_threshold: f32,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            bus,
            engine,
            state: Mutex::new(IndexMap::new()),
            batch_size,
            poll_ms,
            decision_threshold,
            stopped: Arc::new(AtomicBool::new(false)),
            main_loop: Mutex::new(None),
        });
        let loop_handle = {
            let this = this.clone();
            tokio::spawn(async move { this.run_main_loop().await })
        };
        *this.main_loop.lock() = Some(loop_handle);
        this
    }

    /// Adds `camera_id` to the active set and starts its collector task.
    /// A no-op if the camera is already joined.
    pub fn join(self: &Arc<Self>, camera_id: &str) {
        let mut state = self.state.lock();
        if state.contains_key(camera_id) {
            return;
        }
        let buffer: Arc<Mutex<VecDeque<Frame>>> = Arc::new(Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)));
        let collector = spawn_collector(self.bus.clone(), camera_id.to_string(), buffer.clone());
        state.insert(camera_id.to_string(), CameraState { buffer, collector });
    }

    /// Removes `camera_id` from the active set and cancels its collector.
    /// In-flight batches the main loop already pulled this camera's frames
    /// into are allowed to complete.
    pub fn leave(&self, camera_id: &str) {
        let mut state = self.state.lock();
        if let Some(cam_state) = state.shift_remove(camera_id) {
            cam_state.collector.abort();
        }
    }

    async fn run_main_loop(self: Arc<Self>) {
        while !self.stopped.load(Ordering::Acquire) {
            let camera_ids: Vec<String> = self.state.lock().keys().cloned().collect();
            let batch = self.collect_batch(&camera_ids);

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(self.poll_ms)).await;
                continue;
            }

            let images = batch.iter().map(|f| f.pixels.clone()).collect();
            match self.engine.infer_batch(images).await {
                Ok(scores) => self.publish_detections(batch, scores),
                Err(e) => warn!(error = %e, "inference batch failed, dropping batch"),
            }
        }
    }

    /// One round-robin pass: take at most one frame per camera per lap,
    /// repeating laps until `batch_size` is reached or every buffer ran dry.
    fn collect_batch(&self, camera_ids: &[String]) -> Vec<Frame> {
        let mut batch = Vec::new();
        let mut progressed = true;
        while batch.len() < self.batch_size && progressed {
            progressed = false;
            for cam in camera_ids {
                if batch.len() >= self.batch_size {
                    break;
                }
                let frame = {
                    let state = self.state.lock();
                    state.get(cam).and_then(|cs| cs.buffer.lock().pop_front())
                };
                if let Some(frame) = frame {
                    batch.push(frame);
                    progressed = true;
                }
            }
        }
        batch
    }

    fn publish_detections(&self, batch: Vec<Frame>, scores: Vec<f32>) {
        for (frame, confidence) in batch.into_iter().zip(scores) {
            let detection = Detection {
                kind: Detection::TYPE,
                camera_id: frame.camera_id.clone(),
                wall_ts: frame.wall_ts,
                frame_idx: frame.frame_idx,
                source_pts: frame.source_pts,
                vts: frame.vts,
                confidence,
                happened: confidence >= self.decision_threshold,
            };
            self.bus
                .publish_partitioned(TOPIC_ACCIDENT, &detection.camera_id.clone(), Message::Detection(detection));
        }
    }

    /// Stops the round-robin loop and every collector task. The engine
    /// itself outlives this call; callers shut it down separately.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.main_loop.lock().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        for (_, cam_state) in state.drain(..) {
            cam_state.collector.abort();
        }
    }
}

fn spawn_collector(bus: Arc<EventBus>, camera_id: String, buffer: Arc<Mutex<VecDeque<Frame>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (sub, _guard) = bus.subscribe(&format!("{TOPIC_FRAMES}:{camera_id}"), Mode::Fifo, 64);
        loop {
            match sub.recv_timeout(COLLECTOR_IDLE_TIMEOUT).await {
                Ok(Some(Message::FrameSampled(frame))) => {
                    let mut buf = buffer.lock();
                    if buf.len() >= BUFFER_CAPACITY {
                        buf.pop_front();
                    }
                    buf.push_back(frame);
                }
                Ok(Some(Message::Eos)) => break,
                Ok(Some(_)) | Ok(None) => continue,
                Err(()) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::engine::DetectionModel;
    use image::RgbImage;
    use tokio::time::{sleep, Duration as TokioDuration};

    struct FixedModel(f32);
    impl DetectionModel for FixedModel {
        fn infer_batch(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<f32>, crate::error::AppError> {
            Ok(images.iter().map(|_| self.0).collect())
        }
    }

    #[tokio::test]
    async fn publishes_a_detection_per_joined_camera_frame() {
        let bus = Arc::new(EventBus::new());
        let engine = InferenceEngine::spawn(FixedModel(0.9));
        let detector = MultiStreamDetector::start(bus.clone(), engine, 4, 5, 0.5);
        detector.join("cam-1");

        let (det_sub, _guard) = bus.subscribe("accident:cam-1", Mode::Fifo, 16);

        bus.publish_partitioned(
            TOPIC_FRAMES,
            "cam-1",
            Message::FrameSampled(Frame {
                camera_id: "cam-1".to_string(),
                wall_ts: 0.0,
                pixels: Arc::new(RgbImage::new(4, 4)),
                frame_idx: 0,
                source_pts: 0.0,
                vts: 0.0,
            }),
        );

        sleep(TokioDuration::from_millis(100)).await;
        let item = det_sub.recv_timeout(TokioDuration::from_millis(200)).await;
        match item {
            Ok(Some(Message::Detection(d))) => {
                assert_eq!(d.camera_id, "cam-1");
                assert!(d.happened);
            }
            other => panic!("expected a detection, got {other:?}"),
        }

        detector.stop();
    }
}
