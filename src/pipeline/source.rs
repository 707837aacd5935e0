//! Frame Source (component B): decodes a media source into a sequence of
//! RGB frames and publishes them onto `frames_raw:{camera_id}`.
//!
//! Builds on a fixed `libcamerasrc` decode-pipeline pattern, generalized
//! into a `uridecodebin`-based pipeline that accepts any file path or
//! network URI rather than one hardcoded sensor.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use gstreamer as gst;
use gstreamer_app as gst_app;
use gst::prelude::*;

use crate::bus::EventBus;
use crate::error::AppError;
use crate::model::{Frame, Message, TOPIC_FRAMES_RAW};

/// Framerates at or above this are treated as unknown; pacing falls back
/// to wall-clock deltas instead.
const IMPLAUSIBLE_FPS: f64 = 1000.0;

fn to_uri(source: &str) -> String {
    if source.contains("://") {
        source.to_string()
    } else {
        let path = Path::new(source);
        let abs = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        format!("file://{}", abs.display())
    }
}

fn is_file_source(source: &str) -> bool {
    !source.contains("://") || source.starts_with("file://")
}

fn build_pipeline(camera_id: &str, source: &str) -> Result<(gst::Pipeline, gst_app::AppSink), AppError> {
    gst::init().map_err(|e| AppError::FatalInit {
        camera_id: camera_id.to_string(),
        reason: format!("gstreamer init failed: {e}"),
    })?;

    let uri = to_uri(source);
    let description = format!(
        "uridecodebin uri=\"{uri}\" name=dec ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink max-buffers=4 drop=true sync=false"
    );

    let element = gst::parse::launch(&description).map_err(|e| AppError::FatalInit {
        camera_id: camera_id.to_string(),
        reason: format!("failed to build decode pipeline for '{source}': {e}"),
    })?;
    let pipeline = element.downcast::<gst::Pipeline>().map_err(|_| AppError::FatalInit {
        camera_id: camera_id.to_string(),
        reason: "parsed element is not a gst::Pipeline".to_string(),
    })?;

    let sink = pipeline
        .by_name("sink")
        .ok_or_else(|| AppError::FatalInit {
            camera_id: camera_id.to_string(),
            reason: "appsink element 'sink' not found".to_string(),
        })?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| AppError::FatalInit {
            camera_id: camera_id.to_string(),
            reason: "element 'sink' is not an appsink".to_string(),
        })?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| AppError::FatalInit {
            camera_id: camera_id.to_string(),
            reason: format!("failed to start pipeline: {e}"),
        })?;

    Ok((pipeline, sink))
}

/// Reads source fps from the first negotiated caps; 0.0 means unknown
/// (including implausibly large values some test sources report).
fn fps_from_caps(sample: &gst::Sample) -> f64 {
    let caps = match sample.caps() {
        Some(c) => c,
        None => return 0.0,
    };
    let structure = match caps.structure(0) {
        Some(s) => s,
        None => return 0.0,
    };
    let fps = match structure.get::<gst::Fraction>("framerate") {
        Ok(frac) if frac.denom() != 0 => frac.numer() as f64 / frac.denom() as f64,
        _ => 0.0,
    };
    if fps > 0.0 && fps < IMPLAUSIBLE_FPS {
        fps
    } else {
        0.0
    }
}

fn frame_from_sample(camera_id: &str, sample: &gst::Sample, frame_idx: u64, source_pts: f64) -> Option<Frame> {
    let caps = sample.caps()?;
    let structure = caps.structure(0)?;
    let width: i32 = structure.get("width").ok()?;
    let height: i32 = structure.get("height").ok()?;
    if width <= 0 || height <= 0 {
        return None;
    }
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    let pixels = image::RgbImage::from_raw(width as u32, height as u32, map.as_slice().to_vec())?;
    let wall_ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    Some(Frame {
        camera_id: camera_id.to_string(),
        wall_ts,
        pixels: Arc::new(pixels),
        frame_idx,
        source_pts,
        vts: source_pts,
    })
}

/// Builds and starts the decode pipeline for `camera_id`/`source` on the
/// blocking thread pool. Its `Result` is what lets a caller (the session
/// coordinator) observe a `FatalInit` failure before anything long-running
/// is spawned, rather than discovering it only once the run loop's task
/// handle is awaited at shutdown.
pub async fn open_frame_source(camera_id: String, source: String) -> Result<(gst::Pipeline, gst_app::AppSink), AppError> {
    let camera_id_for_panic = camera_id.clone();
    tokio::task::spawn_blocking(move || build_pipeline(&camera_id, &source))
        .await
        .map_err(|e| AppError::FatalInit {
            camera_id: camera_id_for_panic,
            reason: format!("pipeline construction task panicked: {e}"),
        })?
}

/// Runs to completion on the calling thread; GStreamer sample pulls
/// block, so this is meant to run inside `spawn_blocking`. Takes an
/// already-opened pipeline: by the time this runs, the only fallible step
/// (`build_pipeline`) has already succeeded.
fn run_opened_source_blocking(
    bus: Arc<EventBus>,
    camera_id: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    source: String,
    simulate_realtime: bool,
) {
    let file_source = is_file_source(&source);
    let start = Instant::now();

    let mut frame_idx: u64 = 0;
    let mut fps: Option<f64> = None;

    loop {
        let sample = match appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) => {
                if file_source || appsink.is_eos() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
        };

        let fps = *fps.get_or_insert_with(|| fps_from_caps(&sample));

        let source_pts = if fps > 0.0 {
            frame_idx as f64 / fps
        } else {
            start.elapsed().as_secs_f64()
        };

        if simulate_realtime && fps > 0.0 {
            let target = start + Duration::from_secs_f64(source_pts);
            let now = Instant::now();
            if target > now {
                std::thread::sleep(target - now);
            }
        }

        if let Some(frame) = frame_from_sample(&camera_id, &sample, frame_idx, source_pts) {
            bus.publish_partitioned(TOPIC_FRAMES_RAW, &camera_id, Message::FrameRaw(frame));
            frame_idx += 1;
        }
    }

    bus.publish_partitioned(TOPIC_FRAMES_RAW, &camera_id, Message::Eos);
    let _ = pipeline.set_state(gst::State::Null);
}

/// Async entry point for an already-opened source: offloads the blocking
/// GStreamer pull loop to the blocking thread pool so it never stalls the
/// Tokio scheduler.
pub async fn run_opened_frame_source(
    bus: Arc<EventBus>,
    camera_id: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    source: String,
    simulate_realtime: bool,
) -> Result<(), AppError> {
    let camera_id_for_panic = camera_id.clone();
    tokio::task::spawn_blocking(move || {
        run_opened_source_blocking(bus, camera_id, pipeline, appsink, source, simulate_realtime)
    })
    .await
    .map_err(|e| AppError::FatalInit {
        camera_id: camera_id_for_panic,
        reason: format!("frame source run loop panicked: {e}"),
    })
}
