//! Equal-Time Resampler (component C): converts one camera's raw frame
//! stream onto a uniform virtual-time grid at `target_fps` and republishes
//! onto `frames:{camera_id}`.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bus::{EventBus, Mode};
use crate::model::{Frame, Message, TOPIC_FRAMES, TOPIC_FRAMES_RAW};

const IDLE_TIMEOUT: Duration = Duration::from_secs(1);
const EPSILON: f64 = 1e-9;

/// Runs the resampler until the raw topic closes or emits the end-of-stream
/// sentinel. `target_fps` must be > 0.
pub async fn run_resampler(bus: Arc<EventBus>, camera_id: String, target_fps: f64) {
    let step = 1.0 / target_fps;
    let (sub, _guard) = bus.subscribe(&format!("{TOPIC_FRAMES_RAW}:{camera_id}"), Mode::Fifo, 64);

    let mut next_vts: Option<f64> = None;
    let mut sample_idx: u64 = 0;

    loop {
        let item = match sub.recv_timeout(IDLE_TIMEOUT).await {
            Ok(Some(item)) => item,
            Ok(None) => continue, // idle: retry
            Err(()) => break,     // subscription closed
        };

        let frame = match item {
            Message::FrameRaw(frame) => frame,
            Message::Eos => break,
            _ => continue,
        };

        let next = next_vts.get_or_insert(0.0);
        while frame.source_pts + EPSILON >= *next {
            let out = Frame {
                camera_id: camera_id.clone(),
                wall_ts: frame.wall_ts,
                pixels: frame.pixels.clone(),
                frame_idx: sample_idx,
                source_pts: frame.source_pts,
                vts: *next,
            };
            bus.publish_partitioned(TOPIC_FRAMES, &camera_id, Message::FrameSampled(out));
            sample_idx += 1;
            *next += step;
        }
    }

    debug!(camera_id, emitted = sample_idx, "resampler finished");
    bus.publish_partitioned(TOPIC_FRAMES, &camera_id, Message::Eos);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration as TokioDuration};

    #[tokio::test]
    async fn emits_uniform_grid_for_faster_raw_stream() {
        let bus = Arc::new(EventBus::new());
        let (out_sub, _out_guard) = bus.subscribe("frames:cam-1", Mode::Fifo, 256);

        let bus_for_task = bus.clone();
        let handle = tokio::spawn(run_resampler(bus_for_task, "cam-1".to_string(), 10.0));

        // Raw frames at a much higher rate (every 0.01s of source_pts) than
        // the 10fps target (0.1s step) — must be downsampled, not duplicated.
        for i in 0..50u64 {
            let pts = i as f64 * 0.01;
            bus.publish_partitioned(
                TOPIC_FRAMES_RAW,
                "cam-1",
                Message::FrameRaw(Frame {
                    camera_id: "cam-1".to_string(),
                    wall_ts: 0.0,
                    pixels: Arc::new(image::RgbImage::new(2, 2)),
                    frame_idx: i,
                    source_pts: pts,
                    vts: pts,
                }),
            );
        }
        bus.publish_partitioned(TOPIC_FRAMES_RAW, "cam-1", Message::Eos);

        sleep(TokioDuration::from_millis(50)).await;
        handle.await.unwrap();

        let mut vts_values = Vec::new();
        loop {
            match out_sub.recv_timeout(TokioDuration::from_millis(50)).await {
                Ok(Some(Message::FrameSampled(f))) => vts_values.push(f.vts),
                Ok(Some(Message::Eos)) | Ok(None) | Err(()) => break,
                _ => continue,
            }
        }

        assert!(!vts_values.is_empty());
        for pair in vts_values.windows(2) {
            assert!((pair[1] - pair[0] - 0.1).abs() < 1e-6);
        }
    }
}
