//! Data model shared across the pipeline.
//!
//! `Message` is the closed sum type carried on every bus topic, replacing
//! the dynamically-typed payloads of the original event bus.

use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;

/// A single decoded image handed between pipeline stages.
///
/// `pixels` is shared via `Arc` so downstream subscribers never copy the
/// buffer; the immutable `Arc<RgbImage>` also enforces, by construction,
/// that subscribers cannot mutate pixels owned by the publisher.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub wall_ts: f64,
    pub pixels: Arc<RgbImage>,
    pub frame_idx: u64,
    pub source_pts: f64,
    pub vts: f64,
}

/// Per-frame inference output. Value-typed and cheap to copy/clone.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub camera_id: String,
    pub wall_ts: f64,
    pub frame_idx: u64,
    pub source_pts: f64,
    pub vts: f64,
    pub confidence: f32,
    pub happened: bool,
}

impl Detection {
    pub const TYPE: &'static str = "accident";
}

/// Aggregator's in-flight record of an open incident.
#[derive(Debug, Clone)]
pub struct Incident {
    pub incident_id: String,
    pub start_vts: f64,
    pub end_vts: f64,
    pub peak_confidence: f32,
    pub positive_frames: u64,
    pub start_frame_idx: u64,
    pub end_frame_idx: u64,
}

/// `accident_open` event.
#[derive(Debug, Clone, Serialize)]
pub struct AccidentOpenEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub camera_id: String,
    pub incident_id: String,
    pub session_id: String,
    pub frame_idx: u64,
    pub pts_in_video: f64,
    pub confidence: f32,
    pub peak_confidence: f32,
}

/// `accident_close` event.
#[derive(Debug, Clone, Serialize)]
pub struct AccidentCloseEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub camera_id: String,
    pub incident_id: String,
    pub session_id: String,
    pub frame_idx: u64,
    pub pts_in_video: f64,
    pub confidence: f32,
    pub start_ts: f64,
    pub end_ts: f64,
    pub duration_sec: f64,
    pub peak_confidence: f32,
    pub pos_frames: u64,
}

impl AccidentOpenEvent {
    pub fn new(
        camera_id: String,
        incident_id: String,
        session_id: String,
        start_vts: f64,
        start_frame_idx: u64,
        peak_confidence: f32,
    ) -> Self {
        Self {
            kind: "accident_open",
            camera_id,
            incident_id,
            session_id,
            frame_idx: start_frame_idx,
            pts_in_video: start_vts,
            confidence: peak_confidence,
            peak_confidence,
        }
    }
}

impl AccidentCloseEvent {
    pub fn from_incident(camera_id: String, session_id: String, inc: &Incident) -> Self {
        Self {
            kind: "accident_close",
            camera_id,
            incident_id: inc.incident_id.clone(),
            session_id,
            frame_idx: inc.end_frame_idx,
            pts_in_video: inc.end_vts,
            confidence: inc.peak_confidence,
            start_ts: inc.start_vts,
            end_ts: inc.end_vts,
            duration_sec: (inc.end_vts - inc.start_vts).max(0.0),
            peak_confidence: inc.peak_confidence,
            pos_frames: inc.positive_frames,
        }
    }
}

/// The one payload type carried over every bus topic.
///
/// `Eos` replaces the sentinel `None` frame used by the original frame
/// source to signal end of stream.
#[derive(Debug, Clone)]
pub enum Message {
    FrameRaw(Frame),
    FrameSampled(Frame),
    Detection(Detection),
    AccidentOpen(AccidentOpenEvent),
    AccidentClose(AccidentCloseEvent),
    Eos,
}

impl Message {
    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Message::FrameRaw(f) | Message::FrameSampled(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Message::Eos)
    }
}

/// Constructs a topic name from a base and an optional partition key:
/// `base` alone, or `base:partition_key` when partitioned.
pub fn topic_for(base: &str, camera_id: Option<&str>) -> String {
    match camera_id {
        Some(id) => format!("{base}:{id}"),
        None => base.to_string(),
    }
}

pub const TOPIC_FRAMES_RAW: &str = "frames_raw";
pub const TOPIC_FRAMES: &str = "frames";
pub const TOPIC_ACCIDENT: &str = "accident";
pub const TOPIC_ACCIDENTS_OPEN: &str = "accidents.open";
pub const TOPIC_ACCIDENTS_CLOSE: &str = "accidents.close";
