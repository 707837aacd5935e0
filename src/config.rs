use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub resampler: ResamplerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

/// HTTP/SSE boundary bind address.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            web_port: default_web_port(),
        }
    }
}

/// One configured camera: its identity, where to read frames from, and
/// whether a file source should be paced to its own timestamps.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    pub camera_id: String,
    pub source: String,
    #[serde(default)]
    pub simulate_realtime: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResamplerConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
        }
    }
}

/// Inference engine construction-time parameters. These are fixed once at
/// startup and never vary per call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_img_size")]
    pub img_size: u32,
    #[serde(default = "default_conf")]
    pub conf: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            img_size: default_img_size(),
            conf: default_conf(),
            iou: default_iou(),
            device: default_device(),
            batch_size: default_batch_size(),
            poll_ms: default_poll_ms(),
            decision_threshold: default_decision_threshold(),
        }
    }
}

/// Tunables for the soft-evidence accident aggregator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregatorConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: f32,
    #[serde(default = "default_min_end_neg_frames")]
    pub min_end_neg_frames: u32,
    #[serde(default = "default_min_duration")]
    pub min_duration: f64,
    #[serde(default = "default_occlusion_grace")]
    pub occlusion_grace: f64,
    #[serde(default = "default_merge_gap")]
    pub merge_gap: f64,
    #[serde(default = "default_evidence_baseline")]
    pub evidence_baseline: f32,
    #[serde(default = "default_evidence_min_conf")]
    pub evidence_min_conf: f32,
    #[serde(default = "default_soft_gain")]
    pub soft_gain: f32,
    #[serde(default = "default_soft_decay")]
    pub soft_decay: f32,
    #[serde(default = "default_open_score_threshold")]
    pub open_score_threshold: f32,
    #[serde(default = "default_min_open_conf")]
    pub min_open_conf: f32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            exit_threshold: default_exit_threshold(),
            min_end_neg_frames: default_min_end_neg_frames(),
            min_duration: default_min_duration(),
            occlusion_grace: default_occlusion_grace(),
            merge_gap: default_merge_gap(),
            evidence_baseline: default_evidence_baseline(),
            evidence_min_conf: default_evidence_min_conf(),
            soft_gain: default_soft_gain(),
            soft_decay: default_soft_decay(),
            open_score_threshold: default_open_score_threshold(),
            min_open_conf: default_min_open_conf(),
            warmup_frames: default_warmup_frames(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_web_port() -> u16 {
    8080
}
fn default_target_fps() -> f64 {
    5.0
}
fn default_model_path() -> String {
    "models/accident.onnx".to_string()
}
fn default_img_size() -> u32 {
    960
}
fn default_conf() -> f32 {
    0.05
}
fn default_iou() -> f32 {
    0.50
}
fn default_device() -> String {
    "cpu".to_string()
}
fn default_batch_size() -> usize {
    8
}
fn default_poll_ms() -> u64 {
    10
}
fn default_decision_threshold() -> f32 {
    0.65
}
fn default_alpha() -> f32 {
    0.22
}
fn default_exit_threshold() -> f32 {
    0.38
}
fn default_min_end_neg_frames() -> u32 {
    8
}
fn default_min_duration() -> f64 {
    0.15
}
fn default_occlusion_grace() -> f64 {
    1.2
}
fn default_merge_gap() -> f64 {
    4.0
}
fn default_evidence_baseline() -> f32 {
    0.10
}
fn default_evidence_min_conf() -> f32 {
    0.08
}
fn default_soft_gain() -> f32 {
    3.0
}
fn default_soft_decay() -> f32 {
    0.05
}
fn default_open_score_threshold() -> f32 {
    0.75
}
fn default_min_open_conf() -> f32 {
    0.15
}
fn default_warmup_frames() -> u32 {
    20
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Maps a configured camera id to its source path/URI. Returns `None`
    /// for an id with no `[[cameras]]` entry.
    pub fn source_for(&self, camera_id: &str) -> Option<&str> {
        self.cameras
            .iter()
            .find(|c| c.camera_id == camera_id)
            .map(|c| c.source.as_str())
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(|c| c.camera_id.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cameras: Vec::new(),
            resampler: ResamplerConfig::default(),
            engine: EngineConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }
}
