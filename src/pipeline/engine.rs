//! Inference Engine (component D): loads a detection model once and
//! exposes a single serialized `infer_batch` operation.
//!
//! Grounded on `sg-core::embedder_onnx::OnnxEmbedder` for the ONNX Runtime
//! session lifecycle (`Session::builder()...commit_from_file`, `ort::inputs!`,
//! `try_extract_tensor`). The model path, input size, confidence/IoU knobs,
//! and device are construction-time configuration; `infer_batch` never
//! takes them as arguments.

use std::sync::Arc;

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::AppError;

/// The public seam: anything that can score a batch of images. Tests
/// substitute a deterministic stub here instead of loading ONNX Runtime.
pub trait DetectionModel: Send {
    /// Returns one max-confidence scalar per input image, same order.
    fn infer_batch(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<f32>, AppError>;
}

/// ONNX Runtime-backed detection model.
pub struct OnnxDetectionModel {
    session: Session,
    img_size: u32,
}

impl OnnxDetectionModel {
    pub fn load(config: &EngineConfig) -> Result<Self, AppError> {
        info!(model_path = %config.model_path, device = %config.device, "loading detection model");
        let session = Session::builder()
            .map_err(|e| AppError::ModelLoad {
                path: config.model_path.clone(),
                reason: format!("failed to create session builder: {e}"),
            })?
            .with_intra_threads(4)
            .map_err(|e| AppError::ModelLoad {
                path: config.model_path.clone(),
                reason: format!("failed to set thread count: {e}"),
            })?
            .commit_from_file(&config.model_path)
            .map_err(|e| AppError::ModelLoad {
                path: config.model_path.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            session,
            img_size: config.img_size,
        })
    }

    fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let resized = image::imageops::resize(
            image,
            self.img_size,
            self.img_size,
            image::imageops::FilterType::Triangle,
        );
        let mut input = Array4::<f32>::zeros((1, 3, self.img_size as usize, self.img_size as usize));
        for y in 0..self.img_size {
            for x in 0..self.img_size {
                let pixel = resized.get_pixel(x, y);
                input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
                input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
                input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
            }
        }
        input
    }
}

impl DetectionModel for OnnxDetectionModel {
    fn infer_batch(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<f32>, AppError> {
        let mut scores = Vec::with_capacity(images.len());
        for image in images {
            let input = self.preprocess(image);
            let value = Value::from_array(input).map_err(|e| AppError::Inference(e.to_string()))?;
            let outputs = self
                .session
                .run(ort::inputs![value])
                .map_err(|e| AppError::Inference(e.to_string()))?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| AppError::Inference(e.to_string()))?;
            // The exported head already folds objectness/class scores and
            // NMS into a single confidence column; the engine only needs
            // the per-image maximum, not box geometry.
            let max = data.iter().copied().fold(f32::MIN, f32::max);
            scores.push(max.clamp(0.0, 1.0));
        }
        Ok(scores)
    }
}

struct EngineRequest {
    images: Vec<Arc<RgbImage>>,
    reply: oneshot::Sender<Result<Vec<f32>, AppError>>,
}

/// Owns the worker task that serializes every call into the model. Cheap
/// to clone: clones only the request channel handle.
#[derive(Clone)]
pub struct InferenceEngine {
    tx: mpsc::Sender<EngineRequest>,
}

impl InferenceEngine {
    /// Spawns the worker thread that owns `model` for the lifetime of the
    /// engine; `infer_batch` calls are serialized through it one at a time.
    pub fn spawn(model: impl DetectionModel + 'static) -> Self {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(32);
        tokio::task::spawn_blocking(move || {
            let mut model = model;
            while let Some(req) = rx.blocking_recv() {
                let result = model.infer_batch(&req.images);
                let _ = req.reply.send(result);
            }
        });
        Self { tx }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, AppError> {
        let model = OnnxDetectionModel::load(config)?;
        Ok(Self::spawn(model))
    }

    pub async fn infer_batch(&self, images: Vec<Arc<RgbImage>>) -> Result<Vec<f32>, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest {
                images,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AppError::Inference("inference engine worker is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AppError::Inference("inference engine worker dropped its reply".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubModel {
        fixed: f32,
    }

    impl DetectionModel for StubModel {
        fn infer_batch(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<f32>, AppError> {
            Ok(images.iter().map(|_| self.fixed).collect())
        }
    }

    #[tokio::test]
    async fn serializes_calls_through_the_worker() {
        let engine = InferenceEngine::spawn(StubModel { fixed: 0.42 });
        let images = vec![Arc::new(RgbImage::new(2, 2)), Arc::new(RgbImage::new(2, 2))];
        let scores = engine.infer_batch(images).await.unwrap();
        assert_eq!(scores, vec![0.42, 0.42]);
    }
}
