//! Inference engine seam. The session coordinator only sees the
//! `PoseModel`/`ModelLoader` traits; the ONNX-backed implementation lives
//! behind the `desktop` feature.

use anyhow::Result;

use crate::capture::VideoFrame;
use crate::config::{EstimationConfig, ModelConfig};
use crate::pose::Pose;

/// A loaded pose-estimation model instance. Exclusively owned by the model
/// lifecycle manager; checked out for one estimate call at a time.
pub trait PoseModel: Send {
    /// Run inference against one frame. The config is fixed for the
    /// duration of the call.
    fn estimate(&mut self, frame: &VideoFrame, config: &EstimationConfig) -> Result<Vec<Pose>>;

    /// Release the instance's compute resources. Idempotent; a disposed
    /// instance fails any further estimate calls.
    fn dispose(&mut self);
}

/// Produces model instances from a config. Loading may block (weight file
/// I/O, session construction) and runs on the blocking pool.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &ModelConfig) -> Result<Box<dyn PoseModel>>;
}

#[cfg(feature = "desktop")]
pub use onnx::{OnnxLoader, OnnxPoseModel};

#[cfg(feature = "desktop")]
mod onnx {
    use anyhow::{anyhow, Context, Result};
    use ndarray::Array4;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;

    use super::{ModelLoader, PoseModel};
    use crate::capture::VideoFrame;
    use crate::config::{EstimationConfig, EstimationParams, ModelConfig, ModelVariant};
    use crate::pose::{ImageSize, Keypoint, Part, Pose};

    fn build_session(model_path: &std::path::Path) -> Result<Session> {
        let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        #[cfg(feature = "cuda")]
        let builder = {
            log::info!("attempting CUDA execution provider");
            builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
            ])?
        };

        builder
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ONNX model {}", model_path.display()))
    }

    /// Input normalization expected by the network.
    #[derive(Debug, Clone, Copy)]
    enum Normalization {
        /// (v / 127.5) - 1
        MobileNet,
        /// v - per-channel ImageNet mean
        ResNet,
    }

    pub struct OnnxPoseModel {
        session: Option<Session>,
        normalization: Normalization,
    }

    impl OnnxPoseModel {
        fn new(config: &ModelConfig) -> Result<Self> {
            let session = build_session(&config.weights_path())?;
            let normalization = match config.variant {
                ModelVariant::MobileNetV1 { .. } => Normalization::MobileNet,
                ModelVariant::ResNet50 { .. } => Normalization::ResNet,
            };
            Ok(Self {
                session: Some(session),
                normalization,
            })
        }
    }

    impl PoseModel for OnnxPoseModel {
        fn estimate(
            &mut self,
            frame: &VideoFrame,
            config: &EstimationConfig,
        ) -> Result<Vec<Pose>> {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| anyhow!("estimate on disposed model"))?;

            let stride = config.variant.output_stride().value();
            // internal resolution snaps to the nearest valid grid size
            // (a multiple of the stride, plus one)
            let resolution =
                ((config.params.internal_resolution.max(stride) + stride / 2) / stride) * stride + 1;
            let input = preprocess(frame, resolution, self.normalization);
            let input_tensor = Tensor::from_array(input)?;
            let stride_tensor = Tensor::from_array(ndarray::arr1(&[stride as i64]))?;
            let outputs = session
                .run(ort::inputs!["input" => input_tensor, "output_stride" => stride_tensor])
                .context("inference failed")?;

            let heatmaps: ndarray::ArrayViewD<f32> = outputs["heatmaps"]
                .try_extract_array()
                .context("failed to extract heatmaps")?;
            let offsets: ndarray::ArrayViewD<f32> = outputs["offsets"]
                .try_extract_array()
                .context("failed to extract offsets")?;

            let image = ImageSize {
                width: frame.width,
                height: frame.height,
            };
            Ok(decode_poses(&heatmaps, &offsets, resolution, image, &config.params))
        }

        fn dispose(&mut self) {
            self.session = None;
        }
    }

    pub struct OnnxLoader;

    impl ModelLoader for OnnxLoader {
        fn load(&self, config: &ModelConfig) -> Result<Box<dyn PoseModel>> {
            Ok(Box::new(OnnxPoseModel::new(config)?))
        }
    }

    /// Resize the RGB frame to a square `resolution` with bilinear sampling
    /// and normalize into an NHWC float tensor.
    fn preprocess(frame: &VideoFrame, resolution: u32, normalization: Normalization) -> Array4<f32> {
        const RESNET_MEAN: [f32; 3] = [123.15, 115.90, 103.06];

        let res = resolution as usize;
        let (src_w, src_h) = (frame.width as usize, frame.height as usize);
        let mut tensor = Array4::<f32>::zeros((1, res, res, 3));

        for oy in 0..res {
            let sy = (oy as f32 + 0.5) * src_h as f32 / res as f32 - 0.5;
            let y0 = sy.floor().max(0.0) as usize;
            let y1 = (y0 + 1).min(src_h - 1);
            let fy = (sy - y0 as f32).clamp(0.0, 1.0);
            for ox in 0..res {
                let sx = (ox as f32 + 0.5) * src_w as f32 / res as f32 - 0.5;
                let x0 = sx.floor().max(0.0) as usize;
                let x1 = (x0 + 1).min(src_w - 1);
                let fx = (sx - x0 as f32).clamp(0.0, 1.0);
                for c in 0..3 {
                    let p00 = frame.rgb[(y0 * src_w + x0) * 3 + c] as f32;
                    let p01 = frame.rgb[(y0 * src_w + x1) * 3 + c] as f32;
                    let p10 = frame.rgb[(y1 * src_w + x0) * 3 + c] as f32;
                    let p11 = frame.rgb[(y1 * src_w + x1) * 3 + c] as f32;
                    let top = p00 + (p01 - p00) * fx;
                    let bottom = p10 + (p11 - p10) * fx;
                    let v = top + (bottom - top) * fy;
                    tensor[[0, oy, ox, c]] = match normalization {
                        Normalization::MobileNet => v / 127.5 - 1.0,
                        Normalization::ResNet => v - RESNET_MEAN[c],
                    };
                }
            }
        }
        tensor
    }

    fn sigmoid(v: f32) -> f32 {
        1.0 / (1.0 + (-v).exp())
    }

    /// Decode heatmap + offset tensors into up to `max_detections` poses.
    ///
    /// Heatmaps are [1, rows, cols, 17] logits; offsets are
    /// [1, rows, cols, 34] with y-offsets in the first 17 channels and
    /// x-offsets in the last 17 (checkpoint export convention). The
    /// effective stride is derived from the output grid itself. Detection
    /// proceeds greedily: per pose, each part takes its best unsuppressed
    /// cell; accepted keypoints suppress cells of the same part within
    /// `nms_radius` source-image pixels for subsequent poses.
    fn decode_poses(
        heatmaps: &ndarray::ArrayViewD<f32>,
        offsets: &ndarray::ArrayViewD<f32>,
        resolution: u32,
        image: ImageSize,
        params: &EstimationParams,
    ) -> Vec<Pose> {
        let rows = heatmaps.shape()[1];
        let cols = heatmaps.shape()[2];
        let stride = if cols > 1 {
            (resolution - 1) as f32 / (cols - 1) as f32
        } else {
            resolution as f32
        };
        let scale_x = image.width as f32 / resolution as f32;
        let scale_y = image.height as f32 / resolution as f32;

        let mut taken: Vec<Vec<(f32, f32)>> = vec![Vec::new(); Part::COUNT];
        let mut poses = Vec::new();

        for _ in 0..params.max_detections {
            let mut keypoints = Vec::with_capacity(Part::COUNT);
            let mut score_sum = 0.0f32;

            for (p, part) in Part::all().enumerate() {
                let mut best: Option<(f32, f32, f32)> = None;
                for row in 0..rows {
                    for col in 0..cols {
                        let score = sigmoid(heatmaps[[0, row, col, p]]);
                        if let Some((best_score, _, _)) = best {
                            if score <= best_score {
                                continue;
                            }
                        }
                        let dy = offsets[[0, row, col, p]];
                        let dx = offsets[[0, row, col, p + Part::COUNT]];
                        let x = (col as f32 * stride + dx) * scale_x;
                        let y = (row as f32 * stride + dy) * scale_y;
                        let suppressed = taken[p].iter().any(|&(tx, ty)| {
                            let (ddx, ddy) = (tx - x, ty - y);
                            (ddx * ddx + ddy * ddy).sqrt() < params.nms_radius
                        });
                        if !suppressed {
                            best = Some((score, x, y));
                        }
                    }
                }

                let (score, x, y) = best.unwrap_or((0.0, 0.0, 0.0));
                let x = if params.flip_horizontal {
                    image.width as f32 - x
                } else {
                    x
                };
                score_sum += score;
                keypoints.push(Keypoint::new(part, x, y, score));
            }

            let pose_score = score_sum / Part::COUNT as f32;
            if pose_score < params.score_threshold {
                break;
            }
            for kp in &keypoints {
                // suppression set is tracked in unflipped coordinates
                let x = if params.flip_horizontal {
                    image.width as f32 - kp.position.x
                } else {
                    kp.position.x
                };
                taken[kp.part as usize].push((x, kp.position.y));
            }
            poses.push(Pose::new(pose_score, keypoints));
        }

        poses
    }

}
