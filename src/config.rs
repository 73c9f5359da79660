use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Legal MobileNetV1 depth multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplier {
    M050,
    M075,
    M100,
}

impl Multiplier {
    pub fn value(self) -> f32 {
        match self {
            Self::M050 => 0.50,
            Self::M075 => 0.75,
            Self::M100 => 1.00,
        }
    }

    /// Nearest legal multiplier to a raw config value.
    pub fn nearest(raw: f32) -> Self {
        if raw < 0.625 {
            Self::M050
        } else if raw < 0.875 {
            Self::M075
        } else {
            Self::M100
        }
    }

    fn folder(self) -> &'static str {
        match self {
            Self::M050 => "mobilenet_v1_050",
            Self::M075 => "mobilenet_v1_075",
            Self::M100 => "mobilenet_v1_100",
        }
    }
}

/// Output stride of the network. Larger stride is faster and coarser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStride {
    S8,
    S16,
    S32,
}

impl OutputStride {
    pub fn value(self) -> u32 {
        match self {
            Self::S8 => 8,
            Self::S16 => 16,
            Self::S32 => 32,
        }
    }
}

/// Model selection as a tagged variant: each architecture carries only its
/// legal parameter set. MobileNetV1 supports strides 8/16 and multipliers
/// 0.50/0.75/1.00; ResNet50 supports strides 16/32 at multiplier 1.00.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    MobileNetV1 {
        multiplier: Multiplier,
        output_stride: OutputStride,
    },
    ResNet50 {
        output_stride: OutputStride,
    },
}

impl Default for ModelVariant {
    fn default() -> Self {
        Self::MobileNetV1 {
            multiplier: Multiplier::M075,
            output_stride: OutputStride::S16,
        }
    }
}

impl ModelVariant {
    pub fn architecture(&self) -> &'static str {
        match self {
            Self::MobileNetV1 { .. } => "MobileNetV1",
            Self::ResNet50 { .. } => "ResNet50",
        }
    }

    pub fn multiplier(&self) -> Multiplier {
        match self {
            Self::MobileNetV1 { multiplier, .. } => *multiplier,
            Self::ResNet50 { .. } => Multiplier::M100,
        }
    }

    pub fn output_stride(&self) -> OutputStride {
        match self {
            Self::MobileNetV1 { output_stride, .. } => *output_stride,
            Self::ResNet50 { output_stride } => *output_stride,
        }
    }

    /// Switch architecture, clamping stride and multiplier to the target's
    /// legal set: ResNet50 has no stride 8 (maps to 16) and a fixed
    /// multiplier; MobileNetV1 has no stride 32 (maps to 16).
    pub fn with_architecture(self, architecture: &str) -> Self {
        match architecture {
            "ResNet50" => {
                let output_stride = match self.output_stride() {
                    OutputStride::S8 => OutputStride::S16,
                    other => other,
                };
                Self::ResNet50 { output_stride }
            }
            _ => {
                let output_stride = match self.output_stride() {
                    OutputStride::S32 => OutputStride::S16,
                    other => other,
                };
                Self::MobileNetV1 {
                    multiplier: self.multiplier(),
                    output_stride,
                }
            }
        }
    }

    /// Set the output stride, clamping to the variant's legal set.
    pub fn with_output_stride(self, raw: u32) -> Self {
        match self {
            Self::MobileNetV1 { multiplier, .. } => {
                let output_stride = if raw <= 8 {
                    OutputStride::S8
                } else {
                    OutputStride::S16
                };
                Self::MobileNetV1 {
                    multiplier,
                    output_stride,
                }
            }
            Self::ResNet50 { .. } => {
                let output_stride = if raw >= 32 {
                    OutputStride::S32
                } else {
                    OutputStride::S16
                };
                Self::ResNet50 { output_stride }
            }
        }
    }

    /// Set the multiplier. Ignored for ResNet50, which only ships 1.00.
    pub fn with_multiplier(self, raw: f32) -> Self {
        match self {
            Self::MobileNetV1 { output_stride, .. } => Self::MobileNetV1 {
                multiplier: Multiplier::nearest(raw),
                output_stride,
            },
            resnet => resnet,
        }
    }

    /// Relative path of this variant's ONNX weights under the models
    /// directory. Mirrors the original checkpoint folder layout. Weights
    /// are keyed by architecture and multiplier; the output stride is a
    /// per-call input, so changing it never forces a reload.
    pub fn weights_file(&self) -> PathBuf {
        match self {
            Self::MobileNetV1 { multiplier, .. } => {
                PathBuf::from(multiplier.folder()).join("model.onnx")
            }
            Self::ResNet50 { .. } => PathBuf::from("resnet50").join("model.onnx"),
        }
    }

    /// True when `other` resolves to the same weights, i.e. switching from
    /// `self` to `other` does not require a model reload.
    pub fn same_weights(&self, other: &ModelVariant) -> bool {
        self.weights_file() == other.weights_file()
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x{:.2} stride {}",
            self.architecture(),
            self.multiplier().value(),
            self.output_stride().value()
        )
    }
}

/// Everything the model loader needs to produce an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    pub models_dir: PathBuf,
}

impl ModelConfig {
    pub fn weights_path(&self) -> PathBuf {
        self.models_dir.join(self.variant.weights_file())
    }
}

/// Per-call estimation tuning. Snapshotted by the scheduler each tick; a
/// change never applies mid-call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimationParams {
    pub internal_resolution: u32,
    pub max_detections: usize,
    pub score_threshold: f32,
    pub nms_radius: f32,
    pub flip_horizontal: bool,
}

impl Default for EstimationParams {
    fn default() -> Self {
        Self {
            internal_resolution: 257,
            max_detections: 5,
            score_threshold: 0.1,
            nms_radius: 30.0,
            flip_horizontal: true,
        }
    }
}

/// The full per-call estimation configuration: the validated model variant
/// (whose output stride applies on the next call) plus the tuning params.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EstimationConfig {
    pub variant: ModelVariant,
    pub params: EstimationParams,
}

// ---------------------------------------------------------------------------
// Client config (posecast.toml)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
    #[serde(default = "default_output_stride")]
    pub output_stride: u32,
    #[serde(default = "default_internal_resolution")]
    pub internal_resolution: u32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_nms_radius")]
    pub nms_radius: f32,
    #[serde(default = "default_flip_horizontal")]
    pub flip_horizontal: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_capture_width")]
    pub capture_width: u32,
    #[serde(default = "default_capture_height")]
    pub capture_height: u32,
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_models_dir() -> String {
    "models".to_string()
}
fn default_architecture() -> String {
    "MobileNetV1".to_string()
}
fn default_multiplier() -> f32 {
    0.75
}
fn default_output_stride() -> u32 {
    16
}
fn default_internal_resolution() -> u32 {
    257
}
fn default_max_detections() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.1
}
fn default_nms_radius() -> f32 {
    30.0
}
fn default_flip_horizontal() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_capture_width() -> u32 {
    640
}
fn default_capture_height() -> u32 {
    480
}
fn default_tick_hz() -> u32 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the config, falling back to defaults when the file is absent.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("{e:#}; using default config");
                Self::default()
            }
        }
    }

    /// Validated model variant from the raw architecture/multiplier/stride
    /// fields.
    pub fn model_variant(&self) -> ModelVariant {
        ModelVariant::default()
            .with_architecture(&self.architecture)
            .with_multiplier(self.multiplier)
            .with_output_stride(self.output_stride)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            variant: self.model_variant(),
            models_dir: PathBuf::from(&self.models_dir),
        }
    }

    pub fn estimation_params(&self) -> EstimationParams {
        EstimationParams {
            internal_resolution: self.internal_resolution,
            max_detections: self.max_detections,
            score_threshold: self.score_threshold,
            nms_radius: self.nms_radius,
            flip_horizontal: self.flip_horizontal,
        }
    }

    pub fn estimation_config(&self) -> EstimationConfig {
        EstimationConfig {
            variant: self.model_variant(),
            params: self.estimation_params(),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay config (relay.toml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// The original relay echoes every message back to its sender. Kept as
    /// the default; set to false to exclude the sender from its own fan-out.
    #[serde(default = "default_echo_to_sender")]
    pub echo_to_sender: bool,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_echo_to_sender() -> bool {
    true
}
fn default_max_frame_length() -> usize {
    1024 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl RelayConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => match toml::from_str(&content) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("bad {}: {e}; using default config", path.as_ref().display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_variant() {
        let v = ModelVariant::default();
        assert_eq!(v.architecture(), "MobileNetV1");
        assert_eq!(v.multiplier(), Multiplier::M075);
        assert_eq!(v.output_stride(), OutputStride::S16);
    }

    #[test]
    fn test_switch_to_resnet_clamps_stride_8() {
        let v = ModelVariant::MobileNetV1 {
            multiplier: Multiplier::M050,
            output_stride: OutputStride::S8,
        };
        let r = v.with_architecture("ResNet50");
        assert_eq!(r.output_stride(), OutputStride::S16);
        assert_eq!(r.multiplier(), Multiplier::M100);
    }

    #[test]
    fn test_switch_to_resnet_keeps_stride_16() {
        let v = ModelVariant::default().with_architecture("ResNet50");
        assert_eq!(v.output_stride(), OutputStride::S16);
    }

    #[test]
    fn test_switch_to_mobilenet_clamps_stride_32() {
        let v = ModelVariant::ResNet50 {
            output_stride: OutputStride::S32,
        };
        let m = v.with_architecture("MobileNetV1");
        assert_eq!(m.output_stride(), OutputStride::S16);
        // ResNet's implicit multiplier carries over as 1.00
        assert_eq!(m.multiplier(), Multiplier::M100);
    }

    #[test]
    fn test_stride_clamped_to_variant_legal_set() {
        let m = ModelVariant::default().with_output_stride(32);
        assert_eq!(m.output_stride(), OutputStride::S16);
        let m = ModelVariant::default().with_output_stride(8);
        assert_eq!(m.output_stride(), OutputStride::S8);

        let r = ModelVariant::ResNet50 {
            output_stride: OutputStride::S16,
        };
        assert_eq!(r.with_output_stride(8).output_stride(), OutputStride::S16);
        assert_eq!(r.with_output_stride(32).output_stride(), OutputStride::S32);
    }

    #[test]
    fn test_multiplier_ignored_on_resnet() {
        let r = ModelVariant::ResNet50 {
            output_stride: OutputStride::S16,
        };
        assert_eq!(r.with_multiplier(0.5).multiplier(), Multiplier::M100);
    }

    #[test]
    fn test_multiplier_nearest() {
        assert_eq!(Multiplier::nearest(0.5), Multiplier::M050);
        assert_eq!(Multiplier::nearest(0.6), Multiplier::M050);
        assert_eq!(Multiplier::nearest(0.75), Multiplier::M075);
        assert_eq!(Multiplier::nearest(1.0), Multiplier::M100);
        assert_eq!(Multiplier::nearest(1.01), Multiplier::M100);
    }

    #[test]
    fn test_weights_file_layout() {
        let v = ModelVariant::MobileNetV1 {
            multiplier: Multiplier::M050,
            output_stride: OutputStride::S8,
        };
        assert_eq!(
            v.weights_file(),
            PathBuf::from("mobilenet_v1_050/model.onnx")
        );
        let r = ModelVariant::ResNet50 {
            output_stride: OutputStride::S32,
        };
        assert_eq!(r.weights_file(), PathBuf::from("resnet50/model.onnx"));
    }

    #[test]
    fn test_stride_change_shares_weights() {
        let v = ModelVariant::default();
        assert!(v.same_weights(&v.with_output_stride(8)));
        assert!(!v.same_weights(&v.with_multiplier(0.5)));
        assert!(!v.same_weights(&v.with_architecture("ResNet50")));
    }

    #[test]
    fn test_client_config_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.tick_hz, 60);
        assert_eq!(c.capture_width, 640);
        assert_eq!(c.capture_height, 480);
        let params = c.estimation_params();
        assert_eq!(params.max_detections, 5);
        assert!((params.score_threshold - 0.1).abs() < 1e-6);
        assert!((params.nms_radius - 30.0).abs() < 1e-6);
        assert!(params.flip_horizontal);
        assert_eq!(c.model_variant(), ModelVariant::default());
    }

    #[test]
    fn test_client_config_partial_toml() {
        let c: ClientConfig = toml::from_str(
            r#"
            architecture = "ResNet50"
            output_stride = 8
            host = "192.168.1.10"
            "#,
        )
        .unwrap();
        // stride 8 is illegal for ResNet50 and clamps to 16
        let v = c.model_variant();
        assert_eq!(v.architecture(), "ResNet50");
        assert_eq!(v.output_stride(), OutputStride::S16);
        assert_eq!(c.host, "192.168.1.10");
        assert_eq!(c.port, 8080);
    }

    #[test]
    fn test_relay_config_defaults() {
        let c = RelayConfig::default();
        assert_eq!(c.listen_addr, "0.0.0.0:8080");
        assert!(c.echo_to_sender);
        assert_eq!(c.max_frame_length, 1024 * 1024);
    }
}
