use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name recorded in checkpoint directories
pub const MODEL_NAME: &str = "deeplabv3_plus";

/// Root directory for checkpoints (`~` is expanded)
pub const MODEL_SAVE_DIR: &str = "~/.deeplab/runs";

/// Channel widths the decoder head is built around
pub const ASPP_CHANNELS: usize = 256;
pub const C1_PROJECTION_CHANNELS: usize = 48;
pub const DECODER_CHANNELS: usize = 256;

/// Encoder widths expected per backbone family (c1, c4)
pub const COMPACT_C1_C4: (usize, usize) = (24, 320);
pub const STANDARD_C1_C4: (usize, usize) = (256, 2048);

/// Training defaults
pub const DEFAULT_OUTPUT_STRIDE: usize = 16;
pub const DEFAULT_AUX_WEIGHT: f32 = 0.4;
pub const DEFAULT_DECODER_LR_MULTIPLIER: f64 = 10.0;
pub const IGNORE_INDEX: i64 = -1;

/// Identity of a training run. Replaces the process-wide configuration object:
/// every consumer receives one of these explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    pub backbone: String,
    pub dataset: String,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Run timestamp, fixed when the run starts
    #[serde(default = "timestamp_now")]
    pub timestamp: String,
}

impl RunConfig {
    pub fn new(backbone: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            model_name: default_model_name(),
            backbone: backbone.into(),
            dataset: dataset.into(),
            save_dir: default_save_dir(),
            timestamp: timestamp_now(),
        }
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = dir.into();
        self
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid run config {}", path.display()))
    }
}

fn default_model_name() -> String {
    MODEL_NAME.to_string()
}

fn default_save_dir() -> PathBuf {
    PathBuf::from(MODEL_SAVE_DIR)
}

fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H-%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_defaults_fill_in() {
        let cfg: RunConfig =
            serde_json::from_str(r#"{"backbone": "resnet50", "dataset": "pascal_voc"}"#).unwrap();
        assert_eq!(cfg.model_name, MODEL_NAME);
        assert_eq!(cfg.save_dir, PathBuf::from(MODEL_SAVE_DIR));
        assert!(!cfg.timestamp.is_empty());
    }
}
