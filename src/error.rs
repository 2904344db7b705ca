use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or running the segmentation model
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown backbone '{0}' (expected one of: mobilenet_v2, resnet50, resnet101, resnet152)")]
    UnknownBackbone(String),

    #[error("backbone {backbone} provides {found} channels for {feature}, decoder expects {expected}")]
    ChannelMismatch {
        backbone: String,
        feature: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("unsupported output stride {0}")]
    UnsupportedOutputStride(usize),

    #[error("input must be [N, 3, H, W], got {0:?}")]
    InputShape([usize; 4]),
}

/// Errors raised while writing or reading checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to record {path}: {message}")]
    Recorder { path: PathBuf, message: String },

    #[error("invalid checkpoint metadata at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while assembling segmentation samples
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{buffer} buffer has {found} values, expected {expected} for {height}x{width}")]
    BufferLength {
        buffer: &'static str,
        expected: usize,
        found: usize,
        height: usize,
        width: usize,
    },

    #[error("sample {index} is {found:?} (height, width), dataset samples are {expected:?}")]
    SizeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Errors raised when an optional capability is requested
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{name} is unavailable: {remediation}")]
    Unavailable { name: String, remediation: String },

    #[error("no capability named '{0}' is registered")]
    Unknown(String),
}

/// Errors that abort a training run
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("dataset has {samples} samples, need at least one batch of {batch_size}")]
    DatasetTooSmall { samples: usize, batch_size: usize },
}
