pub mod capability;
pub mod config;
pub mod error;
pub mod nn;

pub use error::{CapabilityError, CheckpointError, DatasetError, ModelError, TrainError};
pub use nn::model::{DeepLabV3Plus, DeepLabV3PlusConfig, ModelPart, SegmentationOutput};
