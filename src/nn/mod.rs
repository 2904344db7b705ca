pub mod aspp;
pub mod backbone;
pub mod blocks;
pub mod dataset;
pub mod fcn_head;
pub mod head;
pub mod loss;
pub mod lr_scheduler;
pub mod model;
pub mod ops;
pub mod persistence;
pub mod training;

/// Type alias for a model used for inference (NdArray backend, always available)
pub type InferenceModel = model::DeepLabV3Plus<burn::backend::NdArray>;
