use std::path::PathBuf;

use clap::{Parser, Subcommand};
use deeplab_burn::config::{DEFAULT_DECODER_LR_MULTIPLIER, DEFAULT_OUTPUT_STRIDE, MODEL_SAVE_DIR};

#[derive(Parser, Debug)]
#[command(name = "deeplab", version, about = "DeepLabV3+ semantic segmentation")]
pub struct Cli {
    /// Log filter, overridden by RUST_LOG when set
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a model, run a dummy forward pass and print its output shapes
    Inspect {
        /// Backbone identifier (mobilenet_v2, resnet50, resnet101, resnet152)
        #[arg(long, default_value = "resnet50")]
        backbone: String,

        #[arg(long, default_value_t = 21)]
        num_classes: usize,

        /// Attach the auxiliary FCN head
        #[arg(long)]
        aux: bool,

        #[arg(long, default_value_t = DEFAULT_OUTPUT_STRIDE)]
        output_stride: usize,

        /// Side of the square dummy input
        #[arg(long, default_value_t = 64)]
        size: usize,
    },

    /// Probe optional capabilities and report which are available
    Probe,

    /// Train on a generated toy dataset, writing checkpoints to disk
    TrainSynthetic {
        #[arg(long, default_value = "mobilenet_v2")]
        backbone: String,

        #[arg(long, default_value_t = 3)]
        num_classes: usize,

        #[arg(long)]
        aux: bool,

        #[arg(long, default_value_t = 8)]
        samples: usize,

        /// Side of the square training images
        #[arg(long, default_value_t = 64)]
        size: usize,

        #[arg(long, default_value_t = 2)]
        epochs: usize,

        #[arg(long, default_value_t = 2)]
        batch_size: usize,

        #[arg(long, default_value_t = 1e-3)]
        lr: f64,

        #[arg(long, default_value_t = DEFAULT_DECODER_LR_MULTIPLIER)]
        decoder_lr_multiplier: f64,

        #[arg(long, default_value = MODEL_SAVE_DIR)]
        save_dir: PathBuf,

        /// Continue from the latest checkpoint in the run directory
        #[arg(long)]
        resume: bool,

        /// Train on the wgpu backend (requires the `wgpu` feature)
        #[arg(long)]
        gpu: bool,
    },
}
