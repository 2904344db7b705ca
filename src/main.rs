mod cli;

use anyhow::{Context, Result};
use burn::{backend::NdArray, module::Module, tensor::Tensor};
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use deeplab_burn::capability::CapabilityRegistry;
use deeplab_burn::config::RunConfig;
use deeplab_burn::nn::backbone::BackboneKind;
use deeplab_burn::nn::dataset::synthetic_dataset;
use deeplab_burn::nn::InferenceModel;
use deeplab_burn::nn::training::{train, TrainingConfig};
use deeplab_burn::DeepLabV3PlusConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let capabilities = CapabilityRegistry::with_defaults();

    match cli.command {
        Command::Inspect {
            backbone,
            num_classes,
            aux,
            output_stride,
            size,
        } => {
            let backbone: BackboneKind = backbone.parse()?;
            let config = DeepLabV3PlusConfig::new(num_classes)
                .with_backbone(backbone)
                .with_aux(aux)
                .with_output_stride(output_stride);
            inspect(&config, size)
        }
        Command::Probe => {
            for (name, available) in capabilities.probe_all() {
                let status = if available { "available" } else { "missing" };
                println!("{name:<12} {status}");
            }
            if let Ok(Some(gpu)) = capabilities.gpu_info() {
                println!(
                    "GPU: {} ({} / {} MB, {:.0}% util, {:.0} C)",
                    gpu.name,
                    gpu.vram_used_mb,
                    gpu.vram_total_mb,
                    gpu.utilization_percent,
                    gpu.temperature_c
                );
            }
            Ok(())
        }
        Command::TrainSynthetic {
            backbone,
            num_classes,
            aux,
            samples,
            size,
            epochs,
            batch_size,
            lr,
            decoder_lr_multiplier,
            save_dir,
            resume,
            gpu,
        } => {
            if gpu {
                capabilities
                    .require("wgpu")
                    .context("GPU training requested")?;
            }

            let kind: BackboneKind = backbone.parse()?;
            let config = TrainingConfig::new(
                DeepLabV3PlusConfig::new(num_classes)
                    .with_backbone(kind)
                    .with_aux(aux),
            )
            .with_epochs(epochs)
            .with_batch_size(batch_size)
            .with_learning_rate(lr)
            .with_decoder_lr_multiplier(decoder_lr_multiplier)
            .with_resume(resume);
            let run = RunConfig::new(kind.as_str(), "synthetic").with_save_dir(save_dir);

            let dataset = synthetic_dataset(samples, size, size, num_classes);
            let history = train(&config, &run, dataset, gpu).context("Training failed")?;

            if let Some(last) = history.last() {
                println!(
                    "Finished {} epochs, final loss {:.6}",
                    history.len(),
                    last.loss
                );
            }
            Ok(())
        }
    }
}

fn inspect(config: &DeepLabV3PlusConfig, size: usize) -> Result<()> {
    let device = Default::default();
    let model: InferenceModel = config
        .init(&device)
        .with_context(|| format!("Failed to build model with backbone {}", config.backbone))?;

    let input = Tensor::<NdArray, 4>::zeros([1, 3, size, size], &device);
    let output = model.try_forward(input)?;

    println!("backbone:   {}", config.backbone);
    println!("parameters: {}", model.num_params());
    println!("logits:     {:?}", output.logits.dims());
    match output.aux {
        Some(aux) => println!("aux:        {:?}", aux.dims()),
        None => println!("aux:        disabled"),
    }
    Ok(())
}
