use std::time::Instant;

use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::Module,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use sysinfo::System;

use crate::config::{RunConfig, DEFAULT_AUX_WEIGHT, DEFAULT_DECODER_LR_MULTIPLIER};
use crate::error::TrainError;
use crate::nn::dataset::{SegmentationBatch, SegmentationBatcher, SegmentationDataset};
use crate::nn::loss::{SegmentationLoss, SegmentationLossConfig};
use crate::nn::lr_scheduler::WarmupPolyLr;
use crate::nn::model::{DeepLabV3Plus, DeepLabV3PlusConfig, ModelPart};
use crate::nn::persistence::CheckpointDir;

/// CPU training backend: NdArray with autodiff
pub type CpuBackend = Autodiff<NdArray>;

/// GPU training backend: Wgpu with autodiff
#[cfg(feature = "wgpu")]
pub type GpuBackend = Autodiff<burn::backend::Wgpu>;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: DeepLabV3PlusConfig,
    #[config(default = 50)]
    pub epochs: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Decoder parts train at `learning_rate * decoder_lr_multiplier`
    #[config(default = "DEFAULT_DECODER_LR_MULTIPLIER")]
    pub decoder_lr_multiplier: f64,
    #[config(default = "DEFAULT_AUX_WEIGHT")]
    pub aux_weight: f32,
    #[config(default = 0)]
    pub warmup_iters: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Continue from the latest checkpoint in the run directory if present
    #[config(default = false)]
    pub resume: bool,
}

/// Per-epoch statistics
#[derive(Debug, Clone)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub learning_rate: f64,
    pub epoch_ms: u64,
    pub samples_per_sec: f64,
    pub memory_used_mb: u64,
}

pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: DeepLabV3Plus<B>,
    pub history: Vec<EpochStats>,
    pub best_loss: f64,
}

/// Run training, selecting GPU or CPU backend.
pub fn train(
    config: &TrainingConfig,
    run: &RunConfig,
    dataset: SegmentationDataset,
    use_gpu: bool,
) -> Result<Vec<EpochStats>, TrainError> {
    if use_gpu {
        #[cfg(feature = "wgpu")]
        {
            tracing::info!("Starting GPU training with Wgpu backend");
            let device = burn::backend::wgpu::WgpuDevice::default();
            return fit::<GpuBackend>(config, run, dataset, device).map(|o| o.history);
        }

        #[cfg(not(feature = "wgpu"))]
        tracing::warn!("Built without the wgpu feature, training on CPU instead");
    }

    tracing::info!("Starting CPU training with NdArray backend");
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;
    fit::<CpuBackend>(config, run, dataset, device).map(|o| o.history)
}

/// One optimisation step: forward, loss, backward, then an optimizer step per
/// model part so decoder parts get the boosted learning rate.
pub fn train_step<B, O>(
    model: DeepLabV3Plus<B>,
    optim: &mut O,
    batch: SegmentationBatch<B>,
    loss_fn: &SegmentationLoss,
    lr: f64,
    decoder_lr_multiplier: f64,
) -> (DeepLabV3Plus<B>, f64)
where
    B: AutodiffBackend,
    O: Optimizer<DeepLabV3Plus<B>, B>,
{
    let output = model.forward(batch.images);
    let loss = loss_fn.forward(output, batch.masks);

    let loss_val = loss.clone().into_data().to_vec::<f32>().unwrap_or_default();
    let loss_scalar = loss_val.first().copied().unwrap_or(f32::NAN) as f64;

    // Split gradients per part before any parameter is replaced
    let mut grads = loss.backward();
    let mut groups = Vec::with_capacity(3);
    for part in std::iter::once(ModelPart::Encoder).chain(model.decoder_parts()) {
        let (part_grads, part_lr) = match part {
            ModelPart::Encoder => (
                GradientsParams::from_module(&mut grads, model.encoder()),
                lr,
            ),
            ModelPart::Head => (
                GradientsParams::from_module(&mut grads, model.head()),
                lr * decoder_lr_multiplier,
            ),
            ModelPart::AuxLayer => match model.auxlayer() {
                Some(aux) => (
                    GradientsParams::from_module(&mut grads, aux),
                    lr * decoder_lr_multiplier,
                ),
                None => continue,
            },
        };
        groups.push((part_grads, part_lr));
    }

    let model = groups
        .into_iter()
        .fold(model, |model, (grads, part_lr)| optim.step(part_lr, model, grads));

    (model, loss_scalar)
}

/// Generic training loop that works with any autodiff backend.
pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    run: &RunConfig,
    dataset: SegmentationDataset,
    device: B::Device,
) -> Result<TrainingOutcome<B>, TrainError> {
    if config.batch_size == 0 {
        return Err(TrainError::ZeroBatchSize);
    }
    let total = dataset.len();
    if total < config.batch_size {
        return Err(TrainError::DatasetTooSmall {
            samples: total,
            batch_size: config.batch_size,
        });
    }

    // System info for compute stats
    let mut sys = System::new_all();
    sys.refresh_all();

    let batcher = SegmentationBatcher::<B>::new(device.clone());
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .build(dataset);

    let mut model = config.model.init::<B>(&device)?;
    let mut optim = AdamConfig::new().init::<B, DeepLabV3Plus<B>>();
    let loss_fn = SegmentationLossConfig::new()
        .with_aux_weight(config.aux_weight)
        .init();

    let iters_per_epoch = total.div_ceil(config.batch_size);
    let mut scheduler = WarmupPolyLr::new(config.learning_rate, config.epochs * iters_per_epoch)
        .with_warmup(config.warmup_iters, 1.0 / 3.0);

    let checkpoints = CheckpointDir::new(run);
    let mut start_epoch = 0;
    let mut best_loss = f64::INFINITY;
    if config.resume {
        if let Some(epoch) = checkpoints.latest_epoch() {
            let (restored, restored_optim, metadata) =
                checkpoints.load_checkpoint::<B, _, _>(model, optim, epoch, &device)?;
            model = restored;
            optim = restored_optim;
            scheduler = metadata.scheduler;
            best_loss = metadata.best_loss.unwrap_or(f64::INFINITY);
            start_epoch = epoch + 1;
            tracing::info!("Resuming from epoch {}", epoch);
        }
    }

    tracing::info!(
        "Training {} samples for {} epochs ({} params), checkpoints in {}",
        total,
        config.epochs,
        model.num_params(),
        checkpoints.path().display()
    );

    let mut history = Vec::with_capacity(config.epochs.saturating_sub(start_epoch));

    for epoch in start_epoch..config.epochs {
        let epoch_start = Instant::now();
        let mut epoch_loss = 0.0;
        let mut batch_count = 0;
        let mut samples_this_epoch = 0_usize;
        let mut lr = scheduler.current_lr();

        for batch in dataloader.iter() {
            let batch_size = batch.images.dims()[0];
            lr = scheduler.step();

            let (updated, loss) = train_step(
                model,
                &mut optim,
                batch,
                &loss_fn,
                lr,
                config.decoder_lr_multiplier,
            );
            model = updated;

            epoch_loss += loss;
            batch_count += 1;
            samples_this_epoch += batch_size;
        }

        let epoch_ms = epoch_start.elapsed().as_millis() as u64;
        let avg_loss = if batch_count > 0 {
            epoch_loss / batch_count as f64
        } else {
            f64::NAN
        };
        let samples_per_sec = if epoch_ms > 0 {
            samples_this_epoch as f64 / (epoch_ms as f64 / 1000.0)
        } else {
            0.0
        };

        sys.refresh_memory();
        let stats = EpochStats {
            epoch,
            loss: avg_loss,
            learning_rate: lr,
            epoch_ms,
            samples_per_sec,
            memory_used_mb: sys.used_memory() / (1024 * 1024),
        };
        tracing::info!(
            "Epoch {}/{}: loss {:.6}, lr {:.2e}, {} ms ({:.1} samples/s, {} MB used)",
            epoch + 1,
            config.epochs,
            stats.loss,
            stats.learning_rate,
            stats.epoch_ms,
            stats.samples_per_sec,
            stats.memory_used_mb
        );
        history.push(stats);

        if avg_loss < best_loss {
            best_loss = avg_loss;
            checkpoints.save_checkpoint::<B, _, _>(
                &model,
                epoch,
                &optim,
                &scheduler,
                None,
                true,
            )?;
        }
        let stored_best = best_loss.is_finite().then_some(best_loss);
        checkpoints.save_checkpoint::<B, _, _>(
            &model,
            epoch,
            &optim,
            &scheduler,
            stored_best,
            false,
        )?;
    }

    Ok(TrainingOutcome {
        model,
        history,
        best_loss,
    })
}
