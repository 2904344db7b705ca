use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::CheckpointError;
use crate::nn::lr_scheduler::WarmupPolyLr;

const BEST_MODEL_STEM: &str = "best_model";
const OPTIMIZER_SUFFIX: &str = "-optim";
const RECORD_EXTENSION: &str = "mpk.gz";

/// Metadata saved alongside each epoch checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    pub saved_at: String,
    pub scheduler: WarmupPolyLr,
    /// Loss of the current `best_model` snapshot, if one was taken
    #[serde(default)]
    pub best_loss: Option<f64>,
}

/// Result of an epoch save
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(PathBuf),
    /// A checkpoint for this epoch was already on disk and was left untouched
    AlreadyExists(PathBuf),
}

fn recorder() -> NamedMpkGzFileRecorder<FullPrecisionSettings> {
    NamedMpkGzFileRecorder::<FullPrecisionSettings>::default()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Create a directory and its parents; an existing directory is not an error.
pub fn ensure_dir(path: &Path) -> Result<(), CheckpointError> {
    std::fs::create_dir_all(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Directory holding the checkpoints of one training run.
///
/// Layout: `{epoch}.mpk.gz` (parameters), `{epoch}-optim.mpk.gz` (optimizer
/// state), `{epoch}.json` (metadata) and `best_model.mpk.gz` (parameters only).
/// Only the latest epoch is kept; the best snapshot is independent.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    /// `{save_dir}/{model}_{backbone}_{dataset}_{timestamp}`
    pub fn new(run: &RunConfig) -> Self {
        let name = format!(
            "{}_{}_{}_{}",
            run.model_name, run.backbone, run.dataset, run.timestamp
        );
        Self {
            dir: expand_home(&run.save_dir).join(name),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path without extension; the recorder appends `.mpk.gz`
    fn stem(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.record_path(&epoch.to_string())
    }

    pub fn optimizer_path(&self, epoch: usize) -> PathBuf {
        self.record_path(&format!("{epoch}{OPTIMIZER_SUFFIX}"))
    }

    pub fn metadata_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{epoch}.json"))
    }

    pub fn best_path(&self) -> PathBuf {
        self.record_path(BEST_MODEL_STEM)
    }

    /// Save either the best snapshot (parameters only) or a full epoch checkpoint.
    pub fn save_checkpoint<B, M, O>(
        &self,
        model: &M,
        epoch: usize,
        optimizer: &O,
        scheduler: &WarmupPolyLr,
        best_loss: Option<f64>,
        is_best: bool,
    ) -> Result<SaveOutcome, CheckpointError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if is_best {
            self.save_best::<B, M>(model).map(SaveOutcome::Saved)
        } else {
            self.save_epoch::<B, M, O>(model, epoch, optimizer, scheduler, best_loss)
        }
    }

    /// Write parameters to `best_model.mpk.gz`, replacing any previous best.
    pub fn save_best<B: Backend, M: Module<B>>(&self, model: &M) -> Result<PathBuf, CheckpointError> {
        ensure_dir(&self.dir)?;
        let path = self.best_path();

        model
            .clone()
            .save_file(self.stem(BEST_MODEL_STEM), &recorder())
            .map_err(|e| CheckpointError::Recorder {
                path: path.clone(),
                message: e.to_string(),
            })?;

        tracing::info!("Best model saved in: {}", path.display());
        Ok(path)
    }

    /// Write a full checkpoint for `epoch` unless one already exists, then
    /// drop the previous epoch's files.
    pub fn save_epoch<B, M, O>(
        &self,
        model: &M,
        epoch: usize,
        optimizer: &O,
        scheduler: &WarmupPolyLr,
        best_loss: Option<f64>,
    ) -> Result<SaveOutcome, CheckpointError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        ensure_dir(&self.dir)?;
        let path = self.epoch_path(epoch);

        let outcome = if path.exists() {
            tracing::debug!("Epoch {} checkpoint already exists, skipping", epoch);
            SaveOutcome::AlreadyExists(path)
        } else {
            self.write_epoch::<B, M, O>(model, epoch, optimizer, scheduler, best_loss)?;
            tracing::info!("Epoch {} model saved in: {}", epoch, path.display());
            SaveOutcome::Saved(path)
        };

        if let Some(previous) = epoch.checked_sub(1) {
            self.remove_epoch(previous);
        }

        Ok(outcome)
    }

    fn write_epoch<B, M, O>(
        &self,
        model: &M,
        epoch: usize,
        optimizer: &O,
        scheduler: &WarmupPolyLr,
        best_loss: Option<f64>,
    ) -> Result<(), CheckpointError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let optimizer_name = format!("{epoch}{OPTIMIZER_SUFFIX}");
        Recorder::<B>::record(&recorder(), optimizer.to_record(), self.stem(&optimizer_name))
            .map_err(|e| CheckpointError::Recorder {
                path: self.optimizer_path(epoch),
                message: e.to_string(),
            })?;

        let metadata = CheckpointMetadata {
            epoch,
            saved_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            scheduler: scheduler.clone(),
            best_loss,
        };
        let metadata_path = self.metadata_path(epoch);
        let json = serde_json::to_string_pretty(&metadata).map_err(|source| {
            CheckpointError::Metadata {
                path: metadata_path.clone(),
                source,
            }
        })?;
        std::fs::write(&metadata_path, json).map_err(|source| CheckpointError::Io {
            path: metadata_path.clone(),
            source,
        })?;

        // Parameters last: their presence marks the epoch as complete
        model
            .clone()
            .save_file(self.stem(&epoch.to_string()), &recorder())
            .map_err(|e| CheckpointError::Recorder {
                path: self.epoch_path(epoch),
                message: e.to_string(),
            })
    }

    /// Best-effort removal of an epoch's files. Failures are logged, never returned.
    pub fn remove_epoch(&self, epoch: usize) {
        let files = [
            self.epoch_path(epoch),
            self.optimizer_path(epoch),
            self.metadata_path(epoch),
        ];
        for file in files.iter().filter(|f| f.exists()) {
            if let Err(e) = std::fs::remove_file(file) {
                tracing::warn!("Failed to remove stale checkpoint {}: {}", file.display(), e);
            }
        }
    }

    /// Highest epoch with a parameter file in this directory
    pub fn latest_epoch(&self) -> Option<usize> {
        let suffix = format!(".{RECORD_EXTENSION}");
        std::fs::read_dir(&self.dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(&suffix)?.parse::<usize>().ok()
            })
            .max()
    }

    /// Load the parameters of an epoch checkpoint into `model`.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        model: M,
        epoch: usize,
        device: &B::Device,
    ) -> Result<M, CheckpointError> {
        model
            .load_file(self.stem(&epoch.to_string()), &recorder(), device)
            .map_err(|e| CheckpointError::Recorder {
                path: self.epoch_path(epoch),
                message: e.to_string(),
            })
    }

    pub fn load_best<B: Backend, M: Module<B>>(
        &self,
        model: M,
        device: &B::Device,
    ) -> Result<M, CheckpointError> {
        model
            .load_file(self.stem(BEST_MODEL_STEM), &recorder(), device)
            .map_err(|e| CheckpointError::Recorder {
                path: self.best_path(),
                message: e.to_string(),
            })
    }

    pub fn load_metadata(&self, epoch: usize) -> Result<CheckpointMetadata, CheckpointError> {
        let path = self.metadata_path(epoch);
        let text = std::fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CheckpointError::Metadata { path, source })
    }

    /// Restore model, optimizer and metadata to resume training after `epoch`.
    pub fn load_checkpoint<B, M, O>(
        &self,
        model: M,
        optimizer: O,
        epoch: usize,
        device: &B::Device,
    ) -> Result<(M, O, CheckpointMetadata), CheckpointError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let model = self.load_model::<B, M>(model, epoch, device)?;

        let optimizer_name = format!("{epoch}{OPTIMIZER_SUFFIX}");
        let record = Recorder::<B>::load(&recorder(), self.stem(&optimizer_name), device)
            .map_err(|e| CheckpointError::Recorder {
                path: self.optimizer_path(epoch),
                message: e.to_string(),
            })?;
        let optimizer = optimizer.load_record(record);

        let metadata = self.load_metadata(epoch)?;
        tracing::info!(
            "Checkpoint loaded from {} (epoch {}, saved {})",
            self.epoch_path(epoch).display(),
            metadata.epoch,
            metadata.saved_at
        );

        Ok((model, optimizer, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        nn::{Linear, LinearConfig},
        optim::AdamConfig,
    };

    type B = Autodiff<NdArray>;

    fn model() -> Linear<B> {
        LinearConfig::new(4, 2).init(&Default::default())
    }

    fn checkpoint_dir() -> (tempfile::TempDir, CheckpointDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CheckpointDir::at(tmp.path().join("run"));
        (tmp, dir)
    }

    #[test]
    fn test_run_directory_name() {
        let mut run = RunConfig::new("resnet50", "pascal_voc").with_save_dir("/tmp/ckpt");
        run.timestamp = "2024-01-02-03-04".into();
        let dir = CheckpointDir::new(&run);
        assert_eq!(
            dir.path(),
            Path::new("/tmp/ckpt/deeplabv3_plus_resnet50_pascal_voc_2024-01-02-03-04")
        );
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/path")), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/runs")), home.join("runs"));
        }
    }

    #[test]
    fn test_ensure_dir_accepts_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_same_epoch_is_not_overwritten() {
        let (_tmp, dir) = checkpoint_dir();
        let optim = AdamConfig::new().init::<B, Linear<B>>();
        let sched = WarmupPolyLr::new(0.01, 10);

        let first = dir.save_epoch::<B, _, _>(&model(), 3, &optim, &sched, None).unwrap();
        assert_eq!(first, SaveOutcome::Saved(dir.epoch_path(3)));
        let before = std::fs::read(dir.epoch_path(3)).unwrap();

        let second = dir.save_epoch::<B, _, _>(&model(), 3, &optim, &sched, None).unwrap();
        assert_eq!(second, SaveOutcome::AlreadyExists(dir.epoch_path(3)));
        assert_eq!(std::fs::read(dir.epoch_path(3)).unwrap(), before);
    }

    #[test]
    fn test_previous_epoch_is_removed() {
        let (_tmp, dir) = checkpoint_dir();
        let optim = AdamConfig::new().init::<B, Linear<B>>();
        let sched = WarmupPolyLr::new(0.01, 10);

        dir.save_epoch::<B, _, _>(&model(), 0, &optim, &sched, None).unwrap();
        dir.save_epoch::<B, _, _>(&model(), 1, &optim, &sched, None).unwrap();

        assert!(!dir.epoch_path(0).exists());
        assert!(!dir.optimizer_path(0).exists());
        assert!(!dir.metadata_path(0).exists());
        assert!(dir.epoch_path(1).exists());
        assert_eq!(dir.latest_epoch(), Some(1));

        // Epoch 2's predecessor is removed here; epoch 5's is already absent
        dir.save_epoch::<B, _, _>(&model(), 2, &optim, &sched, None).unwrap();
        dir.save_epoch::<B, _, _>(&model(), 5, &optim, &sched, None).unwrap();
        assert!(!dir.epoch_path(1).exists());
        assert!(dir.epoch_path(2).exists());
        assert!(dir.epoch_path(5).exists());
    }

    #[test]
    fn test_failed_stale_removal_is_not_fatal() {
        let (_tmp, dir) = checkpoint_dir();
        let optim = AdamConfig::new().init::<B, Linear<B>>();
        let sched = WarmupPolyLr::new(0.01, 10);

        // A directory where epoch 0's record should be makes remove_file fail
        std::fs::create_dir_all(dir.epoch_path(0)).unwrap();

        let outcome = dir.save_epoch::<B, _, _>(&model(), 1, &optim, &sched, None).unwrap();
        assert_eq!(outcome, SaveOutcome::Saved(dir.epoch_path(1)));
        assert!(dir.epoch_path(0).is_dir());
        assert!(dir.epoch_path(1).is_file());
    }

    #[test]
    fn test_metadata_without_best_loss_still_loads() {
        let (_tmp, dir) = checkpoint_dir();
        ensure_dir(dir.path()).unwrap();
        let sched = WarmupPolyLr::new(0.01, 10);
        let json = format!(
            r#"{{"epoch": 2, "saved_at": "2024-01-01 00:00:00", "scheduler": {}}}"#,
            serde_json::to_string(&sched).unwrap()
        );
        std::fs::write(dir.metadata_path(2), json).unwrap();

        let metadata = dir.load_metadata(2).unwrap();
        assert_eq!(metadata.epoch, 2);
        assert_eq!(metadata.best_loss, None);
    }

    #[test]
    fn test_best_snapshot_is_parameters_only() {
        let (_tmp, dir) = checkpoint_dir();
        let optim = AdamConfig::new().init::<B, Linear<B>>();
        let sched = WarmupPolyLr::new(0.01, 10);

        let outcome = dir
            .save_checkpoint::<B, _, _>(&model(), 4, &optim, &sched, None, true)
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Saved(dir.best_path()));
        assert!(dir.best_path().exists());
        assert!(!dir.epoch_path(4).exists());
        assert!(!dir.optimizer_path(4).exists());

        // A second best overwrites the first
        dir.save_checkpoint::<B, _, _>(&model(), 5, &optim, &sched, None, true).unwrap();
        assert!(dir.best_path().exists());
        assert_eq!(dir.latest_epoch(), None);
    }

    #[test]
    fn test_checkpoint_round_trip_restores_state() {
        let (_tmp, dir) = checkpoint_dir();
        let device = <B as burn::tensor::backend::Backend>::Device::default();
        let saved = model();
        let optim = AdamConfig::new().init::<B, Linear<B>>();
        let mut sched = WarmupPolyLr::new(0.01, 10);
        sched.step();

        dir.save_epoch::<B, _, _>(&saved, 7, &optim, &sched, Some(0.25)).unwrap();

        let fresh_optim = AdamConfig::new().init::<B, Linear<B>>();
        let (restored, _optim, metadata) = dir
            .load_checkpoint::<B, _, _>(model(), fresh_optim, 7, &device)
            .unwrap();

        assert_eq!(metadata.epoch, 7);
        assert_eq!(metadata.scheduler, sched);
        assert_eq!(metadata.best_loss, Some(0.25));
        let expected = saved.weight.val().into_data().to_vec::<f32>().unwrap();
        let actual = restored.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let (_tmp, dir) = checkpoint_dir();
        let result = dir.load_best::<B, _>(model(), &Default::default());
        assert!(matches!(result, Err(CheckpointError::Recorder { .. })));
    }
}
