use burn::{
    config::Config,
    tensor::{activation::log_softmax, backend::Backend, Int, Tensor},
};

use crate::config::{DEFAULT_AUX_WEIGHT, IGNORE_INDEX};
use crate::nn::model::SegmentationOutput;

/// Pixel-wise softmax cross-entropy over every model output, with the
/// auxiliary output down-weighted.
#[derive(Config, Debug)]
pub struct SegmentationLossConfig {
    #[config(default = "DEFAULT_AUX_WEIGHT")]
    pub aux_weight: f32,
    /// Target value marking unlabeled pixels
    #[config(default = "IGNORE_INDEX")]
    pub ignore_index: i64,
}

impl SegmentationLossConfig {
    pub fn init(&self) -> SegmentationLoss {
        SegmentationLoss {
            aux_weight: self.aux_weight,
            ignore_index: self.ignore_index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentationLoss {
    aux_weight: f32,
    ignore_index: i64,
}

impl SegmentationLoss {
    /// Scalar loss. `targets` is `[N, H, W]` with class indices in
    /// `0..num_classes` or the ignore index.
    pub fn forward<B: Backend>(
        &self,
        output: SegmentationOutput<B>,
        targets: Tensor<B, 3, Int>,
    ) -> Tensor<B, 1> {
        let loss = cross_entropy(output.logits, targets.clone(), self.ignore_index);
        match output.aux {
            Some(aux) => {
                let aux_loss = cross_entropy(aux, targets, self.ignore_index);
                loss + aux_loss.mul_scalar(self.aux_weight)
            }
            None => loss,
        }
    }
}

/// Mean negative log-likelihood over pixels whose target is not `ignore_index`.
/// Returns zero when every pixel is ignored.
pub fn cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    ignore_index: i64,
) -> Tensor<B, 1> {
    let ignored = targets.clone().equal_elem(ignore_index);
    let valid = ignored.clone().bool_not().float();
    let safe_targets = targets.mask_fill(ignored, 0);

    let log_probs = log_softmax(logits, 1);
    let picked = log_probs
        .gather(1, safe_targets.unsqueeze_dim::<4>(1))
        .squeeze::<3>(1);

    let count = valid.clone().sum().clamp_min(1.0);
    (picked.neg() * valid).sum().div(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn test_uniform_logits_give_log_num_classes() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([2, 5, 3, 3], &device);
        let targets = Tensor::<B, 3, Int>::ones([2, 3, 3], &device);
        let loss = scalar(cross_entropy(logits, targets, -1));
        assert!((loss - 5.0_f32.ln()).abs() < 1e-5, "got {}", loss);
    }

    #[test]
    fn test_ignored_pixels_do_not_count() {
        let device = Default::default();
        // Pixel 0 predicts class 0 confidently, pixel 1 predicts class 1
        let logits = Tensor::<B, 1>::from_floats([10.0, -10.0, -10.0, 10.0], &device)
            .reshape([1, 2, 1, 2]);

        let all = Tensor::<B, 1, Int>::from_ints([0, 0], &device).reshape([1, 1, 2]);
        let masked = Tensor::<B, 1, Int>::from_ints([0, -1], &device).reshape([1, 1, 2]);

        let with_wrong = scalar(cross_entropy(logits.clone(), all, -1));
        let without = scalar(cross_entropy(logits, masked, -1));
        assert!(with_wrong > 5.0, "misclassified pixel should dominate, got {}", with_wrong);
        assert!(without < 1e-3, "ignored pixel leaked into loss: {}", without);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::ones([1, 3, 2, 2], &device);
        let targets = Tensor::<B, 3, Int>::ones([1, 2, 2], &device).neg();
        assert_eq!(scalar(cross_entropy(logits, targets, -1)), 0.0);
    }

    #[test]
    fn test_aux_output_is_weighted() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([1, 4, 2, 2], &device);
        let targets = Tensor::<B, 3, Int>::zeros([1, 2, 2], &device);
        let loss = SegmentationLossConfig::new().init();

        let primary = scalar(loss.forward(
            SegmentationOutput { logits: logits.clone(), aux: None },
            targets.clone(),
        ));
        let combined = scalar(loss.forward(
            SegmentationOutput { logits: logits.clone(), aux: Some(logits) },
            targets,
        ));
        assert!((combined - primary * 1.4).abs() < 1e-5);
    }
}
