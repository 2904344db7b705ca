use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig,
    },
    tensor::{backend::Backend, Tensor},
};

use super::{dilate_stage, EncoderChannels, EncoderFeatures};
use crate::error::ModelError;
use crate::nn::blocks::{ConvBnRelu, ConvBnReluConfig};

/// Inverted residual settings: (expansion, channels, repeats, stride)
const STAGES: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// Stage indices whose outputs become c1..c4
const TAPS: [usize; 4] = [1, 2, 4, 6];

const STEM_CHANNELS: usize = 32;

/// Round to a multiple of 8 without dropping more than 10%
fn make_divisible(value: f64) -> usize {
    let divisor = 8;
    let rounded = ((value + divisor as f64 / 2.0) as usize / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    #[config(default = 16)]
    pub output_stride: usize,
    #[config(default = 1.0)]
    pub width_mult: f64,
}

impl MobileNetV2Config {
    fn width(&self, channels: usize) -> usize {
        make_divisible(channels as f64 * self.width_mult)
    }

    pub fn channels(&self) -> EncoderChannels {
        let [c1, c2, c3, c4] = TAPS.map(|i| self.width(STAGES[i].1));
        EncoderChannels { c1, c2, c3, c4 }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<MobileNetV2<B>, ModelError> {
        if !matches!(self.output_stride, 8 | 16 | 32) {
            return Err(ModelError::UnsupportedOutputStride(self.output_stride));
        }

        let mut in_channels = self.width(STEM_CHANNELS);
        let stem = ConvBnReluConfig::new(3, in_channels, 3)
            .with_stride(2)
            .with_padding(1)
            .with_relu6(true)
            .init(device);

        let mut current_stride = 2;
        let mut dilation = 1;
        let mut stages = Vec::with_capacity(STAGES.len());

        for &(expansion, channels, repeats, stride) in STAGES.iter() {
            let out_channels = self.width(channels);
            let (stride, first_dilation) =
                dilate_stage(&mut current_stride, &mut dilation, stride, self.output_stride);

            let blocks = (0..repeats)
                .map(|i| {
                    let block = InvertedResidualConfig {
                        in_channels,
                        out_channels,
                        stride: if i == 0 { stride } else { 1 },
                        dilation: if i == 0 { first_dilation } else { dilation },
                        expansion,
                    }
                    .init::<B>(device);
                    in_channels = out_channels;
                    block
                })
                .collect();

            stages.push(MobileStage { blocks });
        }

        Ok(MobileNetV2 { stem, stages })
    }
}

struct InvertedResidualConfig {
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    dilation: usize,
    expansion: usize,
}

impl InvertedResidualConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let hidden = self.in_channels * self.expansion;

        let expand = (self.expansion != 1).then(|| {
            ConvBnReluConfig::new(self.in_channels, hidden, 1)
                .with_relu6(true)
                .init(device)
        });

        let depthwise = ConvBnReluConfig::new(hidden, hidden, 3)
            .with_stride(self.stride)
            .with_padding(self.dilation)
            .with_dilation(self.dilation)
            .with_groups(hidden)
            .with_relu6(true)
            .init(device);

        InvertedResidual {
            expand,
            depthwise,
            project: Conv2dConfig::new([hidden, self.out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            project_bn: BatchNormConfig::new(self.out_channels).init(device),
            use_residual: self.stride == 1 && self.in_channels == self.out_channels,
        }
    }
}

#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBnRelu<B>>,
    depthwise: ConvBnRelu<B>,
    project: Conv2d<B>,
    project_bn: BatchNorm<B, 2>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.expand {
            Some(expand) => expand.forward(x.clone()),
            None => x.clone(),
        };
        let out = self.depthwise.forward(out);
        let out = self.project_bn.forward(self.project.forward(out));

        if self.use_residual {
            out + x
        } else {
            out
        }
    }
}

#[derive(Module, Debug)]
pub struct MobileStage<B: Backend> {
    blocks: Vec<InvertedResidual<B>>,
}

/// MobileNetV2 feature extractor with optional dilation in the late stages
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvBnRelu<B>,
    stages: Vec<MobileStage<B>>,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> EncoderFeatures<B> {
        let x = self.stem.forward(x);
        let c1 = self.run_stages(0, TAPS[0], x);
        let c2 = self.run_stages(TAPS[0] + 1, TAPS[1], c1.clone());
        let c3 = self.run_stages(TAPS[1] + 1, TAPS[2], c2.clone());
        let c4 = self.run_stages(TAPS[2] + 1, TAPS[3], c3.clone());
        EncoderFeatures { c1, c2, c3, c4 }
    }

    /// Runs stages `first..=last`
    fn run_stages(&self, first: usize, last: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.stages
            .iter()
            .skip(first)
            .take(last + 1 - first)
            .flat_map(|stage| stage.blocks.iter())
            .fold(x, |x, block| block.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(24.0), 24);
        assert_eq!(make_divisible(12.0), 16);
        assert_eq!(make_divisible(160.0), 160);
        assert_eq!(make_divisible(3.0), 8);
    }

    #[test]
    fn test_width_multiplier_changes_channels() {
        let full = MobileNetV2Config::new().channels();
        assert_eq!(full, EncoderChannels { c1: 24, c2: 32, c3: 96, c4: 320 });

        let half = MobileNetV2Config::new().with_width_mult(0.5).channels();
        assert_eq!((half.c1, half.c4), (16, 160));
    }

    #[test]
    fn test_feature_strides_at_output_stride_16() {
        let device = Default::default();
        let net = MobileNetV2Config::new().init::<B>(&device).unwrap();
        let feats = net.forward(Tensor::zeros([1, 3, 64, 64], &device));

        assert_eq!(feats.c1.dims(), [1, 24, 16, 16]);
        assert_eq!(feats.c2.dims(), [1, 32, 8, 8]);
        assert_eq!(feats.c3.dims(), [1, 96, 4, 4]);
        assert_eq!(feats.c4.dims(), [1, 320, 4, 4]);
    }

    #[test]
    fn test_output_stride_8_dilates_later_stages() {
        let device = Default::default();
        let net = MobileNetV2Config::new()
            .with_output_stride(8)
            .init::<B>(&device)
            .unwrap();
        let feats = net.forward(Tensor::zeros([1, 3, 32, 32], &device));
        assert_eq!(feats.c4.dims(), [1, 320, 4, 4]);
    }
}
