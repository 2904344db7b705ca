use burn::{
    config::Config,
    module::Module,
    nn::conv::{Conv2d, Conv2dConfig},
    tensor::{backend::Backend, Tensor},
};

use crate::config::{ASPP_CHANNELS, C1_PROJECTION_CHANNELS, DECODER_CHANNELS};
use crate::error::ModelError;
use crate::nn::aspp::{Aspp, AsppConfig};
use crate::nn::blocks::{ConvBnRelu, ConvBnReluConfig, SeparableConv2d, SeparableConv2dConfig};
use crate::nn::ops::resize_bilinear;

/// Channels entering the decoder after fusing ASPP context with projected c1
pub const FUSION_CHANNELS: usize = ASPP_CHANNELS + C1_PROJECTION_CHANNELS;

/// DeepLabV3+ decoder: fuses ASPP context from c4 with the shallow c1 features.
#[derive(Config, Debug)]
pub struct DeepLabHeadConfig {
    pub num_classes: usize,
    #[config(default = 256)]
    pub c1_channels: usize,
    #[config(default = 2048)]
    pub c4_channels: usize,
    #[config(default = 16)]
    pub output_stride: usize,
}

impl DeepLabHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DeepLabHead<B>, ModelError> {
        let aspp = AsppConfig::new(self.c4_channels)
            .with_out_channels(ASPP_CHANNELS)
            .with_output_stride(self.output_stride)
            .init(device)?;

        let c1_block = ConvBnReluConfig::new(self.c1_channels, C1_PROJECTION_CHANNELS, 1).init(device);

        let sep1 = SeparableConv2dConfig::new(FUSION_CHANNELS, DECODER_CHANNELS)
            .with_relu_first(false)
            .init(device);
        let sep2 = SeparableConv2dConfig::new(DECODER_CHANNELS, DECODER_CHANNELS)
            .with_relu_first(false)
            .init(device);
        let classifier = Conv2dConfig::new([DECODER_CHANNELS, self.num_classes], [1, 1]).init(device);

        Ok(DeepLabHead {
            aspp,
            c1_block,
            sep1,
            sep2,
            classifier,
        })
    }
}

#[derive(Module, Debug)]
pub struct DeepLabHead<B: Backend> {
    aspp: Aspp<B>,
    c1_block: ConvBnRelu<B>,
    sep1: SeparableConv2d<B>,
    sep2: SeparableConv2d<B>,
    classifier: Conv2d<B>,
}

impl<B: Backend> DeepLabHead<B> {
    /// Per-class logits at c1's resolution.
    ///
    /// `x` is the deep map `[N, C4, h4, w4]`, `c1` the shallow map
    /// `[N, C1, h1, w1]` with `h1 >= h4` and `w1 >= w4`.
    pub fn forward(&self, x: Tensor<B, 4>, c1: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.fuse(x, c1);
        let x = self.sep1.forward(x);
        let x = self.sep2.forward(x);
        self.classifier.forward(x)
    }

    /// ASPP context upsampled to c1 and concatenated with the 48-channel
    /// projection of c1: `[N, 304, h1, w1]`.
    pub fn fuse(&self, x: Tensor<B, 4>, c1: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = c1.dims();
        let c1 = self.c1_block.forward(c1);
        let x = self.aspp.forward(x);
        let x = resize_bilinear(x, [h, w]);
        Tensor::cat(vec![x, c1], 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    #[test]
    fn test_fusion_is_304_channels_for_compact_widths() {
        let device = Default::default();
        let head = DeepLabHeadConfig::new(3)
            .with_c1_channels(24)
            .with_c4_channels(320)
            .init::<B>(&device)
            .unwrap();
        let c4 = Tensor::<B, 4>::random([1, 320, 2, 2], Distribution::Default, &device);
        let c1 = Tensor::<B, 4>::random([1, 24, 8, 8], Distribution::Default, &device);

        assert_eq!(head.fuse(c4.clone(), c1.clone()).dims(), [1, FUSION_CHANNELS, 8, 8]);
        assert_eq!(head.forward(c4, c1).dims(), [1, 3, 8, 8]);
    }

    #[test]
    fn test_fusion_is_304_channels_for_standard_widths() {
        let device = Default::default();
        let head = DeepLabHeadConfig::new(2).init::<B>(&device).unwrap();
        let c4 = Tensor::<B, 4>::zeros([1, 2048, 1, 1], &device);
        let c1 = Tensor::<B, 4>::zeros([1, 256, 4, 4], &device);
        assert_eq!(head.fuse(c4, c1).dims()[1], 304);
    }
}
