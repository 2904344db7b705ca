use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::{dilate_stage, EncoderChannels, EncoderFeatures};
use crate::error::ModelError;
use crate::nn::blocks::{ConvBnRelu, ConvBnReluConfig};

const EXPANSION: usize = 4;
const PLANES: [usize; 4] = [64, 128, 256, 512];
const STRIDES: [usize; 4] = [1, 2, 2, 2];

/// Dilated bottleneck ResNet (v1b). `layers` holds the block count per stage.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    pub layers: [usize; 4],
    #[config(default = 16)]
    pub output_stride: usize,
}

impl ResNetConfig {
    pub fn channels() -> EncoderChannels {
        let [c1, c2, c3, c4] = PLANES.map(|p| p * EXPANSION);
        EncoderChannels { c1, c2, c3, c4 }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>, ModelError> {
        if !matches!(self.output_stride, 8 | 16 | 32) {
            return Err(ModelError::UnsupportedOutputStride(self.output_stride));
        }

        let stem = ConvBnReluConfig::new(3, 64, 7)
            .with_stride(2)
            .with_padding(3)
            .init(device);
        let max_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut in_channels = 64;
        let mut current_stride = 4;
        let mut dilation = 1;

        let mut make_layer = |stage: usize| {
            let (stride, first_dilation) = dilate_stage(
                &mut current_stride,
                &mut dilation,
                STRIDES[stage],
                self.output_stride,
            );
            let planes = PLANES[stage];

            let mut blocks = Vec::with_capacity(self.layers[stage]);
            for i in 0..self.layers[stage] {
                let (block_stride, block_dilation) = if i == 0 {
                    (stride, first_dilation)
                } else {
                    (1, dilation)
                };
                blocks.push(bottleneck::<B>(
                    in_channels,
                    planes,
                    block_stride,
                    block_dilation,
                    device,
                ));
                in_channels = planes * EXPANSION;
            }
            blocks
        };

        let layer1 = make_layer(0);
        let layer2 = make_layer(1);
        let layer3 = make_layer(2);
        let layer4 = make_layer(3);

        Ok(ResNet {
            stem,
            max_pool,
            layer1,
            layer2,
            layer3,
            layer4,
        })
    }
}

fn bottleneck<B: Backend>(
    in_channels: usize,
    planes: usize,
    stride: usize,
    dilation: usize,
    device: &B::Device,
) -> Bottleneck<B> {
    let out_channels = planes * EXPANSION;
    let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
        conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_stride([stride, stride])
            .with_bias(false)
            .init(device),
        bn: BatchNormConfig::new(out_channels).init(device),
    });

    Bottleneck {
        conv1: ConvBnReluConfig::new(in_channels, planes, 1).init(device),
        conv2: ConvBnReluConfig::new(planes, planes, 3)
            .with_stride(stride)
            .with_padding(dilation)
            .with_dilation(dilation)
            .init(device),
        conv3: Conv2dConfig::new([planes, out_channels], [1, 1])
            .with_bias(false)
            .init(device),
        bn3: BatchNormConfig::new(out_channels).init(device),
        downsample,
        relu: Relu::new(),
    }
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: ConvBnRelu<B>,
    conv2: ConvBnRelu<B>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
    relu: Relu,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.bn.forward(down.conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = self.conv2.forward(self.conv1.forward(x));
        let out = self.bn3.forward(self.conv3.forward(out));
        self.relu.forward(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: ConvBnRelu<B>,
    max_pool: MaxPool2d,
    layer1: Vec<Bottleneck<B>>,
    layer2: Vec<Bottleneck<B>>,
    layer3: Vec<Bottleneck<B>>,
    layer4: Vec<Bottleneck<B>>,
}

fn run<B: Backend>(blocks: &[Bottleneck<B>], x: Tensor<B, 4>) -> Tensor<B, 4> {
    blocks.iter().fold(x, |x, block| block.forward(x))
}

impl<B: Backend> ResNet<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> EncoderFeatures<B> {
        let x = self.max_pool.forward(self.stem.forward(x));
        let c1 = run(&self.layer1, x);
        let c2 = run(&self.layer2, c1.clone());
        let c3 = run(&self.layer3, c2.clone());
        let c4 = run(&self.layer4, c3.clone());
        EncoderFeatures { c1, c2, c3, c4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn test_standard_channels() {
        assert_eq!(
            ResNetConfig::channels(),
            EncoderChannels { c1: 256, c2: 512, c3: 1024, c4: 2048 }
        );
    }

    #[test]
    fn test_dilated_resnet_keeps_stride_16() {
        let device = Default::default();
        let net = ResNetConfig::new([1, 1, 1, 1]).init::<B>(&device).unwrap();
        let feats = net.forward(Tensor::zeros([1, 3, 64, 64], &device));

        assert_eq!(feats.c1.dims(), [1, 256, 16, 16]);
        assert_eq!(feats.c2.dims(), [1, 512, 8, 8]);
        assert_eq!(feats.c3.dims(), [1, 1024, 4, 4]);
        assert_eq!(feats.c4.dims(), [1, 2048, 4, 4]);
    }

    #[test]
    fn test_rejects_unsupported_stride() {
        let device = Default::default();
        assert!(ResNetConfig::new([1, 1, 1, 1])
            .with_output_stride(4)
            .init::<B>(&device)
            .is_err());
    }
}
