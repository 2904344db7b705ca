use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Convolution (no bias) -> batch norm -> ReLU, or ReLU6 when `relu6` is set
#[derive(Config, Debug)]
pub struct ConvBnReluConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 0)]
    pub padding: usize,
    #[config(default = 1)]
    pub dilation: usize,
    #[config(default = 1)]
    pub groups: usize,
    #[config(default = false)]
    pub relu6: bool,
}

impl ConvBnReluConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBnRelu<B> {
        let conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .with_groups(self.groups)
        .with_bias(false)
        .init(device);

        ConvBnRelu {
            conv,
            bn: BatchNormConfig::new(self.out_channels).init(device),
            relu: Relu::new(),
            relu6: self.relu6,
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
    relu6: bool,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn.forward(self.conv.forward(x));
        if self.relu6 {
            x.clamp(0.0, 6.0)
        } else {
            self.relu.forward(x)
        }
    }
}

/// Depthwise k x k convolution followed by a pointwise 1x1 projection.
///
/// `relu_first` selects the activation placement: before the depthwise conv
/// (Xception entry style) or after each batch norm (decoder style).
#[derive(Config, Debug)]
pub struct SeparableConv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 1)]
    pub dilation: usize,
    #[config(default = true)]
    pub relu_first: bool,
}

impl SeparableConv2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SeparableConv2d<B> {
        let depthwise = Conv2dConfig::new(
            [self.in_channels, self.in_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.dilation, self.dilation))
        .with_dilation([self.dilation, self.dilation])
        .with_groups(self.in_channels)
        .with_bias(false)
        .init(device);

        let pointwise = Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
            .with_bias(false)
            .init(device);

        SeparableConv2d {
            depthwise,
            bn_depth: BatchNormConfig::new(self.in_channels).init(device),
            pointwise,
            bn_point: BatchNormConfig::new(self.out_channels).init(device),
            relu: Relu::new(),
            relu_first: self.relu_first,
        }
    }
}

#[derive(Module, Debug)]
pub struct SeparableConv2d<B: Backend> {
    depthwise: Conv2d<B>,
    bn_depth: BatchNorm<B, 2>,
    pointwise: Conv2d<B>,
    bn_point: BatchNorm<B, 2>,
    relu: Relu,
    relu_first: bool,
}

impl<B: Backend> SeparableConv2d<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.relu_first {
            let x = self.relu.forward(x);
            let x = self.bn_depth.forward(self.depthwise.forward(x));
            self.bn_point.forward(self.pointwise.forward(x))
        } else {
            let x = self.bn_depth.forward(self.depthwise.forward(x));
            let x = self.relu.forward(x);
            let x = self.bn_point.forward(self.pointwise.forward(x));
            self.relu.forward(x)
        }
    }
}
