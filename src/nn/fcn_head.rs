use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::nn::blocks::{ConvBnRelu, ConvBnReluConfig};

/// Lightweight classifier attached to an intermediate encoder feature map.
/// Only used to add a supervision signal during training.
#[derive(Config, Debug)]
pub struct FcnHeadConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl FcnHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FcnHead<B> {
        let inter = (self.in_channels / 4).max(1);
        FcnHead {
            block: ConvBnReluConfig::new(self.in_channels, inter, 3)
                .with_padding(1)
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: Conv2dConfig::new([inter, self.num_classes], [1, 1]).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct FcnHead<B: Backend> {
    block: ConvBnRelu<B>,
    dropout: Dropout,
    classifier: Conv2d<B>,
}

impl<B: Backend> FcnHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.dropout.forward(self.block.forward(x));
        self.classifier.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_fcn_head_keeps_resolution() {
        let device = Default::default();
        let head = FcnHeadConfig::new(64, 5).init::<NdArray>(&device);
        let x = Tensor::<NdArray, 4>::zeros([2, 64, 4, 6], &device);
        assert_eq!(head.forward(x).dims(), [2, 5, 4, 6]);
    }
}
