use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::error::ModelError;
use crate::nn::blocks::{ConvBnRelu, ConvBnReluConfig};
use crate::nn::ops::resize_bilinear;

/// Dilation rates of the three atrous branches for a given output stride
pub fn atrous_rates(output_stride: usize) -> Result<[usize; 3], ModelError> {
    match output_stride {
        8 => Ok([12, 24, 36]),
        16 => Ok([6, 12, 18]),
        32 => Ok([3, 6, 9]),
        other => Err(ModelError::UnsupportedOutputStride(other)),
    }
}

#[derive(Config, Debug)]
pub struct AsppConfig {
    pub in_channels: usize,
    #[config(default = 256)]
    pub out_channels: usize,
    #[config(default = 16)]
    pub output_stride: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl AsppConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Aspp<B>, ModelError> {
        let rates = atrous_rates(self.output_stride)?;
        let out = self.out_channels;

        let b0 = ConvBnReluConfig::new(self.in_channels, out, 1).init(device);
        let atrous = rates
            .iter()
            .map(|&rate| {
                ConvBnReluConfig::new(self.in_channels, out, 3)
                    .with_padding(rate)
                    .with_dilation(rate)
                    .init(device)
            })
            .collect();

        Ok(Aspp {
            b0,
            atrous,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            pool_conv: ConvBnReluConfig::new(self.in_channels, out, 1).init(device),
            project: ConvBnReluConfig::new(out * 5, out, 1).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        })
    }
}

#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    b0: ConvBnRelu<B>,
    atrous: Vec<ConvBnRelu<B>>,
    pool: AdaptiveAvgPool2d,
    pool_conv: ConvBnRelu<B>,
    project: ConvBnRelu<B>,
    dropout: Dropout,
}

impl<B: Backend> Aspp<B> {
    /// Input `[N, C, h, w]`, output `[N, out_channels, h, w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();

        let mut branches = Vec::with_capacity(5);
        branches.push(self.b0.forward(x.clone()));
        for branch in &self.atrous {
            branches.push(branch.forward(x.clone()));
        }

        let pooled = self.pool_conv.forward(self.pool.forward(x));
        branches.push(resize_bilinear(pooled, [h, w]));

        let x = self.project.forward(Tensor::cat(branches, 1));
        self.dropout.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn test_rates_follow_output_stride() {
        assert_eq!(atrous_rates(16).unwrap(), [6, 12, 18]);
        assert_eq!(atrous_rates(8).unwrap(), [12, 24, 36]);
        assert!(matches!(
            atrous_rates(4),
            Err(ModelError::UnsupportedOutputStride(4))
        ));
    }

    #[test]
    fn test_aspp_output_shape() {
        let device = Default::default();
        let aspp = AsppConfig::new(32).init::<B>(&device).unwrap();
        let x = Tensor::<B, 4>::random([2, 32, 5, 7], burn::tensor::Distribution::Default, &device);
        assert_eq!(aspp.forward(x).dims(), [2, 256, 5, 7]);
    }

    #[test]
    fn test_aspp_rejects_bad_stride() {
        let device = Default::default();
        let result = AsppConfig::new(32).with_output_stride(12).init::<B>(&device);
        assert!(result.is_err());
    }
}
