pub mod mobilenet;
pub mod resnet;

use std::fmt;
use std::str::FromStr;

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::config::{COMPACT_C1_C4, STANDARD_C1_C4};
use crate::error::ModelError;
use mobilenet::{MobileNetV2, MobileNetV2Config};
use resnet::{ResNet, ResNetConfig};

/// Supported backbone identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    MobilenetV2,
    Resnet50,
    Resnet101,
    Resnet152,
}

/// Backbone families differ in the widths they hand to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneFamily {
    /// Mobile-style networks: c1 = 24, c4 = 320
    Compact,
    /// ResNet-style networks: c1 = 256, c4 = 2048
    Standard,
}

impl BackboneFamily {
    /// Family of an identifier; anything starting with `mobilenet` is compact.
    pub fn of(name: &str) -> Self {
        if name.starts_with("mobilenet") {
            BackboneFamily::Compact
        } else {
            BackboneFamily::Standard
        }
    }

    /// (c1, c4) channel widths the decoder head is built for
    pub fn decoder_widths(self) -> (usize, usize) {
        match self {
            BackboneFamily::Compact => COMPACT_C1_C4,
            BackboneFamily::Standard => STANDARD_C1_C4,
        }
    }
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 4] = [
        BackboneKind::MobilenetV2,
        BackboneKind::Resnet50,
        BackboneKind::Resnet101,
        BackboneKind::Resnet152,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackboneKind::MobilenetV2 => "mobilenet_v2",
            BackboneKind::Resnet50 => "resnet50",
            BackboneKind::Resnet101 => "resnet101",
            BackboneKind::Resnet152 => "resnet152",
        }
    }

    pub fn family(self) -> BackboneFamily {
        BackboneFamily::of(self.as_str())
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackboneKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        BackboneKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name || kind.as_str().replace('_', "") == name)
            .ok_or_else(|| ModelError::UnknownBackbone(s.to_string()))
    }
}

/// Channel widths of the four encoder outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderChannels {
    pub c1: usize,
    pub c2: usize,
    pub c3: usize,
    pub c4: usize,
}

/// Multi-scale feature maps, shallow (c1, stride 4) to deep (c4)
#[derive(Debug, Clone)]
pub struct EncoderFeatures<B: Backend> {
    pub c1: Tensor<B, 4>,
    pub c2: Tensor<B, 4>,
    pub c3: Tensor<B, 4>,
    pub c4: Tensor<B, 4>,
}

#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub backbone: BackboneKind,
    #[config(default = 16)]
    pub output_stride: usize,
    /// Channel multiplier, only meaningful for MobileNetV2
    #[config(default = 1.0)]
    pub width_mult: f64,
}

impl EncoderConfig {
    /// Output widths, known before any weights are allocated
    pub fn channels(&self) -> EncoderChannels {
        match self.backbone {
            BackboneKind::MobilenetV2 => self.mobilenet().channels(),
            _ => ResNetConfig::channels(),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Encoder<B>, ModelError> {
        let (mobilenet, resnet) = match self.backbone {
            BackboneKind::MobilenetV2 => (Some(self.mobilenet().init(device)?), None),
            BackboneKind::Resnet50 => (None, Some(self.resnet([3, 4, 6, 3]).init(device)?)),
            BackboneKind::Resnet101 => (None, Some(self.resnet([3, 4, 23, 3]).init(device)?)),
            BackboneKind::Resnet152 => (None, Some(self.resnet([3, 8, 36, 3]).init(device)?)),
        };

        tracing::debug!(
            "Built {} encoder (output stride {})",
            self.backbone,
            self.output_stride
        );

        Ok(Encoder { mobilenet, resnet })
    }

    fn mobilenet(&self) -> MobileNetV2Config {
        MobileNetV2Config::new()
            .with_output_stride(self.output_stride)
            .with_width_mult(self.width_mult)
    }

    fn resnet(&self, layers: [usize; 4]) -> ResNetConfig {
        ResNetConfig::new(layers).with_output_stride(self.output_stride)
    }
}

/// Encoder wrapper; exactly one backbone is present, chosen at construction.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    mobilenet: Option<MobileNetV2<B>>,
    resnet: Option<ResNet<B>>,
}

impl<B: Backend> Encoder<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> EncoderFeatures<B> {
        match (&self.mobilenet, &self.resnet) {
            (Some(net), _) => net.forward(x),
            (None, Some(net)) => net.forward(x),
            (None, None) => unreachable!("encoder is always built with one backbone"),
        }
    }
}

/// Converts a stage stride into (stride, dilation) once the running stride
/// reaches the requested output stride.
pub(crate) fn dilate_stage(
    current_stride: &mut usize,
    dilation: &mut usize,
    stride: usize,
    output_stride: usize,
) -> (usize, usize) {
    let previous = *dilation;
    if stride > 1 && *current_stride * stride > output_stride {
        *dilation *= stride;
        (1, previous)
    } else {
        *current_stride *= stride;
        (stride, previous)
    }
}
