use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor},
};

use crate::config::DEFAULT_OUTPUT_STRIDE;
use crate::error::ModelError;
use crate::nn::backbone::{BackboneKind, Encoder, EncoderChannels, EncoderConfig};
use crate::nn::fcn_head::{FcnHead, FcnHeadConfig};
use crate::nn::head::{DeepLabHead, DeepLabHeadConfig};
use crate::nn::ops::resize_bilinear;

/// DeepLabV3+ segmentation network
///
/// Architecture: encoder -> (ASPP(c4) + c1) decoder head -> upsample to input
/// size, plus an optional FCN head on c3 for auxiliary supervision.
#[derive(Module, Debug)]
pub struct DeepLabV3Plus<B: Backend> {
    encoder: Encoder<B>,
    head: DeepLabHead<B>,
    auxlayer: Option<FcnHead<B>>,
    num_classes: usize,
}

/// Configuration for the model
#[derive(Config, Debug)]
pub struct DeepLabV3PlusConfig {
    pub num_classes: usize,
    #[config(default = "BackboneKind::Resnet50")]
    pub backbone: BackboneKind,
    /// Attach the auxiliary FCN head on c3
    #[config(default = false)]
    pub aux: bool,
    #[config(default = "DEFAULT_OUTPUT_STRIDE")]
    pub output_stride: usize,
    /// MobileNetV2 channel multiplier
    #[config(default = 1.0)]
    pub width_mult: f64,
    /// Expected c3 width for the aux head; defaults to the encoder's c3
    pub aux_in_channels: Option<usize>,
}

/// Sub-modules of the model, used to give the decoder its own learning rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPart {
    Encoder,
    Head,
    AuxLayer,
}

/// Model outputs, all at the input's spatial resolution
#[derive(Debug, Clone)]
pub struct SegmentationOutput<B: Backend> {
    /// `[N, num_classes, H, W]`
    pub logits: Tensor<B, 4>,
    /// Present only when the auxiliary head is enabled
    pub aux: Option<Tensor<B, 4>>,
}

impl<B: Backend> SegmentationOutput<B> {
    /// Primary logits first, then the auxiliary logits if any
    pub fn into_outputs(self) -> Vec<Tensor<B, 4>> {
        std::iter::once(self.logits).chain(self.aux).collect()
    }
}

/// Checks that an encoder's c1/c4 widths match what its family's decoder expects.
pub fn validate_encoder_channels(
    backbone: &str,
    channels: &EncoderChannels,
) -> Result<(), ModelError> {
    let (c1, c4) = crate::nn::backbone::BackboneFamily::of(backbone).decoder_widths();

    for (feature, expected, found) in [("c1", c1, channels.c1), ("c4", c4, channels.c4)] {
        if expected != found {
            return Err(ModelError::ChannelMismatch {
                backbone: backbone.to_string(),
                feature,
                expected,
                found,
            });
        }
    }
    Ok(())
}

impl DeepLabV3PlusConfig {
    pub fn encoder(&self) -> EncoderConfig {
        EncoderConfig::new(self.backbone)
            .with_output_stride(self.output_stride)
            .with_width_mult(self.width_mult)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DeepLabV3Plus<B>, ModelError> {
        let encoder_config = self.encoder();
        let channels = encoder_config.channels();
        validate_encoder_channels(self.backbone.as_str(), &channels)?;

        let encoder = encoder_config.init(device)?;
        let head = DeepLabHeadConfig::new(self.num_classes)
            .with_c1_channels(channels.c1)
            .with_c4_channels(channels.c4)
            .with_output_stride(self.output_stride)
            .init(device)?;

        // The aux head reads c3, so its width follows the encoder
        let aux_in = self.aux_in_channels.unwrap_or(channels.c3);
        if self.aux && aux_in != channels.c3 {
            return Err(ModelError::ChannelMismatch {
                backbone: self.backbone.to_string(),
                feature: "c3",
                expected: aux_in,
                found: channels.c3,
            });
        }
        let auxlayer = self
            .aux
            .then(|| FcnHeadConfig::new(aux_in, self.num_classes).init(device));

        tracing::info!(
            "DeepLabV3+ with {} backbone: {} classes, output stride {}, aux head {}",
            self.backbone,
            self.num_classes,
            self.output_stride,
            if self.aux { "on" } else { "off" }
        );

        Ok(DeepLabV3Plus {
            encoder,
            head,
            auxlayer,
            num_classes: self.num_classes,
        })
    }
}

impl<B: Backend> DeepLabV3Plus<B> {
    /// Forward pass
    ///
    /// Input shape: [batch_size, 3, H, W]
    /// Output shape: [batch_size, num_classes, H, W] for every output
    pub fn forward(&self, x: Tensor<B, 4>) -> SegmentationOutput<B> {
        let [_, _, h, w] = x.dims();
        let features = self.encoder.forward(x);

        let logits = self.head.forward(features.c4, features.c1);
        let logits = resize_bilinear(logits, [h, w]);

        let aux = self
            .auxlayer
            .as_ref()
            .map(|aux| resize_bilinear(aux.forward(features.c3), [h, w]));

        SegmentationOutput { logits, aux }
    }

    /// Same as [`forward`](Self::forward) but rejects inputs that are not
    /// three-channel images instead of failing inside the first convolution.
    pub fn try_forward(&self, x: Tensor<B, 4>) -> Result<SegmentationOutput<B>, ModelError> {
        let dims = x.dims();
        if dims[1] != 3 || dims[2] == 0 || dims[3] == 0 {
            return Err(ModelError::InputShape(dims));
        }
        Ok(self.forward(x))
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn has_aux(&self) -> bool {
        self.auxlayer.is_some()
    }

    /// Parts trained with the decoder learning rate, fixed at construction
    pub fn decoder_parts(&self) -> Vec<ModelPart> {
        let mut parts = vec![ModelPart::Head];
        if self.auxlayer.is_some() {
            parts.push(ModelPart::AuxLayer);
        }
        parts
    }

    pub fn encoder(&self) -> &Encoder<B> {
        &self.encoder
    }

    pub fn head(&self) -> &DeepLabHead<B> {
        &self.head
    }

    pub fn auxlayer(&self) -> Option<&FcnHead<B>> {
        self.auxlayer.as_ref()
    }
}
