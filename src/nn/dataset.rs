use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::config::IGNORE_INDEX;
use crate::error::DatasetError;

/// ImageNet statistics used to normalize RGB input
pub const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A single training sample: a normalized image and its label mask
#[derive(Debug, Clone)]
pub struct SegmentationSample {
    /// Channel-major image: [3, height, width]
    pub image: Vec<f32>,
    /// Class index per pixel, `IGNORE_INDEX` where unlabeled: [height, width]
    pub mask: Vec<i64>,
    pub height: usize,
    pub width: usize,
}

impl SegmentationSample {
    /// Build a sample from interleaved 8-bit RGB pixels (row-major HWC).
    /// `pixels` must hold `3 * height * width` values and `mask` one per pixel.
    pub fn from_rgb8(
        pixels: &[u8],
        mask: Vec<i64>,
        height: usize,
        width: usize,
    ) -> Result<Self, DatasetError> {
        let plane = height * width;
        let check = |buffer, expected, found| {
            if expected == found {
                Ok(())
            } else {
                Err(DatasetError::BufferLength {
                    buffer,
                    expected,
                    found,
                    height,
                    width,
                })
            }
        };
        check("pixel", 3 * plane, pixels.len())?;
        check("mask", plane, mask.len())?;

        Ok(Self::normalized(pixels, mask, height, width))
    }

    fn normalized(pixels: &[u8], mask: Vec<i64>, height: usize, width: usize) -> Self {
        let plane = height * width;
        let mut image = vec![0.0_f32; 3 * plane];
        for (i, rgb) in pixels.chunks_exact(3).enumerate() {
            for c in 0..3 {
                image[c * plane + i] = (rgb[c] as f32 / 255.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
            }
        }
        Self {
            image,
            mask,
            height,
            width,
        }
    }

    pub fn size(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Dataset of segmentation samples held in memory, all of one size
#[derive(Debug, Clone, Default)]
pub struct SegmentationDataset {
    samples: Vec<SegmentationSample>,
}

impl SegmentationDataset {
    /// Rejects samples whose size differs from the first one, since a batch
    /// is stacked into a single tensor.
    pub fn new(samples: Vec<SegmentationSample>) -> Result<Self, DatasetError> {
        if let Some(first) = samples.first() {
            let expected = first.size();
            if let Some((index, sample)) = samples
                .iter()
                .enumerate()
                .find(|(_, s)| s.size() != expected)
            {
                return Err(DatasetError::SizeMismatch {
                    index,
                    expected,
                    found: sample.size(),
                });
            }
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[SegmentationSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<SegmentationSample> {
        self.samples
    }
}

impl Dataset<SegmentationSample> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Deterministic toy dataset: each image is split into diagonal class bands
/// whose colour encodes the class, with a one-pixel unlabeled border.
pub fn synthetic_dataset(
    count: usize,
    height: usize,
    width: usize,
    num_classes: usize,
) -> SegmentationDataset {
    let num_classes = num_classes.max(1);
    let band = ((height + width) / num_classes).max(1);

    let samples = (0..count)
        .map(|n| {
            let mut pixels = Vec::with_capacity(height * width * 3);
            let mut mask = Vec::with_capacity(height * width);
            for y in 0..height {
                for x in 0..width {
                    let class = ((x + y + n) / band) % num_classes;
                    let level = (255 * (class + 1) / num_classes) as u8;
                    pixels.extend_from_slice(&[level, 255 - level, level / 2]);

                    let border = y == 0 || x == 0 || y + 1 == height || x + 1 == width;
                    mask.push(if border { IGNORE_INDEX } else { class as i64 });
                }
            }
            SegmentationSample::normalized(&pixels, mask, height, width)
        })
        .collect();

    SegmentationDataset { samples }
}

/// Batcher that stacks equally sized samples into image and mask tensors
#[derive(Clone, Debug)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// Batched data for training
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    pub images: Tensor<B, 4>,     // [batch_size, 3, height, width]
    pub masks: Tensor<B, 3, Int>, // [batch_size, height, width]
}

/// Items must all share one size; `SegmentationDataset::new` guarantees this.
impl<B: Backend> Batcher<SegmentationSample, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationSample>) -> SegmentationBatch<B> {
        let batch_size = items.len();
        let (height, width) = items.first().map(|s| s.size()).unwrap_or((0, 0));
        assert!(
            items.iter().all(|s| s.size() == (height, width)),
            "cannot batch segmentation samples of different sizes"
        );

        let mut image_data = Vec::with_capacity(batch_size * 3 * height * width);
        let mut mask_data = Vec::with_capacity(batch_size * height * width);
        for sample in &items {
            image_data.extend_from_slice(&sample.image);
            mask_data.extend_from_slice(&sample.mask);
        }

        let images = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([batch_size, 3, height, width]);

        let masks = Tensor::<B, 1, Int>::from_ints(mask_data.as_slice(), &self.device)
            .reshape([batch_size, height, width]);

        SegmentationBatch { images, masks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_from_rgb8_normalizes_per_channel() {
        let sample = SegmentationSample::from_rgb8(&[255, 0, 128], vec![0], 1, 1).unwrap();
        let expected_r = (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0];
        let expected_g = -IMAGE_MEAN[1] / IMAGE_STD[1];
        assert!((sample.image[0] - expected_r).abs() < 1e-5);
        assert!((sample.image[1] - expected_g).abs() < 1e-5);
        assert_eq!(sample.image.len(), 3);
    }

    #[test]
    fn test_synthetic_dataset_labels() {
        let data = synthetic_dataset(3, 8, 8, 4);
        assert_eq!(data.len(), 3);

        let sample = data.get(0).unwrap();
        assert_eq!(sample.mask.len(), 64);
        assert_eq!(sample.mask[0], IGNORE_INDEX);
        assert!(sample
            .mask
            .iter()
            .all(|&c| c == IGNORE_INDEX || (0..4).contains(&c)));
    }

    #[test]
    fn test_batcher_shapes() {
        let batcher = SegmentationBatcher::<NdArray>::new(Default::default());
        let batch = batcher.batch(synthetic_dataset(2, 6, 10, 3).into_samples());
        assert_eq!(batch.images.dims(), [2, 3, 6, 10]);
        assert_eq!(batch.masks.dims(), [2, 6, 10]);
    }

    #[test]
    fn test_from_rgb8_rejects_short_buffers() {
        let short_pixels = SegmentationSample::from_rgb8(&[1, 2, 3], vec![0; 4], 2, 2);
        assert!(matches!(
            short_pixels,
            Err(DatasetError::BufferLength { buffer: "pixel", expected: 12, found: 3, .. })
        ));

        let short_mask = SegmentationSample::from_rgb8(&[0; 12], vec![0; 3], 2, 2);
        assert!(matches!(
            short_mask,
            Err(DatasetError::BufferLength { buffer: "mask", expected: 4, found: 3, .. })
        ));
    }

    #[test]
    fn test_dataset_rejects_mixed_sizes() {
        let mut samples = synthetic_dataset(1, 8, 8, 3).into_samples();
        samples.extend(synthetic_dataset(1, 6, 6, 3).into_samples());

        match SegmentationDataset::new(samples) {
            Err(DatasetError::SizeMismatch { index, expected, found }) => {
                assert_eq!((index, expected, found), (1, (8, 8), (6, 6)));
            }
            other => panic!("expected SizeMismatch, got {:?}", other.map(|d| d.len())),
        }
        assert!(SegmentationDataset::new(Vec::new()).is_ok());
    }

    #[test]
    #[should_panic(expected = "different sizes")]
    fn test_batcher_refuses_mixed_sizes() {
        let mut samples = synthetic_dataset(1, 8, 8, 3).into_samples();
        samples.extend(synthetic_dataset(1, 6, 6, 3).into_samples());
        SegmentationBatcher::<NdArray>::new(Default::default()).batch(samples);
    }
}
