//! Bitmap to normalized planar tensor conversion

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::EncoderError;

/// ImageNet channel means (R, G, B)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations (R, G, B)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel affine normalization applied after mapping samples to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const IMAGENET: Normalization = Normalization {
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
    };

    /// `(value / 255 - mean[channel]) / std[channel]`
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        (value as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// Three contiguous 8-bit planes: all R samples, then all G, then all B.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbPlanes {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RgbPlanes {
    fn from_interleaved(rgb: &RgbImage) -> Self {
        let (width, height) = rgb.dimensions();
        let len = width as usize * height as usize;
        let mut data = vec![0u8; len * 3];
        for (i, pixel) in rgb.pixels().enumerate() {
            data[i] = pixel[0];
            data[len + i] = pixel[1];
            data[2 * len + i] = pixel[2];
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major samples of one channel (0 = R, 1 = G, 2 = B)
    pub fn plane(&self, channel: usize) -> &[u8] {
        let len = self.width as usize * self.height as usize;
        &self.data[channel * len..(channel + 1) * len]
    }
}

/// Resizes and color-converts bitmaps into the encoder's input layout
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    normalization: Normalization,
    filter: FilterType,
}

impl ImagePreprocessor {
    pub fn new(normalization: Normalization) -> Self {
        Self {
            normalization,
            filter: FilterType::CatmullRom,
        }
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    /// Draw `image` into an opaque RGBA canvas of exactly `width` x `height`.
    ///
    /// Translucent pixels are composited over black, so the alpha channel
    /// carries no information afterwards.
    pub fn resize(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, EncoderError> {
        if width == 0 || height == 0 {
            return Err(EncoderError::ImageResize(format!(
                "target size {}x{} has no pixels",
                width, height
            )));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(EncoderError::ImageResize("source image is empty".to_string()));
        }
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                EncoderError::ImageResize(format!("canvas {}x{} is too large", width, height))
            })?;

        let mut canvas = image.to_rgba8();
        for pixel in canvas.pixels_mut() {
            let alpha = pixel[3] as u32;
            if alpha != 255 {
                for c in 0..3 {
                    pixel[c] = ((pixel[c] as u32 * alpha + 127) / 255) as u8;
                }
                pixel[3] = 255;
            }
        }

        Ok(imageops::resize(&canvas, width, height, self.filter))
    }

    /// Drop alpha and de-interleave into R, G, B planes.
    pub fn rgb_planes(&self, image: &DynamicImage) -> Result<RgbPlanes, EncoderError> {
        match image {
            DynamicImage::ImageRgba8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_) => Ok(RgbPlanes::from_interleaved(&image.to_rgb8())),
            other => Err(EncoderError::ImageConversion(format!(
                "expected 8-bit samples, got {:?}",
                other.color()
            ))),
        }
    }

    /// Normalize planes into a `[1, 3, width, height]` F32 tensor on the CPU.
    ///
    /// Each channel plane is stored row-major, which is the usual NCHW layout
    /// for the square inputs image encoders declare.
    pub fn normalize(&self, planes: &RgbPlanes) -> Result<Tensor, EncoderError> {
        let width = planes.width() as usize;
        let height = planes.height() as usize;

        let mut data = Vec::with_capacity(3 * width * height);
        for c in 0..3 {
            data.extend(
                planes
                    .plane(c)
                    .iter()
                    .map(|&v| self.normalization.apply(c, v)),
            );
        }

        Tensor::from_vec(data, (1, 3, width, height), &Device::Cpu)
            .map_err(|e| EncoderError::ModelInputConstruction(e.to_string()))
    }

    /// Resize, plane-convert and normalize in one go.
    pub fn preprocess(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<Tensor, EncoderError> {
        let resized = self.resize(image, width, height)?;
        let planes = self.rgb_planes(&DynamicImage::ImageRgba8(resized))?;
        self.normalize(&planes)
    }
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(Normalization::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};

    fn solid(width: u32, height: u32, color: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(ImageBuffer::from_pixel(width, height, Rgba(color)))
    }

    #[test]
    fn resize_produces_exact_target_dimensions() {
        let preprocessor = ImagePreprocessor::default();
        let image = solid(37, 19, [10, 20, 30, 255]);

        for (w, h) in [(1, 1), (8, 8), (64, 17), (17, 64), (512, 512)] {
            let resized = preprocessor.resize(&image, w, h).unwrap();
            assert_eq!(resized.dimensions(), (w, h));
        }
    }

    #[test]
    fn resize_rejects_empty_target() {
        let preprocessor = ImagePreprocessor::default();
        let image = solid(4, 4, [0, 0, 0, 255]);

        assert!(matches!(
            preprocessor.resize(&image, 0, 8),
            Err(EncoderError::ImageResize(_))
        ));
        assert!(matches!(
            preprocessor.resize(&image, 8, 0),
            Err(EncoderError::ImageResize(_))
        ));
    }

    #[test]
    fn resize_rejects_empty_source() {
        let preprocessor = ImagePreprocessor::default();
        let image = DynamicImage::ImageRgba8(RgbaImage::new(0, 0));

        assert!(matches!(
            preprocessor.resize(&image, 8, 8),
            Err(EncoderError::ImageResize(_))
        ));
    }

    #[test]
    fn resize_composites_transparency_over_black() {
        let preprocessor = ImagePreprocessor::default();
        let image = solid(4, 4, [200, 100, 50, 0]);

        let resized = preprocessor.resize(&image, 2, 2).unwrap();
        for pixel in resized.pixels() {
            assert_eq!(pixel.0, [0, 0, 0, 255]);
        }
    }

    #[test]
    fn rgb_planes_are_deinterleaved_in_channel_order() {
        let preprocessor = ImagePreprocessor::default();
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, Rgb([1, 2, 3]));
        rgb.put_pixel(1, 0, Rgb([4, 5, 6]));

        let planes = preprocessor.rgb_planes(&DynamicImage::ImageRgb8(rgb)).unwrap();
        assert_eq!(planes.plane(0), &[1, 4]);
        assert_eq!(planes.plane(1), &[2, 5]);
        assert_eq!(planes.plane(2), &[3, 6]);
    }

    #[test]
    fn rgb_planes_drop_alpha() {
        let preprocessor = ImagePreprocessor::default();
        let planes = preprocessor
            .rgb_planes(&solid(1, 1, [9, 8, 7, 42]))
            .unwrap();
        assert_eq!(planes.plane(0), &[9]);
        assert_eq!(planes.plane(1), &[8]);
        assert_eq!(planes.plane(2), &[7]);
    }

    #[test]
    fn rgb_planes_reject_wide_samples() {
        let preprocessor = ImagePreprocessor::default();
        let image = DynamicImage::ImageRgb16(ImageBuffer::new(2, 2));

        assert!(matches!(
            preprocessor.rgb_planes(&image),
            Err(EncoderError::ImageConversion(_))
        ));
    }

    #[test]
    fn normalize_applies_per_channel_statistics() {
        let preprocessor = ImagePreprocessor::default();
        let mut rgb = RgbImage::new(2, 2);
        let samples = [[0u8, 128, 255], [255, 0, 64], [17, 200, 3], [90, 90, 90]];
        for (i, s) in samples.iter().enumerate() {
            rgb.put_pixel(i as u32 % 2, i as u32 / 2, Rgb(*s));
        }
        let planes = preprocessor.rgb_planes(&DynamicImage::ImageRgb8(rgb)).unwrap();

        let tensor = preprocessor.normalize(&planes).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 2]);

        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        for c in 0..3 {
            for (i, s) in samples.iter().enumerate() {
                let expected = (s[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
                let actual = values[c * 4 + i];
                assert!(
                    (actual - expected).abs() < 1e-5,
                    "channel {} sample {}: {} != {}",
                    c,
                    i,
                    actual,
                    expected
                );
            }
        }
    }

    #[test]
    fn custom_normalization_is_used() {
        let identity = Normalization {
            mean: [0.0; 3],
            std: [1.0; 3],
        };
        let preprocessor = ImagePreprocessor::new(identity);
        let tensor = preprocessor
            .preprocess(&solid(3, 3, [255, 0, 255, 255]), 4, 4)
            .unwrap();

        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values[..16].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(values[16..32].iter().all(|v| v.abs() < 1e-6));
        assert!(values[32..].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }
}
