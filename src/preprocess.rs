//! Image to tensor preprocessing driven by `preprocessor_config.json`.

use image::{RgbImage, imageops};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};
use crate::tensor::Tensor;

/// Size field as found in preprocessor configs: a bare number or an object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Square(u32),
    Dims { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
    LongestEdge { longest_edge: u32 },
}

impl SizeSpec {
    pub fn edge(&self) -> u32 {
        match *self {
            SizeSpec::Square(n) => n,
            SizeSpec::Dims { height, .. } => height,
            SizeSpec::ShortestEdge { shortest_edge } => shortest_edge,
            SizeSpec::LongestEdge { longest_edge } => longest_edge,
        }
    }
}

fn enabled() -> bool {
    true
}

fn imagenet_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn imagenet_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

fn unit_rescale() -> f32 {
    1.0 / 255.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default = "enabled")]
    pub do_resize: bool,
    #[serde(default)]
    pub size: Option<SizeSpec>,
    #[serde(default)]
    pub square_image: bool,
    #[serde(default)]
    pub resize_longer: bool,
    #[serde(default)]
    pub do_center_crop: bool,
    #[serde(default)]
    pub crop_size: Option<SizeSpec>,
    #[serde(default)]
    pub do_pad: bool,
    #[serde(default)]
    pub pad_size: Option<SizeSpec>,
    #[serde(default)]
    pub flip_channels: bool,
    #[serde(default)]
    pub do_normalize: bool,
    #[serde(default = "imagenet_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "imagenet_std")]
    pub image_std: [f32; 3],
    #[serde(default)]
    pub do_rescale: bool,
    #[serde(default = "unit_rescale")]
    pub rescale_factor: f32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: Some(SizeSpec::Square(224)),
            square_image: false,
            resize_longer: false,
            do_center_crop: false,
            crop_size: None,
            do_pad: false,
            pad_size: None,
            flip_channels: false,
            do_normalize: false,
            image_mean: imagenet_mean(),
            image_std: imagenet_std(),
            do_rescale: false,
            rescale_factor: unit_rescale(),
        }
    }
}

/// Output of [`PreprocessorConfig::process`].
///
/// `width`/`height` are the resized dimensions before cropping, the space
/// original-image coordinates must be mapped into.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pub tensor: Tensor<f32>,
    pub width: u32,
    pub height: u32,
}

fn required(spec: Option<SizeSpec>, field: &str) -> Result<u32> {
    match spec.map(|s| s.edge()) {
        Some(edge) if edge > 0 => Ok(edge),
        _ => Err(SdkError::Config(format!(
            "preprocessor config enables {field} but has no usable size"
        ))),
    }
}

fn scaled(side: u32, target: u32, reference: u32) -> u32 {
    ((side as f64 * target as f64 / reference as f64).round() as u32).max(1)
}

impl PreprocessorConfig {
    /// Target dimensions for an image of `width` × `height`.
    pub fn resized_dims(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        if !self.do_resize {
            return Ok((width, height));
        }
        let size = required(self.size, "resize")?;
        Ok(if self.square_image {
            (size, size)
        } else if self.resize_longer && width > height {
            (size, scaled(height, size, width))
        } else {
            (scaled(width, size, height), size)
        })
    }

    fn value(&self, raw: u8, channel: usize) -> f32 {
        let raw = raw as f32;
        if self.do_normalize {
            (raw / 255.0 - self.image_mean[channel]) / self.image_std[channel]
        } else if self.do_rescale {
            raw * self.rescale_factor
        } else {
            raw / 255.0
        }
    }

    /// Resize, crop, pad and normalise into a `[1, 3, H, W]` planar tensor.
    pub fn process(&self, image: &RgbImage) -> Result<PreprocessedImage> {
        if image.width() == 0 || image.height() == 0 {
            return Err(SdkError::BadRequest("image has no pixels".into()));
        }
        let (width, height) = self.resized_dims(image.width(), image.height())?;
        let mut current = if (width, height) == image.dimensions() {
            image.clone()
        } else {
            imageops::resize(image, width, height, imageops::FilterType::Triangle)
        };

        if self.do_center_crop {
            let crop = required(self.crop_size, "center crop")?;
            let left = current.width().saturating_sub(crop) / 2;
            let top = current.height().saturating_sub(crop) / 2;
            current = imageops::crop_imm(&current, left, top, crop, crop).to_image();
        }

        let (plane_w, plane_h) = if self.do_pad {
            let pad = required(self.pad_size.or(self.size), "padding")?;
            (pad, pad)
        } else {
            current.dimensions()
        };
        let (plane_w, plane_h) = (plane_w as usize, plane_h as usize);
        let plane = plane_w * plane_h;
        let channels: [usize; 3] = if self.flip_channels { [2, 1, 0] } else { [0, 1, 2] };

        let mut data = vec![0.0f32; 3 * plane];
        let copy_w = (current.width() as usize).min(plane_w);
        let copy_h = (current.height() as usize).min(plane_h);
        for y in 0..copy_h {
            for x in 0..copy_w {
                let pixel = current.get_pixel(x as u32, y as u32);
                for (slot, &source) in channels.iter().enumerate() {
                    data[slot * plane + y * plane_w + x] = self.value(pixel[source], source);
                }
            }
        }

        Ok(PreprocessedImage {
            tensor: Tensor::new(vec![1, 3, plane_h, plane_w], data)?,
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    #[test]
    fn normalization_uses_channel_mean_and_std() {
        let config = PreprocessorConfig {
            do_resize: false,
            do_normalize: true,
            ..Default::default()
        };
        let out = config.process(&solid(2, 2, [255, 0, 0])).unwrap();
        let red = out.tensor.at(&[0, 0, 0, 0]).unwrap();
        assert!((red - (1.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((red - 2.249).abs() < 1e-3);
        let green = out.tensor.at(&[0, 1, 1, 1]).unwrap();
        assert!((green - (0.0 - 0.456) / 0.224).abs() < 1e-4);
    }

    #[test]
    fn rescale_and_plain_scaling() {
        let rescale = PreprocessorConfig {
            do_resize: false,
            do_rescale: true,
            rescale_factor: 0.5,
            ..Default::default()
        };
        let out = rescale.process(&solid(1, 1, [10, 20, 30])).unwrap();
        assert_eq!(out.tensor.data(), &[5.0, 10.0, 15.0]);

        let plain = PreprocessorConfig {
            do_resize: false,
            ..Default::default()
        };
        let out = plain.process(&solid(1, 1, [255, 0, 51])).unwrap();
        assert_eq!(out.tensor.data(), &[1.0, 0.0, 0.2]);
    }

    #[test]
    fn resize_policies() {
        let mut config = PreprocessorConfig {
            size: Some(SizeSpec::Square(100)),
            ..Default::default()
        };
        assert_eq!(config.resized_dims(400, 200).unwrap(), (200, 100));

        config.resize_longer = true;
        assert_eq!(config.resized_dims(400, 200).unwrap(), (100, 50));
        assert_eq!(config.resized_dims(200, 400).unwrap(), (50, 100));

        config.square_image = true;
        assert_eq!(config.resized_dims(400, 200).unwrap(), (100, 100));
    }

    #[test]
    fn pad_fills_beyond_image_with_zero() {
        let config = PreprocessorConfig {
            size: Some(SizeSpec::Square(4)),
            resize_longer: true,
            do_pad: true,
            pad_size: Some(SizeSpec::Square(4)),
            ..Default::default()
        };
        let out = config.process(&solid(8, 4, [255, 255, 255])).unwrap();
        assert_eq!((out.width, out.height), (4, 2));
        assert_eq!(out.tensor.dims(), &[1, 3, 4, 4]);
        assert_eq!(out.tensor.at(&[0, 0, 1, 3]).unwrap(), 1.0);
        assert_eq!(out.tensor.at(&[0, 0, 2, 0]).unwrap(), 0.0);
        assert_eq!(out.tensor.at(&[0, 2, 3, 3]).unwrap(), 0.0);
    }

    #[test]
    fn flip_channels_orders_bgr() {
        let config = PreprocessorConfig {
            do_resize: false,
            flip_channels: true,
            ..Default::default()
        };
        let out = config.process(&solid(1, 1, [255, 0, 0])).unwrap();
        assert_eq!(out.tensor.data(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn center_crop_reports_pre_crop_dims() {
        let config = PreprocessorConfig {
            size: Some(SizeSpec::ShortestEdge { shortest_edge: 8 }),
            do_center_crop: true,
            crop_size: Some(SizeSpec::Dims { height: 4, width: 4 }),
            ..Default::default()
        };
        let out = config.process(&solid(16, 8, [0, 0, 0])).unwrap();
        assert_eq!((out.width, out.height), (16, 8));
        assert_eq!(out.tensor.dims(), &[1, 3, 4, 4]);
    }

    #[test]
    fn parses_huggingface_style_config() {
        let raw = r#"{
            "do_resize": true,
            "size": {"shortest_edge": 224},
            "do_center_crop": true,
            "crop_size": {"height": 224, "width": 224},
            "do_normalize": true,
            "image_mean": [0.5, 0.5, 0.5],
            "image_std": [0.5, 0.5, 0.5]
        }"#;
        let config: PreprocessorConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.size.unwrap().edge(), 224);
        assert_eq!(config.crop_size.unwrap().edge(), 224);
        assert_eq!(config.image_mean, [0.5, 0.5, 0.5]);
        assert!(!config.do_pad);
    }
}
