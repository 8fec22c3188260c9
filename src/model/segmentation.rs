use std::{collections::BTreeSet, sync::Arc, time::Instant};

use image::{Rgba, RgbaImage};
use serde::Serialize;

use crate::{
    error::{Result, SdkError},
    model::{ClassLabels, ModelLoader, ModelMetadata},
    preprocess::PreprocessorConfig,
    session::{SessionHandle, resolve_input, resolve_output},
    tensor::{NamedTensors, Tensor, take_f32},
};

#[derive(Debug, Clone, Serialize)]
pub struct SegmentClass {
    pub class: usize,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct SegmentationResult {
    /// Class id per pixel, `[height, width]` of the model output.
    pub mask: Tensor<i64>,
    pub classes: Vec<SegmentClass>,
    pub overlay: RgbaImage,
    pub elapsed: f64,
}

pub struct SegmentationModel {
    metadata: ModelMetadata,
    session: Arc<dyn SessionHandle>,
    preprocessor: PreprocessorConfig,
    labels: ClassLabels,
}

impl SegmentationModel {
    pub async fn init(
        metadata: ModelMetadata,
        loader: &ModelLoader,
        proxy: bool,
    ) -> Result<(Self, f64)> {
        let start = Instant::now();
        loader.check_memory(&metadata)?;
        let preprocessor = loader.preprocessor(&metadata).await?;
        let labels = loader.labels(&metadata).await?;
        let session = loader.session(&metadata, "model", proxy).await?;
        Ok((
            Self {
                metadata,
                session,
                preprocessor,
                labels,
            },
            start.elapsed().as_secs_f64(),
        ))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub async fn process(&self, image: &image::RgbImage) -> Result<SegmentationResult> {
        let start = Instant::now();
        let pixels = self.preprocessor.process(image)?.tensor;

        let input = resolve_input(self.session.as_ref(), "pixel_values").await?;
        let output = resolve_output(self.session.as_ref(), "logits").await?;
        let mut feeds = NamedTensors::new();
        feeds.insert(input, pixels.into());
        let mut outputs = self.session.run(feeds).await?;
        let logits = take_f32(&mut outputs, &output)?;

        let mask = class_mask(&logits)?;
        let classes = present_classes(&mask, &self.labels);
        let overlay = overlay(&mask)?;
        Ok(SegmentationResult {
            mask,
            classes,
            overlay,
            elapsed: start.elapsed().as_secs_f64(),
        })
    }
}

/// Argmax over the class axis of `[1, classes, h, w]` logits, giving `[h, w]`.
pub fn class_mask(logits: &Tensor<f32>) -> Result<Tensor<i64>> {
    let [1, _, height, width] = logits.dims()[..] else {
        return Err(SdkError::Shape(format!(
            "expected [1, classes, height, width] logits, got {:?}",
            logits.dims()
        )));
    };
    logits.argmax(1)?.reshape(vec![height, width])
}

fn present_classes(mask: &Tensor<i64>, labels: &ClassLabels) -> Vec<SegmentClass> {
    let ids: BTreeSet<i64> = mask.data().iter().copied().collect();
    ids.into_iter()
        .map(|id| {
            let class = id as usize;
            SegmentClass {
                class,
                label: labels
                    .get(class)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{class}")),
            }
        })
        .collect()
}

/// Stable colour for a class id. Class 0 (background) is transparent.
pub fn palette(class: i64) -> Rgba<u8> {
    if class == 0 {
        return Rgba([0, 0, 0, 0]);
    }
    let c = class as u32;
    Rgba([
        (c.wrapping_mul(97) % 256) as u8,
        (c.wrapping_mul(57).wrapping_add(80) % 256) as u8,
        (c.wrapping_mul(151).wrapping_add(160) % 256) as u8,
        160,
    ])
}

fn overlay(mask: &Tensor<i64>) -> Result<RgbaImage> {
    let [height, width] = mask.dims()[..] else {
        return Err(SdkError::Shape(format!("mask must be 2-d, got {:?}", mask.dims())));
    };
    let data = mask.data();
    Ok(RgbaImage::from_fn(width as u32, height as u32, |x, y| {
        palette(data[y as usize * width + x as usize])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_takes_best_class_per_pixel() {
        // two classes over a 1x2 image: pixel 0 prefers class 1, pixel 1 class 0
        let logits = Tensor::new(vec![1, 2, 1, 2], vec![0.1, 0.9, 0.8, 0.2]).unwrap();
        let mask = class_mask(&logits).unwrap();
        assert_eq!(mask.dims(), &[1, 2]);
        assert_eq!(mask.data(), &[1, 0]);

        let labels = ClassLabels::new(vec!["background".into(), "person".into()]);
        let classes = present_classes(&mask, &labels);
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[1].label, "person");

        let image = overlay(&mask).unwrap();
        assert_eq!(image.get_pixel(0, 0), &palette(1));
        assert_eq!(image.get_pixel(1, 0)[3], 0);
    }
}
