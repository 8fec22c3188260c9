use std::{sync::Arc, time::Instant};

use image::RgbImage;
use serde::Serialize;

use crate::{
    error::{Result, SdkError},
    model::{ClassLabels, ModelLoader, ModelMetadata},
    preprocess::PreprocessorConfig,
    session::{SessionHandle, resolve_input},
    tensor::{NamedTensors, Tensor, argmax_slice, softmax, take_f32},
};

/// Boxes at or below this confidence are dropped.
pub const CONFIDENCE_THRESHOLD: f32 = 0.9;

/// One detection. Coordinates are relative to the image (0..1), with
/// `(x, y)` the top-left corner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class: usize,
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub elapsed: f64,
}

/// DETR-style detector with `logits` `[1, boxes, classes]` and
/// `pred_boxes` `[1, boxes, 4]` (centre x, centre y, width, height).
pub struct ObjectDetectionModel {
    metadata: ModelMetadata,
    session: Arc<dyn SessionHandle>,
    preprocessor: PreprocessorConfig,
    labels: ClassLabels,
}

impl ObjectDetectionModel {
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

        let outputs = session.output_names().await?;
        for required in ["logits", "pred_boxes"] {
            if !outputs.iter().any(|o| o == required) {
                return Err(SdkError::Config(format!(
                    "detector {} declares no {required} output",
                    metadata.id
                )));
            }
        }

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

    pub async fn process(&self, image: &RgbImage) -> Result<DetectionResult> {
        let start = Instant::now();
        let pixels = self.preprocessor.process(image)?.tensor;

        let input = resolve_input(self.session.as_ref(), "pixel_values").await?;
        let mut feeds = NamedTensors::new();
        feeds.insert(input, pixels.into());
        let mut outputs = self.session.run(feeds).await?;
        let logits = take_f32(&mut outputs, "logits")?;
        let boxes = take_f32(&mut outputs, "pred_boxes")?;

        Ok(DetectionResult {
            detections: decode_detections(&logits, &boxes, &self.labels)?,
            elapsed: start.elapsed().as_secs_f64(),
        })
    }
}

/// Turns raw detector outputs into thresholded, corner-anchored boxes.
///
/// Classes without a label (the trailing "no object" class) are skipped.
pub fn decode_detections(
    logits: &Tensor<f32>,
    boxes: &Tensor<f32>,
    labels: &ClassLabels,
) -> Result<Vec<Detection>> {
    let [1, count, classes] = logits.dims()[..] else {
        return Err(SdkError::Shape(format!(
            "expected [1, boxes, classes] logits, got {:?}",
            logits.dims()
        )));
    };
    if classes == 0 {
        return Err(SdkError::Shape("detector produced no class logits".into()));
    }
    if boxes.dims() != [1, count, 4] {
        return Err(SdkError::Shape(format!(
            "expected [1, {count}, 4] boxes, got {:?}",
            boxes.dims()
        )));
    }

    let mut detections = Vec::new();
    for (scores, bbox) in logits
        .data()
        .chunks_exact(classes)
        .zip(boxes.data().chunks_exact(4))
    {
        let probs = softmax(scores);
        let Some(class) = argmax_slice(&probs) else {
            continue;
        };
        let confidence = probs[class];
        if confidence <= CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(label) = labels.get(class) else {
            continue;
        };
        let [cx, cy, w, h] = [bbox[0], bbox[1], bbox[2], bbox[3]];
        detections.push(Detection {
            class,
            label: label.to_string(),
            confidence,
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            width: w,
            height: h,
        });
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> ClassLabels {
        ClassLabels::new(vec!["cat".into(), "dog".into()])
    }

    #[test]
    fn confident_boxes_are_converted_to_corners() {
        // box 0 is a clear dog, box 1 is uncertain, box 2 is "no object"
        let logits = Tensor::new(
            vec![1, 3, 3],
            vec![0.0, 10.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 10.0],
        )
        .unwrap();
        let boxes = Tensor::new(
            vec![1, 3, 4],
            vec![0.5, 0.5, 0.2, 0.4, 0.1, 0.1, 0.1, 0.1, 0.3, 0.3, 0.2, 0.2],
        )
        .unwrap();
        let found = decode_detections(&logits, &boxes, &labels()).unwrap();
        assert_eq!(found.len(), 1);
        let dog = &found[0];
        assert_eq!(dog.label, "dog");
        assert!((dog.x - 0.4).abs() < 1e-6);
        assert!((dog.y - 0.3).abs() < 1e-6);
        assert!((dog.width - 0.2).abs() < 1e-6);
    }

    #[test]
    fn box_count_mismatch_is_a_shape_error() {
        let logits = Tensor::filled(vec![1, 2, 3], 0.0);
        let boxes = Tensor::filled(vec![1, 3, 4], 0.0);
        assert!(matches!(
            decode_detections(&logits, &boxes, &labels()),
            Err(SdkError::Shape(_))
        ));
    }
}
