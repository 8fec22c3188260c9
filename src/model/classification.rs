use std::{sync::Arc, time::Instant};

use image::RgbImage;
use serde::Serialize;

use crate::{
    error::{Result, SdkError},
    model::{ClassLabels, ClassPrediction, ModelLoader, ModelMetadata},
    preprocess::PreprocessorConfig,
    session::{SessionHandle, resolve_input, resolve_output},
    tensor::{NamedTensors, Tensor, softmax, take_f32},
};

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub predictions: Vec<ClassPrediction>,
    pub elapsed: f64,
}

/// Image classifier: one `model` artifact producing `[1, classes]` logits.
pub struct ClassificationModel {
    metadata: ModelMetadata,
    session: Arc<dyn SessionHandle>,
    preprocessor: PreprocessorConfig,
    labels: ClassLabels,
}

impl ClassificationModel {
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
        let model = Self {
            metadata,
            session,
            preprocessor,
            labels,
        };
        Ok((model, start.elapsed().as_secs_f64()))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub async fn process(&self, image: &RgbImage, top: usize) -> Result<ClassificationResult> {
        let start = Instant::now();
        let pixels = self.preprocessor.process(image)?.tensor;

        let input = resolve_input(self.session.as_ref(), "pixel_values").await?;
        let output = resolve_output(self.session.as_ref(), "logits").await?;
        let mut feeds = NamedTensors::new();
        feeds.insert(input, pixels.into());
        let mut outputs = self.session.run(feeds).await?;
        let logits = take_f32(&mut outputs, &output)?;

        let predictions = top_classes(&softmax(first_row(&logits)?), &self.labels, top);
        Ok(ClassificationResult {
            predictions,
            elapsed: start.elapsed().as_secs_f64(),
        })
    }
}

pub(crate) fn first_row(logits: &Tensor<f32>) -> Result<&[f32]> {
    let width = match logits.dims() {
        [_, classes] | [_, 1, classes] => *classes,
        [classes] => *classes,
        dims => {
            return Err(SdkError::Shape(format!(
                "expected [batch, classes] logits, got {dims:?}"
            )));
        }
    };
    logits
        .data()
        .get(..width)
        .ok_or_else(|| SdkError::Shape("logits tensor is empty".into()))
}

/// Sorts by confidence, descending; equal confidences keep class order.
pub fn top_classes(probs: &[f32], labels: &ClassLabels, top: usize) -> Vec<ClassPrediction> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(top)
        .map(|(class, confidence)| ClassPrediction {
            class,
            label: labels
                .get(class)
                .map(str::to_string)
                .unwrap_or_else(|| format!("class_{class}")),
            confidence,
        })
        .collect()
}
