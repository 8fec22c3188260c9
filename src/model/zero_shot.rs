use std::{sync::Arc, time::Instant};

use image::RgbImage;
use serde::Serialize;

use crate::{
    error::{Result, SdkError},
    model::{ClassLabels, ClassPrediction, ModelLoader, ModelMetadata, top_classes},
    preprocess::PreprocessorConfig,
    session::SessionHandle,
    tensor::{NamedTensors, Tensor, cosine_similarity, softmax, take_f32},
    tokenizer::{TextTokenizer, encode_batch},
};

/// CLIP's learned temperature, fixed at export time.
const LOGIT_SCALE: f32 = 100.0;

#[derive(Debug, Clone, Serialize)]
pub struct ZeroShotResult {
    pub predictions: Vec<ClassPrediction>,
    pub elapsed: f64,
}

/// Scores an image against free-text candidate classes with a joint
/// image/text embedding model.
pub struct ZeroShotClassificationModel {
    metadata: ModelMetadata,
    session: Arc<dyn SessionHandle>,
    preprocessor: PreprocessorConfig,
    tokenizer: Arc<dyn TextTokenizer>,
}

impl ZeroShotClassificationModel {
    pub async fn init(
        metadata: ModelMetadata,
        loader: &ModelLoader,
        proxy: bool,
    ) -> Result<(Self, f64)> {
        let start = Instant::now();
        loader.check_memory(&metadata)?;
        let preprocessor = loader.preprocessor(&metadata).await?;
        let tokenizer = loader.tokenizer(&metadata).await?;
        let session = loader.session(&metadata, "model", proxy).await?;
        Ok((
            Self {
                metadata,
                session,
                preprocessor,
                tokenizer,
            },
            start.elapsed().as_secs_f64(),
        ))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub async fn process(&self, image: &RgbImage, classes: &[String]) -> Result<ZeroShotResult> {
        let start = Instant::now();
        let pixels = self.preprocessor.process(image)?.tensor;
        let pad = self.metadata.special_tokens().pad_token_id;
        let (input_ids, attention_mask) = encode_batch(self.tokenizer.as_ref(), classes, pad)?;

        let mut feeds = NamedTensors::new();
        feeds.insert("pixel_values".into(), pixels.into());
        feeds.insert("input_ids".into(), input_ids.into());
        feeds.insert("attention_mask".into(), attention_mask.into());
        let mut outputs = self.session.run(feeds).await?;
        let image_embeds = take_f32(&mut outputs, "image_embeds")?;
        let text_embeds = take_f32(&mut outputs, "text_embeds")?;

        let scores = scaled_similarities(&image_embeds, &text_embeds, classes.len())?;
        let labels = ClassLabels::new(classes.to_vec());
        Ok(ZeroShotResult {
            predictions: top_classes(&softmax(&scores), &labels, classes.len()),
            elapsed: start.elapsed().as_secs_f64(),
        })
    }
}

/// Cosine similarity of the image embedding with each text embedding, times
/// the logit scale.
fn scaled_similarities(
    image_embeds: &Tensor<f32>,
    text_embeds: &Tensor<f32>,
    classes: usize,
) -> Result<Vec<f32>> {
    let [_, width] = image_embeds.dims()[..] else {
        return Err(SdkError::Shape(format!(
            "expected [1, dim] image embeddings, got {:?}",
            image_embeds.dims()
        )));
    };
    if text_embeds.dims() != [classes, width] || width == 0 {
        return Err(SdkError::Shape(format!(
            "expected [{classes}, {width}] text embeddings, got {:?}",
            text_embeds.dims()
        )));
    }
    let image = &image_embeds.data()[..width];
    Ok(text_embeds
        .data()
        .chunks_exact(width)
        .map(|text| cosine_similarity(image, text) * LOGIT_SCALE)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_text_gets_the_highest_score() {
        let image = Tensor::new(vec![1, 2], vec![1.0, 0.0]).unwrap();
        let texts = Tensor::new(vec![2, 2], vec![0.0, 1.0, 2.0, 0.1]).unwrap();
        let scores = scaled_similarities(&image, &texts, 2).unwrap();
        assert!(scores[0].abs() < 1e-4);
        assert!(scores[1] > 99.0);
        let probs = softmax(&scores);
        assert!(probs[1] > 0.99);
    }
}
