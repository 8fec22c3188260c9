use std::{sync::Arc, time::Instant};

use serde::Serialize;

use crate::{
    error::{Result, SdkError},
    model::{ModelLoader, ModelMetadata},
    session::{SessionHandle, resolve_input, resolve_output},
    tensor::{NamedTensors, Tensor, cosine_similarity, take_f32},
    tokenizer::{TextTokenizer, encode_batch},
};

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub elapsed: f64,
}

/// Sentence embedder: a text encoder plus an optional `dense` projection.
pub struct FeatureExtractionModel {
    metadata: ModelMetadata,
    encoder: Arc<dyn SessionHandle>,
    dense: Option<Arc<dyn SessionHandle>>,
    tokenizer: Arc<dyn TextTokenizer>,
}

impl FeatureExtractionModel {
    pub async fn init(
        metadata: ModelMetadata,
        loader: &ModelLoader,
        proxy: bool,
    ) -> Result<(Self, f64)> {
        let start = Instant::now();
        loader.check_memory(&metadata)?;
        let tokenizer = loader.tokenizer(&metadata).await?;
        let encoder = loader.session(&metadata, "model", proxy).await?;
        let dense = if metadata.has_artifact("dense") {
            Some(loader.session(&metadata, "dense", proxy).await?)
        } else {
            None
        };
        Ok((
            Self {
                metadata,
                encoder,
                dense,
                tokenizer,
            },
            start.elapsed().as_secs_f64(),
        ))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub async fn process(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let start = Instant::now();
        let pad = self.metadata.special_tokens().pad_token_id;
        let (input_ids, attention_mask) = encode_batch(self.tokenizer.as_ref(), texts, pad)?;

        let declared = self.encoder.input_names().await?;
        let mut feeds = NamedTensors::new();
        if declared.iter().any(|n| n == "token_type_ids") {
            feeds.insert(
                "token_type_ids".into(),
                Tensor::filled(input_ids.dims().to_vec(), 0i64).into(),
            );
        }
        feeds.insert("input_ids".into(), input_ids.into());
        feeds.insert("attention_mask".into(), attention_mask.clone().into());

        let output = resolve_output(self.encoder.as_ref(), "last_hidden_state").await?;
        let mut outputs = self.encoder.run(feeds).await?;
        let hidden = take_f32(&mut outputs, &output)?;
        let mut pooled = mean_pool(&hidden, &attention_mask)?;

        if let Some(dense) = &self.dense {
            let input = resolve_input(dense.as_ref(), "sentence_embedding").await?;
            let output = resolve_output(dense.as_ref(), "sentence_embedding").await?;
            let mut feeds = NamedTensors::new();
            feeds.insert(input, pooled.into());
            let mut outputs = dense.run(feeds).await?;
            pooled = take_f32(&mut outputs, &output)?;
        }

        let [batch, width] = pooled.dims()[..] else {
            return Err(SdkError::Shape(format!(
                "expected [batch, hidden] embeddings, got {:?}",
                pooled.dims()
            )));
        };
        let embeddings = pooled
            .data()
            .chunks_exact(width.max(1))
            .take(batch)
            .map(normalize)
            .collect();
        Ok(EmbeddingResult {
            embeddings,
            elapsed: start.elapsed().as_secs_f64(),
        })
    }

    pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }
}

/// Mean of the hidden states over unmasked positions, `[batch, hidden]`.
pub fn mean_pool(hidden: &Tensor<f32>, mask: &Tensor<i64>) -> Result<Tensor<f32>> {
    let [batch, seq, width] = hidden.dims()[..] else {
        return Err(SdkError::Shape(format!(
            "expected [batch, seq, hidden] states, got {:?}",
            hidden.dims()
        )));
    };
    if mask.dims() != [batch, seq] {
        return Err(SdkError::Shape(format!(
            "mask {:?} does not cover hidden states {:?}",
            mask.dims(),
            hidden.dims()
        )));
    }

    let states = hidden.data();
    let mask = mask.data();
    let mut pooled = vec![0.0f32; batch * width];
    for b in 0..batch {
        let row = &mut pooled[b * width..(b + 1) * width];
        let mut count = 0.0f32;
        for s in 0..seq {
            if mask[b * seq + s] == 0 {
                continue;
            }
            count += 1.0;
            let start = (b * seq + s) * width;
            for (acc, v) in row.iter_mut().zip(&states[start..start + width]) {
                *acc += v;
            }
        }
        if count > 0.0 {
            row.iter_mut().for_each(|v| *v /= count);
        }
    }
    Tensor::new(vec![batch, width], pooled)
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}
