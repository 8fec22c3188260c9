use std::{sync::Arc, time::Instant};

use futures::{StreamExt, stream::{self, BoxStream}};
use serde::Deserialize;

use crate::{
    error::{Result, SdkError},
    generation::{
        Decoder, Encoder, EncoderInput, EncoderKind, GeneratedText, Generation, GenerationConfig,
        collect_text, text_deltas,
    },
    model::{ModelLoader, ModelMetadata},
    tokenizer::{TextTokenizer, encode_batch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub max_tokens: Option<usize>,
    pub max_length: Option<usize>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            max_length: Some(512),
        }
    }
}

/// Text-to-text encoder/decoder model (T5, BART, Marian).
pub struct Seq2SeqModel {
    metadata: ModelMetadata,
    encoder: Encoder,
    decoder: Decoder,
    tokenizer: Arc<dyn TextTokenizer>,
}

impl Seq2SeqModel {
    pub async fn init(
        metadata: ModelMetadata,
        loader: &ModelLoader,
        proxy: bool,
    ) -> Result<(Self, f64)> {
        let start = Instant::now();
        loader.check_memory(&metadata)?;
        let tokenizer = loader.tokenizer(&metadata).await?;
        let encoder = loader.session(&metadata, "encoder", proxy).await?;
        let decoder = loader.session(&metadata, "decoder", proxy).await?;
        Ok((
            Self {
                metadata,
                encoder: Encoder::new(encoder, EncoderKind::Seq2Seq),
                decoder: Decoder::new(decoder),
                tokenizer,
            },
            start.elapsed().as_secs_f64(),
        ))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub async fn process(
        &self,
        texts: &[String],
        prefix: Option<&str>,
        options: GenerationOptions,
    ) -> Result<GeneratedText> {
        let generation = self.generation(texts, prefix, options)?;
        collect_text(generation, self.tokenizer.clone()).await
    }

    pub fn process_stream(
        &self,
        texts: &[String],
        prefix: Option<&str>,
        options: GenerationOptions,
    ) -> BoxStream<'static, Result<Vec<String>>> {
        match self.generation(texts, prefix, options) {
            Ok(generation) => text_deltas(generation, self.tokenizer.clone()).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }

    fn generation(
        &self,
        texts: &[String],
        prefix: Option<&str>,
        options: GenerationOptions,
    ) -> Result<Generation> {
        let texts = self.with_prefix(texts, prefix)?;
        let tokens = self.metadata.special_tokens();
        let (input_ids, attention_mask) =
            encode_batch(self.tokenizer.as_ref(), &texts, tokens.pad_token_id)?;
        let config = GenerationConfig {
            max_tokens: options.max_tokens,
            max_length: options.max_length,
            pad_token_id: tokens.pad_token_id,
            bos_token_id: tokens.bos_token_id,
            eos_token_id: tokens.eos_token_id,
        };
        Generation::new(
            self.encoder.clone(),
            self.decoder.clone(),
            config,
            EncoderInput::Text {
                input_ids,
                attention_mask: Some(attention_mask),
            },
            None,
        )
    }

    fn with_prefix(&self, texts: &[String], prefix: Option<&str>) -> Result<Vec<String>> {
        let Some(prefix) = prefix else {
            return Ok(texts.to_vec());
        };
        if !self.metadata.prefixes.iter().any(|p| p == prefix) {
            return Err(SdkError::Config(format!(
                "model {} does not support prefix `{prefix}` (supported: {:?})",
                self.metadata.id, self.metadata.prefixes
            )));
        }
        Ok(texts.iter().map(|text| format!("{prefix} {text}")).collect())
    }
}
