use std::{sync::Arc, time::Instant};

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use image::RgbImage;

use crate::{
    error::{Result, SdkError},
    generation::{
        Decoder, Encoder, EncoderInput, EncoderKind, GeneratedText, Generation, GenerationConfig,
        collect_text, text_deltas,
    },
    model::{GenerationOptions, ModelLoader, ModelMetadata},
    preprocess::PreprocessorConfig,
    tensor::Tensor,
    tokenizer::TextTokenizer,
};

pub struct Img2TextModel {
    metadata: ModelMetadata,
    encoder: Encoder,
    decoder: Decoder,
    preprocessor: PreprocessorConfig,
    tokenizer: Arc<dyn TextTokenizer>,
}

impl Img2TextModel {
    pub async fn init(
        metadata: ModelMetadata,
        loader: &ModelLoader,
        proxy: bool,
    ) -> Result<(Self, f64)> {
        let start = Instant::now();
        loader.check_memory(&metadata)?;
        let preprocessor = loader.preprocessor(&metadata).await?;
        let tokenizer = loader.tokenizer(&metadata).await?;
        let encoder = loader.session(&metadata, "encoder", proxy).await?;
        let decoder = loader.session(&metadata, "decoder", proxy).await?;
        Ok((
            Self {
                metadata,
                encoder: Encoder::new(encoder, EncoderKind::Img2Seq),
                decoder: Decoder::new(decoder),
                preprocessor,
                tokenizer,
            },
            start.elapsed().as_secs_f64(),
        ))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// Captions every image. A `prefix` primes every caption with that text.
    pub async fn process(
        &self,
        images: &[RgbImage],
        prefix: Option<&str>,
        options: GenerationOptions,
    ) -> Result<GeneratedText> {
        let generation = self.generation(images, prefix, options)?;
        collect_text(generation, self.tokenizer.clone()).await
    }

    pub fn process_stream(
        &self,
        images: &[RgbImage],
        prefix: Option<&str>,
        options: GenerationOptions,
    ) -> BoxStream<'static, Result<Vec<String>>> {
        match self.generation(images, prefix, options) {
            Ok(generation) => text_deltas(generation, self.tokenizer.clone()).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }

    fn generation(
        &self,
        images: &[RgbImage],
        prefix: Option<&str>,
        options: GenerationOptions,
    ) -> Result<Generation> {
        if images.is_empty() {
            return Err(SdkError::BadRequest("at least one image is required".into()));
        }
        let pixels = images
            .iter()
            .map(|image| self.preprocessor.process(image).map(|p| p.tensor))
            .collect::<Result<Vec<_>>>()?;
        let pixel_values = Tensor::stack(&pixels)?;
        let batch = pixel_values.dims()[0];

        let tokens = self.metadata.special_tokens();
        let config = GenerationConfig {
            max_tokens: options.max_tokens,
            max_length: options.max_length,
            pad_token_id: tokens.pad_token_id,
            bos_token_id: tokens.bos_token_id,
            eos_token_id: tokens.eos_token_id,
        };
        let initial = match prefix {
            Some(prefix) if !prefix.is_empty() => {
                Some(self.primed_input(prefix, batch, tokens.bos_token_id)?)
            }
            _ => None,
        };
        Generation::new(
            self.encoder.clone(),
            self.decoder.clone(),
            config,
            EncoderInput::Pixels { pixel_values },
            initial,
        )
    }

    /// `bos` followed by the prefix tokens, repeated for every image.
    fn primed_input(
        &self,
        prefix: &str,
        batch: usize,
        bos_token_id: i64,
    ) -> Result<(Tensor<i64>, Tensor<i64>)> {
        let mut row = vec![bos_token_id];
        row.extend(self.tokenizer.encode(prefix, false)?);
        let dims = vec![batch, row.len()];
        let ids = row.repeat(batch);
        Ok((Tensor::new(dims.clone(), ids)?, Tensor::filled(dims, 1)))
    }
}
