//! Greedy autoregressive decoding.
//!
//! A [`Generation`] drives the encoder once and then the decoder once per
//! step, yielding the token chosen for every sequence of the batch at each
//! step. Steps are strictly sequential; dropping the generation (or the
//! stream made from it) stops further steps from being scheduled.

pub mod adapters;
pub mod text;

use futures::stream::{self, Stream};
use tracing::{debug, warn};

use crate::{
    error::{Result, SdkError},
    tensor::{Tensor, argmax_slice},
};

pub use adapters::{Decoder, DecoderInput, Encoder, EncoderInput, EncoderKind};
pub use text::{GeneratedText, collect_text, text_deltas};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    pub max_tokens: Option<usize>,
    /// Stop once the decoder sequence (initial tokens included) reaches this length.
    pub max_length: Option<usize>,
    pub pad_token_id: i64,
    pub bos_token_id: i64,
    pub eos_token_id: i64,
}

impl GenerationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_tokens == Some(0) || self.max_length == Some(0) {
            return Err(SdkError::Config(
                "max_tokens and max_length must be at least 1 when set".into(),
            ));
        }
        if self.max_tokens.is_none() && self.max_length.is_none() {
            warn!("generation has no length limit; it stops only when every sequence ends");
        }
        Ok(())
    }
}

/// Chooses the next token of every sequence from decoder logits.
pub trait Sampler: Send + Sync {
    fn sample(&self, logits: &Tensor<f32>) -> Result<Vec<i64>>;
}

/// Highest logit at the last position; first index wins ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&self, logits: &Tensor<f32>) -> Result<Vec<i64>> {
        let [batch, seq, vocab] = logits.dims()[..] else {
            return Err(SdkError::Shape(format!(
                "expected [batch, seq, vocab] logits, got {:?}",
                logits.dims()
            )));
        };
        if seq == 0 || vocab == 0 {
            return Err(SdkError::Shape(format!("empty logits {:?}", logits.dims())));
        }
        let data = logits.data();
        (0..batch)
            .map(|b| {
                let start = (b * seq + seq - 1) * vocab;
                argmax_slice(&data[start..start + vocab])
                    .map(|i| i as i64)
                    .ok_or_else(|| SdkError::Shape("empty vocabulary slice".into()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    EncoderPending,
    Decoding,
    AllFinished,
    LengthLimitReached,
}

/// One generation call. Not resumable once finished; start a new one instead.
pub struct Generation {
    encoder: Encoder,
    decoder: Decoder,
    sampler: Box<dyn Sampler>,
    config: GenerationConfig,
    input: EncoderInput,
    encoder_output: Option<Tensor<f32>>,
    decoder_input_ids: Tensor<i64>,
    decoder_attention: Tensor<i64>,
    finished: Vec<bool>,
    steps: usize,
    phase: GenerationPhase,
}

impl Generation {
    /// Starts a generation. `initial` replaces the default `[batch, 1]`
    /// bos-filled decoder input and its all-ones mask.
    pub fn new(
        encoder: Encoder,
        decoder: Decoder,
        config: GenerationConfig,
        input: EncoderInput,
        initial: Option<(Tensor<i64>, Tensor<i64>)>,
    ) -> Result<Self> {
        config.validate()?;
        let batch = input.batch_size();
        if batch == 0 {
            return Err(SdkError::Shape("generation needs a non-empty batch".into()));
        }
        let (decoder_input_ids, decoder_attention) = match initial {
            Some((ids, mask)) => {
                if ids.dims().len() != 2 || ids.dims()[0] != batch || ids.dims()[1] == 0 {
                    return Err(SdkError::Shape(format!(
                        "initial decoder input {:?} does not fit batch of {batch}",
                        ids.dims()
                    )));
                }
                if mask.dims() != ids.dims() {
                    return Err(SdkError::Shape(format!(
                        "initial decoder mask {:?} does not match input {:?}",
                        mask.dims(),
                        ids.dims()
                    )));
                }
                (ids, mask)
            }
            None => (
                Tensor::filled(vec![batch, 1], config.bos_token_id),
                Tensor::filled(vec![batch, 1], 1),
            ),
        };

        Ok(Self {
            encoder,
            decoder,
            sampler: Box::new(GreedySampler),
            config,
            input,
            encoder_output: None,
            decoder_input_ids,
            decoder_attention,
            finished: vec![false; batch],
            steps: 0,
            phase: GenerationPhase::EncoderPending,
        })
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn phase(&self) -> GenerationPhase {
        self.phase
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    fn is_done(&self) -> bool {
        matches!(
            self.phase,
            GenerationPhase::AllFinished | GenerationPhase::LengthLimitReached
        )
    }

    /// Runs one decoding step. Returns the token appended to every sequence,
    /// or `None` once a termination condition was hit.
    pub async fn next_step(&mut self) -> Result<Option<Vec<i64>>> {
        if self.is_done() {
            return Ok(None);
        }
        if self.phase == GenerationPhase::EncoderPending {
            let hidden = self.encoder.run(&self.input, None).await?;
            self.encoder_output = Some(hidden);
            self.phase = GenerationPhase::Decoding;
        }
        let Some(encoder_output) = self.encoder_output.as_ref() else {
            return Err(SdkError::Inference("encoder output missing while decoding".into()));
        };

        let logits = self
            .decoder
            .run(DecoderInput {
                input_ids: &self.decoder_input_ids,
                encoder_hidden_states: encoder_output,
                attention_mask: Some(&self.decoder_attention),
                encoder_attention_mask: self.input.attention_mask(),
            })
            .await?;
        let sampled = self.sampler.sample(&logits)?;
        if sampled.len() != self.finished.len() {
            return Err(SdkError::Shape(format!(
                "decoder returned {} sequences for a batch of {}",
                sampled.len(),
                self.finished.len()
            )));
        }

        let GenerationConfig {
            pad_token_id,
            eos_token_id,
            ..
        } = self.config;
        let mut tokens = Vec::with_capacity(sampled.len());
        let mut attention = Vec::with_capacity(sampled.len());
        for (token, finished) in sampled.into_iter().zip(self.finished.iter_mut()) {
            let token = if *finished { pad_token_id } else { token };
            attention.push(i64::from(token != eos_token_id && token != pad_token_id));
            if token == eos_token_id {
                *finished = true;
            }
            tokens.push(token);
        }

        self.decoder_input_ids = self.decoder_input_ids.append_column(&tokens)?;
        self.decoder_attention = self.decoder_attention.append_column(&attention)?;
        self.steps += 1;

        let length = self.decoder_input_ids.dims()[1];
        if self.finished.iter().all(|&f| f) {
            self.phase = GenerationPhase::AllFinished;
        } else if self.config.max_tokens.is_some_and(|max| self.steps >= max)
            || self.config.max_length.is_some_and(|max| length >= max)
        {
            self.phase = GenerationPhase::LengthLimitReached;
        }
        if self.is_done() {
            debug!(steps = self.steps, phase = ?self.phase, "generation finished");
        }
        Ok(Some(tokens))
    }

    /// Consumes the generation into a stream of per-step token batches.
    /// An error ends the stream after being yielded.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<i64>>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut generation = state?;
            match generation.next_step().await {
                Ok(Some(tokens)) => Some((Ok(tokens), Some(generation))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
