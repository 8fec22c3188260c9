//! Task-shaped feeds over a generic session.

use std::sync::Arc;

use crate::{
    error::{Result, SdkError},
    session::{SessionHandle, resolve_output},
    tensor::{NamedTensors, Tensor, TensorValue, take_f32},
};

const HIDDEN_STATE_OUTPUT: &str = "last_hidden_state";
const LOGITS_OUTPUT: &str = "logits";

/// What the encoder consumes once per generation call.
#[derive(Debug, Clone)]
pub enum EncoderInput {
    Text {
        input_ids: Tensor<i64>,
        attention_mask: Option<Tensor<i64>>,
    },
    Pixels {
        pixel_values: Tensor<f32>,
    },
}

impl EncoderInput {
    pub fn batch_size(&self) -> usize {
        let dims = match self {
            EncoderInput::Text { input_ids, .. } => input_ids.dims(),
            EncoderInput::Pixels { pixel_values } => pixel_values.dims(),
        };
        dims.first().copied().unwrap_or(0)
    }

    pub fn attention_mask(&self) -> Option<&Tensor<i64>> {
        match self {
            EncoderInput::Text { attention_mask, .. } => attention_mask.as_ref(),
            EncoderInput::Pixels { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Seq2Seq,
    Img2Seq,
}

#[derive(Clone)]
pub struct Encoder {
    session: Arc<dyn SessionHandle>,
    kind: EncoderKind,
}

impl Encoder {
    pub fn new(session: Arc<dyn SessionHandle>, kind: EncoderKind) -> Self {
        Self { session, kind }
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    /// Runs the encoder, returning its hidden states `[batch, seq, hidden]`.
    pub async fn run(
        &self,
        input: &EncoderInput,
        encoder_hidden_states: Option<&Tensor<f32>>,
    ) -> Result<Tensor<f32>> {
        let mut feeds = NamedTensors::new();
        match (self.kind, input) {
            (EncoderKind::Seq2Seq, EncoderInput::Text { input_ids, attention_mask }) => {
                let attention_mask = attention_mask.as_ref().ok_or_else(|| {
                    SdkError::Shape("seq2seq encoder requires an attention mask".into())
                })?;
                if attention_mask.dims() != input_ids.dims() {
                    return Err(SdkError::Shape(format!(
                        "attention mask {:?} does not match input ids {:?}",
                        attention_mask.dims(),
                        input_ids.dims()
                    )));
                }
                let declared = self.session.input_names().await?;
                if declared.iter().any(|n| n == "token_type_ids") {
                    feeds.insert(
                        "token_type_ids".into(),
                        Tensor::filled(input_ids.dims().to_vec(), 0i64).into(),
                    );
                }
                feeds.insert("input_ids".into(), input_ids.clone().into());
                feeds.insert("attention_mask".into(), attention_mask.clone().into());
                if let Some(hidden) = encoder_hidden_states {
                    feeds.insert("encoder_hidden_states".into(), hidden.clone().into());
                }
            }
            (EncoderKind::Img2Seq, EncoderInput::Pixels { pixel_values }) => {
                feeds.insert("pixel_values".into(), pixel_values.clone().into());
            }
            (kind, _) => {
                return Err(SdkError::Shape(format!(
                    "{kind:?} encoder cannot consume this input"
                )));
            }
        }

        let name = resolve_output(self.session.as_ref(), HIDDEN_STATE_OUTPUT).await?;
        let mut outputs = self.session.run(feeds).await?;
        take_f32(&mut outputs, &name)
    }
}

pub struct DecoderInput<'a> {
    pub input_ids: &'a Tensor<i64>,
    pub encoder_hidden_states: &'a Tensor<f32>,
    pub attention_mask: Option<&'a Tensor<i64>>,
    pub encoder_attention_mask: Option<&'a Tensor<i64>>,
}

#[derive(Clone)]
pub struct Decoder {
    session: Arc<dyn SessionHandle>,
}

impl Decoder {
    pub fn new(session: Arc<dyn SessionHandle>) -> Self {
        Self { session }
    }

    /// Runs one step, returning logits `[batch, seq, vocab]`.
    pub async fn run(&self, input: DecoderInput<'_>) -> Result<Tensor<f32>> {
        let declared = self.session.input_names().await?;
        let wants = |name: &str| declared.iter().any(|n| n == name);

        let mut feeds = NamedTensors::new();
        feeds.insert("input_ids".into(), TensorValue::from(input.input_ids.clone()));
        feeds.insert(
            "encoder_hidden_states".into(),
            input.encoder_hidden_states.clone().into(),
        );
        if wants("attention_mask") {
            let mask = input.attention_mask.ok_or_else(|| {
                SdkError::Shape("decoder declares attention_mask but none was supplied".into())
            })?;
            feeds.insert("attention_mask".into(), mask.clone().into());
        }
        if wants("encoder_attention_mask") {
            let mask = input.encoder_attention_mask.ok_or_else(|| {
                SdkError::Shape(
                    "decoder declares encoder_attention_mask but none was supplied".into(),
                )
            })?;
            feeds.insert("encoder_attention_mask".into(), mask.clone().into());
        }

        let name = resolve_output(self.session.as_ref(), LOGITS_OUTPUT).await?;
        let mut outputs = self.session.run(feeds).await?;
        let logits = take_f32(&mut outputs, &name)?;
        if logits.dims().len() != 3 {
            return Err(SdkError::Shape(format!(
                "decoder logits must be [batch, seq, vocab], got {:?}",
                logits.dims()
            )));
        }
        Ok(logits)
    }
}
