use std::sync::Arc;

use tokenizers::Tokenizer;

use crate::error::{Result, SdkError};
use crate::tensor::Tensor;

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<i64>>;
    fn decode(&self, ids: &[i64], skip_special_tokens: bool) -> Result<String>;
}

pub struct HfTokenizer(Tokenizer);

impl HfTokenizer {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Tokenizer::from_bytes(bytes)
            .map(Self)
            .map_err(|e| SdkError::Tokenizer(e.to_string()))
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<i64>> {
        let encoding = self
            .0
            .encode(text, add_special_tokens)
            .map_err(|e| SdkError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    fn decode(&self, ids: &[i64], skip_special_tokens: bool) -> Result<String> {
        let ids: Vec<u32> = ids
            .iter()
            .map(|&id| {
                u32::try_from(id).map_err(|_| SdkError::Tokenizer(format!("invalid token id {id}")))
            })
            .collect::<Result<_>>()?;
        self.0
            .decode(&ids, skip_special_tokens)
            .map_err(|e| SdkError::Tokenizer(e.to_string()))
    }
}

pub fn tokenizer_from_bytes(bytes: &[u8]) -> Result<Arc<dyn TextTokenizer>> {
    Ok(Arc::new(HfTokenizer::from_bytes(bytes)?))
}

/// Encodes a batch and right-pads it to the longest sequence.
///
/// Returns `(input_ids, attention_mask)`, both `[batch, longest]`.
pub fn encode_batch(
    tokenizer: &dyn TextTokenizer,
    texts: &[String],
    pad_token_id: i64,
) -> Result<(Tensor<i64>, Tensor<i64>)> {
    if texts.is_empty() {
        return Err(SdkError::BadRequest("at least one input text is required".into()));
    }
    let encoded = texts
        .iter()
        .map(|text| tokenizer.encode(text, true))
        .collect::<Result<Vec<_>>>()?;
    let longest = encoded.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let mut ids = Vec::with_capacity(texts.len() * longest);
    let mut mask = Vec::with_capacity(texts.len() * longest);
    for seq in &encoded {
        ids.extend_from_slice(seq);
        mask.extend(std::iter::repeat(1).take(seq.len()));
        let padding = longest - seq.len();
        ids.extend(std::iter::repeat(pad_token_id).take(padding));
        mask.extend(std::iter::repeat(0).take(padding));
    }
    let dims = vec![texts.len(), longest];
    Ok((Tensor::new(dims.clone(), ids)?, Tensor::new(dims, mask)?))
}
