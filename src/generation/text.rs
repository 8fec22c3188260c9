use std::{sync::Arc, time::Instant};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::debug;

use super::Generation;
use crate::{error::Result, tokenizer::TextTokenizer};

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedText {
    pub texts: Vec<String>,
    pub elapsed: f64,
}

/// Running per-sequence ids and their decoded text.
struct TextAccumulator {
    tokenizer: Arc<dyn TextTokenizer>,
    pad_token_id: i64,
    ids: Vec<Vec<i64>>,
    texts: Vec<String>,
}

impl TextAccumulator {
    fn new(tokenizer: Arc<dyn TextTokenizer>, pad_token_id: i64, batch: usize) -> Self {
        Self {
            tokenizer,
            pad_token_id,
            ids: vec![Vec::new(); batch],
            texts: vec![String::new(); batch],
        }
    }

    /// Appends one step and returns what each sequence's text gained.
    fn push(&mut self, tokens: &[i64]) -> Result<Vec<String>> {
        let mut deltas = Vec::with_capacity(tokens.len());
        for ((&token, ids), text) in tokens.iter().zip(&mut self.ids).zip(&mut self.texts) {
            if token != self.pad_token_id {
                ids.push(token);
            }
            let decoded = self.tokenizer.decode(ids, true)?;
            deltas.push(suffix_delta(text, &decoded));
            *text = decoded;
        }
        Ok(deltas)
    }
}

/// Text appended since `previous`. A decoder that rewrote earlier text
/// yields an empty delta for that step.
fn suffix_delta(previous: &str, current: &str) -> String {
    match current.strip_prefix(previous) {
        Some(delta) => delta.to_string(),
        None => {
            debug!(previous, current, "decoded prefix changed between steps");
            String::new()
        }
    }
}

pub async fn collect_text(
    mut generation: Generation,
    tokenizer: Arc<dyn TextTokenizer>,
) -> Result<GeneratedText> {
    let start = Instant::now();
    let batch = generation.finished.len();
    let mut acc = TextAccumulator::new(tokenizer, generation.config().pad_token_id, batch);
    while let Some(tokens) = generation.next_step().await? {
        acc.push(&tokens)?;
    }
    Ok(GeneratedText {
        texts: acc.texts,
        elapsed: start.elapsed().as_secs_f64(),
    })
}

pub fn text_deltas(
    generation: Generation,
    tokenizer: Arc<dyn TextTokenizer>,
) -> impl Stream<Item = Result<Vec<String>>> + Send {
    let batch = generation.finished.len();
    let mut acc = TextAccumulator::new(tokenizer, generation.config().pad_token_id, batch);
    generation
        .into_stream()
        .map(move |step| step.and_then(|tokens| acc.push(&tokens)))
}
