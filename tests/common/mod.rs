#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use edge_inference_sdk::{
    ModelLoader, Result, SdkError, SessionParameters,
    cache::{ArtifactCache, CacheStore, MemoryStore},
    fetch::StaticFetcher,
    model::TokenizerParser,
    session::{Executor, ExecutorFactory, ExecutorOptions, SessionController, SessionEnv},
    tensor::{NamedTensors, Tensor},
    tokenizer::TextTokenizer,
};

pub const PAD: i64 = 0;
pub const EOS: i64 = 1;
pub const VOCAB: &str = "<pad>\n</s>\n<unk>\nsummarize:\ntranslate:\nhello\nworld\nthe\ncat\nsat\na\nphoto\nof\ndog";

type RunFn = Box<dyn FnMut(NamedTensors) -> Result<NamedTensors> + Send>;

pub struct FnExecutor {
    inputs: Vec<String>,
    outputs: Vec<String>,
    run: RunFn,
}

impl Executor for FnExecutor {
    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        (self.run)(inputs)
    }

    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }
}

pub fn executor(
    inputs: &[&str],
    outputs: &[&str],
    run: impl FnMut(NamedTensors) -> Result<NamedTensors> + Send + 'static,
) -> Box<dyn Executor> {
    Box::new(FnExecutor {
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        run: Box::new(run),
    })
}

type Builder = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

/// Builds executors by looking up the artifact bytes it was handed.
#[derive(Default)]
pub struct ScriptedFactory {
    builders: Mutex<HashMap<Vec<u8>, Builder>>,
    created: AtomicUsize,
    last_options: Mutex<Option<ExecutorOptions>>,
}

impl ScriptedFactory {
    pub fn register(&self, bytes: &[u8], builder: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static) {
        self.builders.lock().insert(bytes.to_vec(), Arc::new(builder));
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ExecutorOptions> {
        self.last_options.lock().clone()
    }
}

impl ExecutorFactory for ScriptedFactory {
    fn create(&self, model_bytes: Vec<u8>, options: &ExecutorOptions) -> Result<Box<dyn Executor>> {
        let builder = self
            .builders
            .lock()
            .get(&model_bytes)
            .cloned()
            .ok_or_else(|| SdkError::Inference("unknown model bytes".into()))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options.clone());
        Ok(builder())
    }
}

/// Splits on whitespace; ids are line numbers in the vocabulary.
pub struct WordTokenizer {
    vocab: Vec<String>,
}

impl WordTokenizer {
    pub fn new(vocab: &str) -> Self {
        Self {
            vocab: vocab.lines().map(str::to_string).collect(),
        }
    }

    pub fn id(&self, word: &str) -> i64 {
        self.vocab.iter().position(|w| w == word).unwrap_or(2) as i64
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = text.split_whitespace().map(|w| self.id(w)).collect();
        if add_special_tokens {
            ids.push(EOS);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i64], skip_special_tokens: bool) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| !(skip_special_tokens && (id == PAD || id == EOS)))
            .map(|&id| self.vocab.get(id as usize).map(String::as_str).unwrap_or("<unk>"))
            .collect();
        Ok(words.join(" "))
    }
}

pub fn word_tokenizer_parser() -> TokenizerParser {
    Arc::new(|bytes: &[u8]| {
        let vocab = std::str::from_utf8(bytes).map_err(|e| SdkError::Tokenizer(e.to_string()))?;
        Ok(Arc::new(WordTokenizer::new(vocab)) as Arc<dyn TextTokenizer>)
    })
}

/// Fetcher, executor factory and parameters shared by one test.
pub struct Harness {
    pub fetcher: Arc<StaticFetcher>,
    pub factory: Arc<ScriptedFactory>,
    pub params: SessionParameters,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            fetcher: Arc::new(StaticFetcher::new()),
            factory: Arc::new(ScriptedFactory::default()),
            params: SessionParameters {
                num_threads: 2,
                memory_limit_mb: 1024,
                cache_budget_bytes: 1 << 20,
                ..SessionParameters::default()
            },
        }
    }

    /// Serves `path` with its own name as contents, built by `builder`.
    pub fn artifact(
        &self,
        path: &str,
        builder: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    ) {
        self.fetcher.insert(path, path.as_bytes().to_vec());
        self.factory.register(path.as_bytes(), builder);
    }

    pub fn file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.fetcher.insert(path, contents);
    }

    pub fn env_with(&self, store: impl CacheStore + 'static) -> SessionEnv {
        let cache = ArtifactCache::new(store, self.params.cache_budget_bytes, self.params.eviction);
        SessionEnv {
            params: Arc::new(self.params.clone()),
            cache: Arc::new(cache),
            fetcher: self.fetcher.clone(),
            executors: self.factory.clone(),
        }
    }

    pub fn env(&self) -> SessionEnv {
        self.env_with(MemoryStore::default())
    }

    pub fn loader(&self) -> ModelLoader {
        ModelLoader::new(SessionController::new(self.env()))
            .with_tokenizer_parser(word_tokenizer_parser())
    }
}

/// Hidden states of zeros, `[batch, seq, 2]`, for any text or pixel input.
pub fn encoder_executor(inputs: &'static [&'static str]) -> Box<dyn Executor> {
    executor(inputs, &["last_hidden_state"], |feeds| {
        let (batch, seq) = match (feeds.get("input_ids"), feeds.get("pixel_values")) {
            (Some(ids), _) => (ids.dims()[0], ids.dims()[1]),
            (None, Some(pixels)) => (pixels.dims()[0], 1),
            _ => return Err(SdkError::Inference("encoder got no input".into())),
        };
        let mut out = NamedTensors::new();
        out.insert(
            "last_hidden_state".into(),
            Tensor::filled(vec![batch, seq, 2], 0.0f32).into(),
        );
        Ok(out)
    })
}

pub const SEQ2SEQ_DECODER_INPUTS: &[&str] =
    &["input_ids", "encoder_hidden_states", "attention_mask", "encoder_attention_mask"];
pub const CAPTION_DECODER_INPUTS: &[&str] =
    &["input_ids", "encoder_hidden_states", "attention_mask"];

/// Seq2seq decoder, see [`scripted_decoder_for`].
pub fn scripted_decoder(
    script: Vec<Vec<i64>>,
    vocab: usize,
    initial_len: usize,
    seen: Arc<Mutex<Vec<NamedTensors>>>,
) -> Box<dyn Executor> {
    scripted_decoder_for(SEQ2SEQ_DECODER_INPUTS, script, vocab, initial_len, seen)
}

/// A decoder that emits `script[step][sequence]` as the top logit, where the
/// step is how many tokens were appended beyond `initial_len`. The last row
/// repeats once the script runs out. Every feed is recorded in `seen`.
pub fn scripted_decoder_for(
    inputs: &[&str],
    script: Vec<Vec<i64>>,
    vocab: usize,
    initial_len: usize,
    seen: Arc<Mutex<Vec<NamedTensors>>>,
) -> Box<dyn Executor> {
    executor(
        inputs,
        &["logits"],
        move |feeds| {
            let ids = feeds
                .get("input_ids")
                .ok_or_else(|| SdkError::Inference("decoder got no input_ids".into()))?;
            let (batch, seq) = (ids.dims()[0], ids.dims()[1]);
            let step = (seq - initial_len).min(script.len() - 1);
            let mut logits = vec![0.0f32; batch * seq * vocab];
            for b in 0..batch {
                let token = script[step][b] as usize;
                logits[(b * seq + seq - 1) * vocab + token] = 10.0;
            }
            seen.lock().push(feeds);
            let mut out = NamedTensors::new();
            out.insert("logits".into(), Tensor::new(vec![batch, seq, vocab], logits)?.into());
            Ok(out)
        },
    )
}
