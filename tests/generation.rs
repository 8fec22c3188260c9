mod common;

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use proptest::prelude::*;

use common::{EOS, Harness, PAD, VOCAB, WordTokenizer, encoder_executor, scripted_decoder};
use edge_inference_sdk::{
    SdkError,
    generation::{
        Decoder, DecoderInput, Encoder, EncoderInput, EncoderKind, Generation, GenerationConfig,
        GenerationPhase, collect_text, text_deltas,
    },
    session::{Executor, SessionController, SessionHandle},
    tensor::{NamedTensors, Tensor},
    tokenizer::TextTokenizer,
};

const VOCAB_SIZE: usize = 16;

struct Rig {
    encoder: Encoder,
    decoder: Decoder,
    seen: Arc<Mutex<Vec<NamedTensors>>>,
}

async fn session(harness: &Harness, path: &str) -> Arc<dyn SessionHandle> {
    let controller = SessionController::in_process(harness.env());
    let session = controller.create_session(path, false).unwrap();
    session.init().await.unwrap();
    session
}

async fn rig(script: Vec<Vec<i64>>) -> Rig {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness.artifact("encoder.onnx", || encoder_executor(&["input_ids", "attention_mask"]));
    let recorded = seen.clone();
    harness.artifact("decoder.onnx", move || {
        scripted_decoder(script.clone(), VOCAB_SIZE, 1, recorded.clone())
    });
    Rig {
        encoder: Encoder::new(session(&harness, "encoder.onnx").await, EncoderKind::Seq2Seq),
        decoder: Decoder::new(session(&harness, "decoder.onnx").await),
        seen,
    }
}

fn config(max_tokens: Option<usize>, max_length: Option<usize>) -> GenerationConfig {
    GenerationConfig {
        max_tokens,
        max_length,
        pad_token_id: PAD,
        bos_token_id: PAD,
        eos_token_id: EOS,
    }
}

fn text_input(batch: usize) -> EncoderInput {
    EncoderInput::Text {
        input_ids: Tensor::filled(vec![batch, 3], 5),
        attention_mask: Some(Tensor::filled(vec![batch, 3], 1)),
    }
}

fn generation(rig: &Rig, config: GenerationConfig, batch: usize) -> Generation {
    Generation::new(rig.encoder.clone(), rig.decoder.clone(), config, text_input(batch), None)
        .unwrap()
}

async fn drain(mut generation: Generation) -> (Vec<Vec<i64>>, Generation) {
    let mut steps = Vec::new();
    while let Some(tokens) = generation.next_step().await.unwrap() {
        steps.push(tokens);
    }
    (steps, generation)
}

#[tokio::test]
async fn max_length_bounds_the_decoder_sequence() {
    let rig = rig(vec![vec![5]]).await;
    let (steps, generation) = drain(generation(&rig, config(None, Some(4)), 1)).await;
    assert_eq!(steps.len(), 3);
    assert_eq!(generation.phase(), GenerationPhase::LengthLimitReached);

    let seen = rig.seen.lock();
    let last = seen.last().unwrap();
    assert_eq!(last.get("input_ids").unwrap().dims(), &[1, 3]);
}

fn eos_scripts() -> impl Strategy<Value = Vec<Vec<i64>>> {
    let token = prop_oneof![Just(EOS), 5i64..9];
    proptest::collection::vec(proptest::collection::vec(token, 2), 1..25)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn max_length_caps_steps_for_any_eos_pattern(limit in 1usize..20, script in eos_scripts()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let first = script[0].clone();
        let (steps, phase) = runtime.block_on(async move {
            let rig = rig(script).await;
            let (steps, generation) = drain(generation(&rig, config(None, Some(limit)), 2)).await;
            (steps, generation.phase())
        });

        // the bos column counts towards the length, but one step always runs
        let cap = limit.saturating_sub(1).max(1);
        prop_assert!(!steps.is_empty());
        prop_assert!(steps.len() <= cap);
        if first == [EOS, EOS] {
            prop_assert_eq!(steps.len(), 1);
        }
        if steps.len() < cap {
            prop_assert_eq!(phase, GenerationPhase::AllFinished);
        }
    }
}

#[tokio::test]
async fn max_tokens_bounds_the_step_count() {
    let rig = rig(vec![vec![5]]).await;
    let (steps, generation) = drain(generation(&rig, config(Some(2), Some(100)), 1)).await;
    assert_eq!(steps, vec![vec![5], vec![5]]);
    assert_eq!(generation.steps(), 2);
}

#[tokio::test]
async fn eos_on_first_step_finishes_after_one_step() {
    let rig = rig(vec![vec![EOS, EOS]]).await;
    let (steps, generation) = drain(generation(&rig, config(Some(10), None), 2)).await;
    assert_eq!(steps, vec![vec![EOS, EOS]]);
    assert_eq!(generation.phase(), GenerationPhase::AllFinished);
    assert_eq!(rig.seen.lock().len(), 1);
}

#[tokio::test]
async fn finished_sequences_are_fed_padding_and_masked() {
    let rig = rig(vec![vec![EOS, 7], vec![9, 8], vec![9, EOS]]).await;
    let (steps, _) = drain(generation(&rig, config(Some(10), None), 2)).await;
    assert_eq!(steps, vec![vec![EOS, 7], vec![PAD, 8], vec![PAD, EOS]]);

    let seen = rig.seen.lock();
    // the third decoder call sees bos plus two generated tokens
    let mask = seen[2].get("attention_mask").cloned().unwrap().into_i64("mask").unwrap();
    assert_eq!(mask.dims(), &[2, 3]);
    assert_eq!(mask.data(), &[1, 0, 0, 1, 1, 1]);
    let ids = seen[2].get("input_ids").cloned().unwrap().into_i64("ids").unwrap();
    assert_eq!(ids.data(), &[PAD, EOS, PAD, PAD, 7, 8]);
    assert!(seen[2].contains_key("encoder_attention_mask"));
}

#[tokio::test]
async fn encoder_runs_once_per_generation() {
    let harness = Harness::new();
    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();
    harness.artifact("encoder.onnx", move || {
        let counter = counter.clone();
        let mut inner = encoder_executor(&["input_ids", "attention_mask"]);
        let inputs = ["input_ids", "attention_mask"];
        common::executor(&inputs, &["last_hidden_state"], move |feeds| {
            *counter.lock() += 1;
            inner.run(feeds)
        })
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness.artifact("decoder.onnx", move || {
        scripted_decoder(vec![vec![5]], VOCAB_SIZE, 1, seen.clone())
    });

    let rig = Rig {
        encoder: Encoder::new(session(&harness, "encoder.onnx").await, EncoderKind::Seq2Seq),
        decoder: Decoder::new(session(&harness, "decoder.onnx").await),
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let (steps, _) = drain(generation(&rig, config(Some(5), None), 1)).await;
    assert_eq!(steps.len(), 5);
    assert_eq!(*calls.lock(), 1);
}

#[tokio::test]
async fn zero_limits_are_configuration_errors() {
    let rig = rig(vec![vec![5]]).await;
    for bad in [config(Some(0), None), config(None, Some(0))] {
        let result =
            Generation::new(rig.encoder.clone(), rig.decoder.clone(), bad, text_input(1), None);
        assert!(matches!(result, Err(SdkError::Config(_))));
    }
}

#[tokio::test]
async fn primed_decoder_input_is_extended() {
    let rig = rig(vec![vec![5]]).await;
    let initial = (
        Tensor::new(vec![1, 3], vec![PAD, 7, 8]).unwrap(),
        Tensor::filled(vec![1, 3], 1),
    );
    let generation = Generation::new(
        rig.encoder.clone(),
        rig.decoder.clone(),
        config(None, Some(5)),
        text_input(1),
        Some(initial),
    )
    .unwrap();
    let (steps, _) = drain(generation).await;
    assert_eq!(steps.len(), 2);
    let seen = rig.seen.lock();
    let ids = seen[1].get("input_ids").cloned().unwrap().into_i64("ids").unwrap();
    assert_eq!(ids.data(), &[PAD, 7, 8, 5]);
}

#[tokio::test]
async fn decoder_declaring_a_mask_requires_one() {
    let rig = rig(vec![vec![5]]).await;
    let ids = Tensor::filled(vec![1, 1], PAD);
    let hidden = Tensor::filled(vec![1, 3, 2], 0.0f32);
    let err = rig
        .decoder
        .run(DecoderInput {
            input_ids: &ids,
            encoder_hidden_states: &hidden,
            attention_mask: None,
            encoder_attention_mask: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::Shape(_)));
}

#[tokio::test]
async fn seq2seq_encoder_requires_a_mask() {
    let rig = rig(vec![vec![5]]).await;
    let input = EncoderInput::Text {
        input_ids: Tensor::filled(vec![1, 3], 5),
        attention_mask: None,
    };
    assert!(matches!(rig.encoder.run(&input, None).await, Err(SdkError::Shape(_))));
}

#[tokio::test]
async fn streamed_deltas_add_up_to_collected_text() {
    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(WordTokenizer::new(VOCAB));
    let script = vec![vec![5, 7], vec![6, 8], vec![EOS, 9], vec![9, EOS]];

    let first = rig(script.clone()).await;
    let collected = collect_text(generation(&first, config(Some(10), None), 2), tokenizer.clone())
        .await
        .unwrap();
    assert_eq!(collected.texts, vec!["hello world", "the cat sat"]);

    let second = rig(script).await;
    let mut streamed = vec![String::new(), String::new()];
    let mut deltas =
        Box::pin(text_deltas(generation(&second, config(Some(10), None), 2), tokenizer));
    while let Some(step) = deltas.next().await {
        for (text, delta) in streamed.iter_mut().zip(step.unwrap()) {
            text.push_str(&delta);
        }
    }
    assert_eq!(streamed, collected.texts);
}
