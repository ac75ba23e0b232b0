//! End-to-end tests through the public session API.

mod common;

use cactus::{
    CactusError, CompletionParams, ContextParams, ErrorKind, FormatOptions, GuideTokens, LogLevel,
    LoraAdapter, Session,
};
use cactus_engine::{EngineError, TokenId, NULL_TOKEN};
use cactus_multimodal::MultimodalError;
use cactus_vocoder::TtsType;
use common::{
    capabilities, script, session, session_with, ModelConfig, AUDIO_BASE, AUDIO_END, BOS, EOS,
    IMAGE_URI, MEDIA_POS, N_EMBD,
};

fn collect(session: &mut Session, params: &CompletionParams) -> (cactus::CompletionResult, Vec<String>) {
    let mut chunks = Vec::new();
    let result = session
        .completion(params, |text| {
            chunks.push(text.to_string());
            true
        })
        .unwrap();
    (result, chunks)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[test]
fn test_load_progress_never_decreases() {
    let config = ModelConfig {
        progress: vec![0.2, 0.1, 0.6, 1.5],
        ..ModelConfig::default()
    };
    let (caps, _) = capabilities(config, &[]);
    let mut seen = Vec::new();
    let session = Session::load(caps, ContextParams::new("model.gguf"), |p| {
        seen.push(p);
        true
    })
    .unwrap();

    assert!(session.is_loaded());
    assert_eq!(seen, vec![0.2, 0.2, 0.6, 1.0]);
}

#[test]
fn test_load_abort() {
    let (caps, harness) = capabilities(ModelConfig::default(), &[]);
    let err = Session::load(caps, ContextParams::new("model.gguf"), |p| p < 0.5).unwrap_err();
    assert!(matches!(err, CactusError::Engine(EngineError::LoadAborted)));
    assert!(harness.logger.contains(LogLevel::Error, "Failed to load model"));
}

#[test]
fn test_load_failures_are_configuration_errors() {
    let (caps, _) = capabilities(ModelConfig::default(), &[]);
    let err = Session::load(caps.clone(), ContextParams::new(""), |_| true).unwrap_err();
    assert!(matches!(err, CactusError::InvalidConfig(_)));

    let err = Session::load(caps.clone(), ContextParams::new("m.gguf").with_n_ctx(0), |_| true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = Session::load(caps, ContextParams::new("missing.gguf"), |_| true).unwrap_err();
    assert!(matches!(err, CactusError::Engine(EngineError::ModelLoad(_))));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[test]
fn test_long_prompt_is_truncated_around_kept_prefix() {
    let (mut session, harness) = session(16, &script("X"));
    let params = CompletionParams::new("abcdefghijklmnopqrst")
        .with_n_keep(4)
        .with_n_predict(1);
    let (result, _) = collect(&mut session, &params);

    assert!(result.truncated);
    assert_eq!(result.tokens_evaluated, 14);
    assert_eq!(result.text, "X");

    let mut expected = script("abcd");
    expected.extend(script("klmnopqrst"));
    expected.extend(script("X"));
    assert_eq!(session.window().tokens(), expected.as_slice());
    assert_eq!(harness.record.lock().unwrap().decodes, vec![(0, 14)]);
}

#[test]
fn test_prompt_only_completion_decodes_once() {
    let (mut session, harness) = session(64, &script("unused"));
    let (result, chunks) = collect(&mut session, &CompletionParams::new("hello").with_n_predict(0));

    assert_eq!(harness.decode_calls(), 1);
    assert_eq!(result.text, "");
    assert_eq!(result.tokens_predicted, 0);
    assert_eq!(result.tokens_evaluated, 5);
    assert!(chunks.is_empty());
}

#[test]
fn test_stop_word_truncates_and_is_never_streamed() {
    let (mut session, _) = session(64, &script("helloSTOPworld"));
    let params = CompletionParams::new("say").with_stop(["STOP"]);
    let (result, chunks) = collect(&mut session, &params);

    assert_eq!(result.text, "hello");
    assert!(result.stopped_word);
    assert!(!result.stopped_eos);
    assert!(!result.stopped_limit);
    assert_eq!(result.stopping_word, "STOP");
    assert_eq!(result.tokens_predicted, 9);
    assert_eq!(chunks.concat(), "hello");
}

#[test]
fn test_partial_stop_prefix_is_released_at_the_end() {
    let (mut session, _) = session(64, &script("helloST"));
    let params = CompletionParams::new("say").with_stop(["STOP"]);
    let (result, chunks) = collect(&mut session, &params);

    assert!(result.stopped_eos);
    assert_eq!(result.text, "helloST");
    assert_eq!(chunks.concat(), "helloST");
    assert_eq!(chunks.last().map(String::as_str), Some("ST"));
}

#[test]
fn test_multibyte_character_is_never_cut() {
    let (mut session, _) = session(64, &script("café au lait"));
    let (result, chunks) = collect(&mut session, &CompletionParams::new("order").with_n_predict(4));

    // "caf" plus the first byte of "é" exhausts the budget; one more step
    // completes the character.
    assert_eq!(result.text, "café");
    assert_eq!(result.tokens_predicted, 5);
    assert!(result.stopped_limit);
    assert!(chunks.iter().all(|c| !c.contains('\u{FFFD}')));
    assert_eq!(chunks.concat(), "café");
}

#[test]
fn test_token_limit() {
    let (mut session, _) = session(64, &script("abcdef"));
    let (result, _) = collect(&mut session, &CompletionParams::new("go").with_n_predict(3));

    assert_eq!(result.text, "abc");
    assert!(result.stopped_limit);
    assert!(!result.stopped_eos);
    assert_eq!(result.tokens_predicted, 3);
}

#[test]
fn test_full_window_shifts_context() {
    let (mut session, _) = session(16, &script("abcdefghijklmnopqrst"));
    let (result, _) = collect(&mut session, &CompletionParams::new("12345678"));

    assert!(result.truncated);
    assert!(result.stopped_eos);
    assert_eq!(result.text, "abcdefghijklmnopqrst");
    // Every sampled token counts, EOS included.
    assert_eq!(result.tokens_predicted, 21);
    assert!(session.window().len() <= 16);
}

#[test]
fn test_callback_can_stop_generation() {
    let (mut session, _) = session(64, &script("abcdef"));
    let mut calls = 0;
    let result = session
        .completion(&CompletionParams::new("hi"), |_| {
            calls += 1;
            false
        })
        .unwrap();

    assert_eq!(calls, 1);
    assert!(result.interrupted);
    assert_eq!(result.text, "a");
    assert_eq!(result.tokens_predicted, 1);
    // The unevaluated token was dropped.
    assert_eq!(session.window().tokens(), script("hi").as_slice());
    assert!(!session.state().is_predicting);
}

#[test]
fn test_probs_are_reported_per_token() {
    let (mut session, _) = session(64, &script("ok"));
    let mut params = CompletionParams::new("q").with_n_predict(2);
    params.sampling.n_probs = 1;
    let (result, _) = collect(&mut session, &params);

    assert_eq!(result.probs.len(), 2);
    assert_eq!(result.probs[0].piece, b"o".to_vec());
    assert_eq!(result.probs[1].probs.len(), 1);
    assert_eq!(result.probs[1].probs[0].token, TokenId::from(b'k'));
}

#[test]
fn test_continuation_appends_without_bos() {
    let config = ModelConfig {
        add_bos: true,
        ..ModelConfig::default()
    };
    let (mut session, harness) = session_with(
        config,
        ContextParams::new("model.gguf").with_n_ctx(64),
        &script("X"),
    );

    collect(&mut session, &CompletionParams::new("ab").with_n_predict(1));
    let (second, _) = collect(
        &mut session,
        &CompletionParams::new("cd").with_n_predict(1).continuing(),
    );
    assert_eq!(second.tokens_evaluated, 6);

    let mut expected = vec![BOS];
    expected.extend(script("abXcdX"));
    assert_eq!(session.window().tokens(), expected.as_slice());
    assert_eq!(harness.record.lock().unwrap().decodes, vec![(0, 3), (3, 3)]);

    // A fresh completion starts over.
    collect(&mut session, &CompletionParams::new("ef").with_n_predict(1));
    assert_eq!(session.window().tokens()[0], BOS);
    assert_eq!(session.window().len(), 4);
}

#[test]
fn test_media_without_multimodal_is_rejected_cleanly() {
    let (mut session, _) = session(64, &script("x"));
    collect(&mut session, &CompletionParams::new("keep me").with_n_predict(1));
    let before = session.window().tokens().to_vec();

    let params = CompletionParams::new("look").with_media(["data:image/png;base64,AAAA"]);
    let err = session.completion(&params, |_| true).unwrap_err();

    assert!(matches!(err, CactusError::Multimodal(MultimodalError::Disabled)));
    assert_eq!(err.kind(), ErrorKind::CallerContract);
    assert_eq!(session.window().tokens(), before.as_slice());
    assert!(!session.state().is_predicting);
}

#[test]
fn test_guide_tokens_steer_a_plain_completion() {
    let (mut session, _) = session(64, &script("abcd"));
    let guide = GuideTokens {
        tokens: script("HI"),
        resume_marker: None,
    };
    let params = CompletionParams::new("go")
        .with_n_predict(4)
        .with_guide_tokens(guide);
    let (result, _) = collect(&mut session, &params);
    assert_eq!(result.text, "HIcd");

    // Guidance belongs to the call that carried it.
    let (result, _) = collect(&mut session, &CompletionParams::new("go").with_n_predict(4));
    assert_eq!(result.text, "abcd");
}

// ---------------------------------------------------------------------------
// Multimodal
// ---------------------------------------------------------------------------

fn multimodal_session(n_ctx: usize, sampler_script: &[TokenId]) -> (Session, common::Harness) {
    let params = ContextParams::new("model.gguf")
        .with_n_ctx(n_ctx)
        .with_mmproj("mmproj.gguf", false);
    session_with(ModelConfig::default(), params, sampler_script)
}

#[test]
fn test_media_completion_and_release() {
    let (mut session, harness) = multimodal_session(64, &script("ok"));
    assert!(session.is_multimodal_enabled());
    assert!(session.supports_vision());
    assert!(!session.supports_audio());

    let tokenized = session.tokenize("see", &[IMAGE_URI.to_string()]).unwrap();
    assert!(tokenized.has_media);
    assert_eq!(tokenized.tokens.len(), 4 + MEDIA_POS);
    assert_eq!(tokenized.chunk_pos, vec![0, 4]);
    assert_eq!(tokenized.chunk_pos_media, vec![4]);
    assert_eq!(tokenized.bitmap_hashes.len(), 1);

    let params = CompletionParams::new("see").with_media([IMAGE_URI]);
    let (result, chunks) = collect(&mut session, &params);

    assert_eq!(result.text, "ok");
    assert!(result.stopped_eos);
    assert_eq!(result.tokens_evaluated, 4 + MEDIA_POS);
    assert_eq!(chunks.concat(), "ok");
    {
        let record = harness.record.lock().unwrap();
        assert_eq!(record.media_encodes, 1);
        assert_eq!(record.embedded, vec![(4, MEDIA_POS)]);
        assert_eq!(record.decodes, vec![(0, 4), (12, 1), (13, 1)]);
    }
    let mm = session.multimodal().unwrap();
    assert_eq!(mm.past_hashes(), tokenized.bitmap_hashes.as_slice());

    session.release_multimodal();
    session.release_multimodal();
    assert!(!session.is_multimodal_enabled());
    assert!(!session.supports_vision());
    assert!(!session.supports_audio());

    let err = session.completion(&params, |_| true).unwrap_err();
    assert!(matches!(err, CactusError::Multimodal(MultimodalError::Disabled)));
}

#[test]
fn test_projector_load_failure_fails_session_load() {
    let (caps, _) = capabilities(ModelConfig::default(), &[]);
    let params = ContextParams::new("model.gguf").with_mmproj("missing-mmproj.gguf", false);
    let err = Session::load(caps, params, |_| true).unwrap_err();
    assert!(matches!(
        err,
        CactusError::Multimodal(MultimodalError::Engine(EngineError::Projector(_)))
    ));
}

#[test]
fn test_text_continuation_after_media_keeps_media_history() {
    let (mut session, harness) = multimodal_session(64, &script("X"));
    let media = CompletionParams::new("abcdefghijklmnopqrs")
        .with_media([IMAGE_URI])
        .with_n_predict(1);
    collect(&mut session, &media);
    assert_eq!(session.window().len(), 20 + MEDIA_POS + 1);

    let (result, _) = collect(
        &mut session,
        &CompletionParams::new("bb").with_n_predict(1).continuing(),
    );

    assert!(!result.truncated);
    assert_eq!(result.text, "X");
    assert!(session.window().tokens().contains(&NULL_TOKEN));
    assert_eq!(session.multimodal().unwrap().past_hashes().len(), 1);
    // The sampled token from the media turn plus the new text.
    assert_eq!(harness.record.lock().unwrap().decodes.last(), Some(&(28, 3)));
}

#[test]
fn test_overflowing_text_continuation_after_media_restarts() {
    let (mut session, harness) = multimodal_session(32, &script("X"));
    let media = CompletionParams::new("abcdefghijklmnopqrs")
        .with_media([IMAGE_URI])
        .with_n_predict(1);
    collect(&mut session, &media);
    assert_eq!(session.window().len(), 29);

    // 29 + 5 tokens overflow the window; truncation would leave the media
    // positions queued for plain token decoding.
    let (result, _) = collect(
        &mut session,
        &CompletionParams::new("bbbbb").with_n_predict(1).continuing(),
    );

    assert!(result.truncated);
    assert_eq!(result.text, "X");
    assert_eq!(result.tokens_evaluated, 5);
    assert_eq!(session.window().tokens(), script("bbbbbX").as_slice());
    assert!(session.multimodal().unwrap().past_hashes().is_empty());
    assert!(harness
        .logger
        .contains(LogLevel::Warning, "restarting conversation"));

    let record = harness.record.lock().unwrap();
    assert_eq!(record.decodes.last(), Some(&(0, 5)));
    assert_eq!(record.kv_clears, 2);
    assert_eq!(record.embedded.len(), 1);
}

// ---------------------------------------------------------------------------
// Benchmark
// ---------------------------------------------------------------------------

#[test]
fn test_bench_runs_every_repetition() {
    let (mut session, harness) = session(64, &script("x"));
    collect(&mut session, &CompletionParams::new("hi").with_n_predict(1));
    harness.record.lock().unwrap().decodes.clear();
    let clears_before = harness.record.lock().unwrap().kv_clears;

    let result = session.bench(4, 2, 2, 3).unwrap();

    assert!(!result.interrupted);
    assert_eq!(result.repetitions, 3);
    assert_eq!(result.model_desc, "llama");
    assert!(result.pp_avg >= 0.0 && result.tg_avg >= 0.0);
    assert!(result.pp_std >= 0.0 && result.tg_std >= 0.0);
    assert!(session.window().is_empty());
    assert!(!session.state().is_predicting);
    {
        let record = harness.record.lock().unwrap();
        assert_eq!(record.decodes, [(0, 4), (4, 2), (6, 2)].repeat(3));
        // Rewind, one per repetition, one at the end.
        assert_eq!(record.kv_clears - clears_before, 5);
    }

    let json = result.to_json().unwrap();
    assert!(json.contains("\"model_desc\":\"llama\""));
    assert!(json.contains("\"repetitions\":3"));
}

#[test]
fn test_bench_without_model() {
    let (mut session, _) = session(64, &[]);
    session.release();
    assert!(matches!(session.bench(4, 1, 1, 1), Err(CactusError::NoModel)));
}

// ---------------------------------------------------------------------------
// Tokenization, embeddings, chat
// ---------------------------------------------------------------------------

#[test]
fn test_tokenize_and_detokenize() {
    let (session, _) = session(64, &[]);
    let tokens = session.tokenize("hi", &[]).unwrap();
    assert_eq!(tokens.tokens, script("hi"));
    assert!(!tokens.has_media);

    let text = session
        .detokenize(&[TokenId::from(b'h'), NULL_TOKEN, TokenId::from(b'i')])
        .unwrap();
    assert_eq!(text, "hi");
}

#[test]
fn test_embedding_disabled_returns_zeros() {
    let (mut session, harness) = session(64, &[]);
    let embd = session.embedding("hello").unwrap();

    assert_eq!(embd, vec![0.0; N_EMBD]);
    assert_eq!(harness.decode_calls(), 0);
    assert!(harness
        .logger
        .contains(LogLevel::Warning, "Embedding mode not enabled"));
}

#[test]
fn test_embedding_is_normalized() {
    let config = ModelConfig {
        embeddings: Some(vec![3.0, -4.0, 0.0, 0.0]),
        ..ModelConfig::default()
    };
    let params = ContextParams::new("embed.gguf")
        .with_n_ctx(64)
        .with_embedding(true);
    let (mut session, harness) = session_with(config, params, &[]);

    let embd = session.embedding("hello").unwrap();
    assert_eq!(harness.decode_calls(), 1);
    assert!((embd[0] - 0.6).abs() < 1e-6);
    assert!((embd[1] + 0.8).abs() < 1e-6);
    assert_eq!(&embd[2..], &[0.0, 0.0]);
}

#[test]
fn test_format_chat() {
    let (session, harness) = session(64, &[]);
    let json = r#"[{"role":"user","content":"Hi"},{"role":"user"}]"#;
    let prompt = session
        .format_chat(json, Some("chatml"), &FormatOptions::default())
        .unwrap();

    assert_eq!(
        prompt,
        "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
    );
    assert!(harness
        .logger
        .contains(LogLevel::Warning, "Skipping malformed chat message at index 1"));

    let err = session
        .format_chat(json, Some("{{ unknown }}"), &FormatOptions::default())
        .unwrap_err();
    assert!(matches!(err, CactusError::Engine(EngineError::Format(_))));
}

#[test]
fn test_format_chat_uses_model_template() {
    let config = ModelConfig {
        chat_template: Some("llama3".into()),
        ..ModelConfig::default()
    };
    let (session, _) = session_with(config, ContextParams::new("m.gguf").with_n_ctx(64), &[]);
    let prompt = session
        .format_chat(r#"[{"role":"user","content":"Hi"}]"#, None, &FormatOptions::default())
        .unwrap();
    assert!(prompt.contains("<|start_header_id|>user<|end_header_id|>"));
}

// ---------------------------------------------------------------------------
// LoRA adapters
// ---------------------------------------------------------------------------

#[test]
fn test_adapter_set_is_all_or_nothing() {
    let (mut session, harness) = session(64, &[]);
    session
        .apply_lora_adapters(&[LoraAdapter::new("style.gguf", 0.5), LoraAdapter::new("", 1.0)])
        .unwrap();
    assert_eq!(session.lora_adapters(), &[LoraAdapter::new("style.gguf", 0.5)]);
    assert!(harness
        .logger
        .contains(LogLevel::Warning, "Skipping LoRA adapter with empty path"));

    let err = session
        .apply_lora_adapters(&[
            LoraAdapter::new("tone.gguf", 1.0),
            LoraAdapter::new("bad.gguf", 1.0),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(session.lora_adapters(), &[LoraAdapter::new("style.gguf", 0.5)]);
    {
        let record = harness.record.lock().unwrap();
        assert_eq!(record.set_adapter_calls, 1);
        assert_eq!(record.active_adapters.len(), 1);
        assert_eq!(record.active_adapters[0].1, 0.5);
    }

    session.apply_lora_adapters(&[]).unwrap();
    assert!(session.lora_adapters().is_empty());
    let record = harness.record.lock().unwrap();
    assert_eq!(record.set_adapter_calls, 2);
    assert!(record.active_adapters.is_empty());
}

#[test]
fn test_remove_adapters() {
    let (mut session, harness) = session(64, &[]);
    session
        .apply_lora_adapters(&[LoraAdapter::new("style.gguf", 1.0)])
        .unwrap();
    session.remove_lora_adapters().unwrap();
    assert!(session.lora_adapters().is_empty());
    assert!(harness.record.lock().unwrap().active_adapters.is_empty());
}

// ---------------------------------------------------------------------------
// Text to speech
// ---------------------------------------------------------------------------

#[test]
fn test_synthesize_without_vocoder() {
    let (mut session, _) = session(64, &[]);
    let err = session
        .synthesize("", "hello", &CompletionParams::default())
        .unwrap_err();
    assert!(matches!(err, CactusError::VocoderDisabled));
    assert!(matches!(
        session.formatted_audio_completion("", "hello"),
        Err(CactusError::VocoderDisabled)
    ));
}

#[test]
fn test_synthesize_steers_and_decodes_audio() {
    let newline = TokenId::from(b'\n');
    let sampled = [
        newline,
        newline,
        newline,
        AUDIO_BASE,
        AUDIO_BASE + 1,
        AUDIO_BASE + 2,
        AUDIO_END,
    ];
    let (mut session, harness) = session_with(
        ModelConfig::tts(),
        ContextParams::new("tts.gguf").with_n_ctx(8192),
        &sampled,
    );
    session.init_vocoder("vocoder.gguf").unwrap();
    assert_eq!(session.tts_type(), Some(TtsType::OuteTtsV0_2));

    let guide = session.audio_guide_tokens("hi there").unwrap();
    assert_eq!(guide.tokens, vec![newline, TokenId::from(b'h'), TokenId::from(b't')]);
    assert_eq!(guide.resume_marker, Some(newline));

    let out = session
        .synthesize("", "hi there", &CompletionParams::default().with_n_predict(64))
        .unwrap();

    // Guide tokens replace the first sampled token and the first one after
    // each newline; audio codes pass through untouched.
    assert!(out.completion.stopped_eos);
    assert!(out.completion.text.starts_with("\nh\nt<|1|><|2|>"));
    assert_eq!(out.sample_rate, 24_000);
    assert_eq!(out.audio.len(), 2 * 320);
    assert_eq!(harness.record.lock().unwrap().encoded, vec![vec![1, 2]]);
    assert_eq!(session.generation().audio_tokens(), &[AUDIO_BASE + 1, AUDIO_BASE + 2]);

    session.release_vocoder();
    session.release_vocoder();
    assert!(!session.is_vocoder_enabled());
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[test]
fn test_release_is_idempotent() {
    let (mut session, _) = session(64, &script("x"));
    session
        .apply_lora_adapters(&[LoraAdapter::new("style.gguf", 1.0)])
        .unwrap();

    session.release();
    session.release();
    assert!(!session.is_loaded());
    assert!(session.lora_adapters().is_empty());

    let err = session
        .completion(&CompletionParams::new("hi"), |_| true)
        .unwrap_err();
    assert!(matches!(err, CactusError::NoModel));
    assert!(matches!(session.tokenize("hi", &[]), Err(CactusError::NoModel)));
    assert!(matches!(session.rewind(), Err(CactusError::NoModel)));

    session.release_multimodal();
    session.release_vocoder();
}

#[test]
fn test_eos_is_not_part_of_text() {
    let mut tokens = script("ab");
    tokens.push(EOS);
    tokens.extend(script("cd"));
    let (mut session, _) = session(64, &tokens);
    let (result, _) = collect(&mut session, &CompletionParams::new("go"));
    assert_eq!(result.text, "ab");
    assert!(result.stopped_eos);
}
