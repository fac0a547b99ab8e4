//! End-to-end checks across embedding, blocks and both heads.

use tgpt_core::DType;
use tgpt_nn::prelude::*;
use tgpt_transformer::{LinearAttentionConfig, TGpt, TGptConfig};

const MARKER: i32 = 99;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn config() -> TGptConfig {
    TGptConfig {
        vocab_size: 100,
        num_special_tokens: 3,
        context_length: 8,
        embedding_dim: 16,
        num_heads: 4,
        num_layers: 2,
        marker_token_id: MARKER,
        seed: Some(2024),
        ..TGptConfig::gpt1()
    }
}

/// Two examples with the marker at positions 5 and 3.
fn batch(config: &TGptConfig) -> Tensor {
    let pos_offset = (config.vocab_size + config.num_special_tokens) as i32;
    let markers = [5usize, 3];
    let mut data = Vec::new();
    for (b, &m) in markers.iter().enumerate() {
        for t in 0..config.context_length {
            let token = if t == m { MARKER } else { (10 * b + t + 1) as i32 };
            data.push(token);
            data.push(pos_offset + t as i32);
        }
    }
    Tensor::from_i32(&data, &[2, config.context_length, 2])
}

#[test]
fn test_gather_selects_marker_positions() {
    init_tracing();
    let c = config();
    let mut model = TGpt::new(c.clone()).unwrap();
    model.configure(2).unwrap();
    let x = batch(&c);

    assert_eq!(model.marker_positions(&x).unwrap(), vec![5, 3]);

    let (hidden, _) = model.hidden_states(&x).unwrap();
    let hidden = hidden.to_f32_vec().unwrap();
    let pooled = model.pooled_hidden(&x).unwrap();
    assert_eq!(pooled.dims(), &[2, 16]);
    let pooled = pooled.to_f32_vec().unwrap();
    let n_ctx = c.context_length;
    assert_eq!(&pooled[..16], &hidden[5 * 16..6 * 16]);
    assert_eq!(&pooled[16..], &hidden[(n_ctx + 3) * 16..(n_ctx + 4) * 16]);
}

#[test]
fn test_output_shapes() {
    init_tracing();
    let c = config();
    let mut model = TGpt::new(c.clone()).unwrap();
    model.configure(2).unwrap();
    let out = model.forward(&batch(&c)).unwrap();

    assert_eq!(out.lm_logits.dims(), &[2 * 7, 100 + 3 + 8]);
    assert_eq!(out.clf_logits.dims(), &[1, 2]);
    assert!(out.clf_logits.to_f32_vec().unwrap().iter().all(|v| v.is_finite()));
}

#[test]
fn test_lm_logits_are_hidden_times_table() {
    let mut c = config();
    c.freeze_embedding = false;
    let mut model = TGpt::new(c.clone()).unwrap();
    model.configure(2).unwrap();
    let x = batch(&c);

    let (hidden, table) = model.hidden_states(&x).unwrap();
    let out = model.forward(&x).unwrap();
    let logits = out.lm_logits.to_f32_vec().unwrap();
    let table = table.to_f32_vec().unwrap();
    let hidden = hidden.to_f32_vec().unwrap();

    // Row for example 1, position 2 scored against token 42.
    let row = 7 + 2;
    let h = &hidden[(8 + 2) * 16..(8 + 3) * 16];
    let w = &table[42 * 16..43 * 16];
    let expected: f32 = h.iter().zip(w).map(|(a, b)| a * b).sum();
    assert!((logits[row * 111 + 42] - expected).abs() < 1e-5);
}

#[test]
fn test_training_mode_is_stochastic_eval_is_not() {
    init_tracing();
    let c = TGptConfig {
        freeze_embedding: false,
        ..config()
    };
    let mut model = TGpt::new(c.clone()).unwrap();
    model.configure(2).unwrap();
    let x = batch(&c);

    let a = model.forward(&x).unwrap().lm_logits.to_f32_vec().unwrap();
    let b = model.forward(&x).unwrap().lm_logits.to_f32_vec().unwrap();
    assert_eq!(a, b);

    model.train(true);
    let c1 = model.forward(&x).unwrap().lm_logits.to_f32_vec().unwrap();
    let c2 = model.forward(&x).unwrap().lm_logits.to_f32_vec().unwrap();
    assert_ne!(c1, c2);
}

#[test]
fn test_linear_attention_model_runs() {
    init_tracing();
    let c = TGptConfig {
        linear_attention: Some(LinearAttentionConfig {
            num_random_features: 64,
            seed: 1337,
        }),
        ..config()
    };
    let mut model = TGpt::new(c.clone()).unwrap();
    model.configure(2).unwrap();
    let out = model.forward(&batch(&c)).unwrap();
    assert_eq!(out.lm_logits.dims(), &[14, 111]);
    assert!(out.lm_logits.to_f32_vec().unwrap().iter().all(|v| v.is_finite()));
}

#[test]
fn test_out_of_range_ids_rejected() {
    let c = config();
    let mut model = TGpt::new(c.clone()).unwrap();
    model.configure(2).unwrap();
    let x = Tensor::full(&[2, 8, 2], 500.0);
    assert!(model.forward(&x).is_err());
    let ok = Tensor::zeros(&[2, 8, 2], DType::F32);
    assert!(model.forward(&ok).is_ok());
}

#[test]
fn test_blocks_share_nothing_but_table_is_shared() {
    let c = TGptConfig {
        freeze_embedding: false,
        ..config()
    };
    let mut model = TGpt::new(c).unwrap();
    model.configure(2).unwrap();
    let blocks = model.blocks();
    let a = blocks[0].parameters();
    let b = blocks[1].parameters();
    assert!(a.iter().zip(&b).all(|(p, q)| !p.is_tied_to(q)));

    let (_, table) = model.embedding().named_parameters().remove(0);
    let (_, again) = model.embedding().named_parameters().remove(0);
    assert!(table.is_tied_to(again));
}
