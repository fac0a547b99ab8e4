//! Full model: embedding, blocks, and the two heads.
//!
//! TGpt = Embedding → N × TransformerBlock → (LM head, classification head)
//!
//! The LM head multiplies hidden states by the transposed embedding table, so
//! it always sees the current table values. The classification head gathers
//! the hidden state at the first marker token of each example, pairs examples
//! as two choices, and scores each choice with a one-unit dense layer.

use tgpt_core::{Result, Tensor, TgptError};
use tgpt_nn::module::prefixed;
use tgpt_nn::{Conv1d, Dropout, Module, Parameter};
use tracing::debug;

use crate::block::{BlockConfig, TransformerBlock};
use crate::config::TGptConfig;
use crate::embedding::Embedding;

/// Seed of the classification head initializer.
const CLF_SEED: u64 = 123;

/// Number of choices scored together by the classification head.
pub const NUM_CHOICES: usize = 2;

/// Outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct TGptOutput {
    /// `[batch * (n_ctx - 1), vocab_total]`
    pub lm_logits: Tensor,
    /// `[batch / 2, 2]`
    pub clf_logits: Tensor,
    /// LM loss mask reshaped to `[batch, n_ctx]`, when one was given.
    pub lm_mask: Option<Tensor>,
}

/// Decoder with tied LM head and paired-choice classification head.
pub struct TGpt {
    config: TGptConfig,
    embedding: Embedding,
    blocks: Vec<TransformerBlock>,
    clf_dropout: Dropout,
    clf: Conv1d,
    training: bool,
}

impl TGpt {
    pub fn new(config: TGptConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.seed;
        let embedding = Embedding::new(
            config.vocab_size,
            config.num_special_tokens,
            config.context_length,
            config.embedding_dim,
        )
        .with_seed(seed)
        .frozen(config.freeze_embedding)
        .with_dropout(config.embd_dropout)?;

        let block_config = BlockConfig {
            num_heads: config.num_heads,
            attn_dropout: config.attn_dropout,
            resid_dropout: config.resid_dropout,
            mlp_dropout: config.mlp_dropout,
            scale: config.scale,
            projection: config.projection_kind(),
            attention: config.attention_kind(),
            activation: config.activation()?,
            seed: None,
        };
        let blocks = (0..config.num_layers)
            .map(|i| {
                TransformerBlock::new(BlockConfig {
                    seed: seed.map(|s| s.wrapping_add(1000 * (i as u64 + 1))),
                    ..block_config.clone()
                })
            })
            .collect();

        let mut clf_dropout = Dropout::new(config.clf_dropout)?;
        if let Some(s) = seed {
            clf_dropout = clf_dropout.with_seed(s.wrapping_add(7));
        }

        Ok(Self {
            config,
            embedding,
            blocks,
            clf_dropout,
            clf: Conv1d::new(1, 1).with_seed(CLF_SEED),
            training: false,
        })
    }

    pub fn config(&self) -> &TGptConfig {
        &self.config
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }

    /// The classification dense layer (`[1, n_embd, 1]` weight once configured).
    pub fn classifier(&self) -> &Conv1d {
        &self.clf
    }

    /// Size every layer for inputs of `batch` sequences.
    pub fn configure(&mut self, batch: usize) -> Result<()> {
        let n_ctx = self.config.context_length;
        let e = self.config.embedding_dim;
        debug!(
            batch,
            n_ctx,
            n_embd = e,
            layers = self.blocks.len(),
            "configuring TGpt"
        );
        self.embedding.configure(&[batch, n_ctx, 2])?;
        let mut shape = vec![batch, n_ctx, e];
        for block in &mut self.blocks {
            shape = block.configure(&shape)?.dims().to_vec();
        }
        self.clf.configure(&[batch, e])?;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.embedding.is_configured()
            && self.blocks.iter().all(|b| b.is_configured())
            && self.clf.is_configured()
    }

    /// Flatten `[.., n_ctx, 2]` ids into `[batch, n_ctx, 2]`.
    fn flatten_ids(&self, tokens: &Tensor) -> Result<Tensor> {
        let n_ctx = self.config.context_length;
        let dims = tokens.dims();
        let n = dims.len();
        if n < 2 || dims[n - 1] != 2 || dims[n - 2] != n_ctx {
            return Err(TgptError::ShapeMismatch {
                expected: vec![n_ctx, 2],
                got: dims.to_vec(),
            });
        }
        tokens.reshape(&[-1, n_ctx as isize, 2])
    }

    /// Final hidden states `[batch, n_ctx, n_embd]` and the embedding table.
    pub fn hidden_states(&self, tokens: &Tensor) -> Result<(Tensor, Tensor)> {
        if !self.is_configured() {
            return Err(TgptError::NotConfigured("TGpt".into()));
        }
        let ids = self.flatten_ids(tokens)?;
        let (mut h, table) = self.embedding.forward(&ids)?;
        debug!(dims = ?h.dims(), "embedded");
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok((h, table))
    }

    /// `[batch * (n_ctx - 1), vocab_total]`: every position but the last,
    /// scored against the table.
    fn lm_logits(&self, h: &Tensor, table: &Tensor) -> Result<Tensor> {
        let n_ctx = self.config.context_length;
        let e = self.config.embedding_dim as isize;
        let lm_h = h.narrow(1, 0, n_ctx - 1)?.reshape(&[-1, e])?;
        lm_h.matmul(&table.transpose()?)
    }

    /// First position of the marker token in each example (0 if absent).
    pub fn marker_positions(&self, tokens: &Tensor) -> Result<Vec<usize>> {
        let ids = self.flatten_ids(tokens)?;
        let batch = ids.dims()[0] as isize;
        let n_ctx = self.config.context_length as isize;
        ids.narrow(2, 0, 1)?
            .reshape(&[batch, n_ctx])?
            .eq_scalar(self.config.marker_token_id)?
            .argmax(-1)?
            .to_index_vec()
    }

    /// Hidden state at each example's marker position, `[batch, n_embd]`.
    pub fn pooled_hidden(&self, tokens: &Tensor) -> Result<Tensor> {
        let (h, _) = self.hidden_states(tokens)?;
        self.gather_pooled(&h, &self.marker_positions(tokens)?)
    }

    fn gather_pooled(&self, h: &Tensor, positions: &[usize]) -> Result<Tensor> {
        let n_ctx = self.config.context_length;
        let rows: Vec<usize> = positions
            .iter()
            .enumerate()
            .map(|(b, &p)| b * n_ctx + p)
            .collect();
        h.reshape(&[-1, self.config.embedding_dim as isize])?
            .index_select_rows(&rows)
    }

    fn clf_logits(&self, pooled: &Tensor) -> Result<Tensor> {
        let batch = pooled.dims()[0];
        let e = self.config.embedding_dim;
        if batch % NUM_CHOICES != 0 {
            return Err(TgptError::InvalidConfig(format!(
                "batch must be a multiple of {NUM_CHOICES}, got {batch}"
            )));
        }
        let paired = pooled.reshape(&[-1, NUM_CHOICES as isize, e as isize])?;
        let paired = self.clf_dropout.forward_grouped(&paired, &[1])?;
        let scores = self.clf.forward(&paired.reshape(&[-1, e as isize])?)?;
        scores.reshape(&[-1, NUM_CHOICES as isize])
    }

    /// LM and classification logits for ids shaped `[.., n_ctx, 2]`.
    pub fn forward(&self, tokens: &Tensor) -> Result<TGptOutput> {
        let (h, table) = self.hidden_states(tokens)?;
        let lm_logits = self.lm_logits(&h, &table)?;
        let pooled = self.gather_pooled(&h, &self.marker_positions(tokens)?)?;
        let clf_logits = self.clf_logits(&pooled)?;
        Ok(TGptOutput {
            lm_logits,
            clf_logits,
            lm_mask: None,
        })
    }

    /// [`TGpt::forward`] that also passes an LM loss mask `[.., n_ctx]`
    /// through, reshaped to `[batch, n_ctx]`.
    pub fn forward_with_lm_mask(&self, tokens: &Tensor, lm_mask: &Tensor) -> Result<TGptOutput> {
        let n_ctx = self.config.context_length;
        if lm_mask.dims().last() != Some(&n_ctx) {
            return Err(TgptError::ShapeMismatch {
                expected: vec![n_ctx],
                got: lm_mask.dims().to_vec(),
            });
        }
        let mut out = self.forward(tokens)?;
        out.lm_mask = Some(lm_mask.reshape(&[-1, n_ctx as isize])?);
        Ok(out)
    }

    pub fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("embed", self.embedding.named_parameters());
        for (i, block) in self.blocks.iter().enumerate() {
            params.extend(prefixed(&format!("h{i}"), block.named_parameters()));
        }
        params.extend(prefixed("clf", self.clf.named_parameters()));
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.numel()).sum()
    }

    pub fn trainable_parameters(&self) -> Vec<&Parameter> {
        self.named_parameters()
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.is_trainable())
            .collect()
    }

    /// Training mode turns on every dropout.
    pub fn train(&mut self, mode: bool) {
        self.training = mode;
        self.embedding.train(mode);
        for block in &mut self.blocks {
            block.train(mode);
        }
        self.clf_dropout.train(mode);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinearAttentionConfig;

    fn config() -> TGptConfig {
        TGptConfig {
            num_layers: 1,
            seed: Some(11),
            ..TGptConfig::tiny()
        }
    }

    fn ids(batch: usize, n_ctx: usize, vocab: usize, marker_at: &[usize], marker: i32) -> Tensor {
        let mut data = Vec::with_capacity(batch * n_ctx * 2);
        for b in 0..batch {
            for t in 0..n_ctx {
                let tok = if marker_at.get(b) == Some(&t) {
                    marker
                } else {
                    (1 + (b * 7 + t * 3) % 90) as i32
                };
                data.push(tok);
                data.push((vocab + t) as i32);
            }
        }
        Tensor::from_i32(&data, &[batch, n_ctx, 2])
    }

    fn model(config: TGptConfig, batch: usize) -> TGpt {
        let mut m = TGpt::new(config).unwrap();
        m.configure(batch).unwrap();
        m
    }

    #[test]
    fn test_output_shapes() {
        let c = config();
        let vocab_total = c.vocab_total();
        let m = model(c.clone(), 4);
        let x = ids(4, 8, c.vocab_size + c.num_special_tokens, &[1, 2, 3, 4], 99);
        let out = m.forward(&x).unwrap();
        assert_eq!(out.lm_logits.dims(), &[4 * 7, vocab_total]);
        assert_eq!(out.clf_logits.dims(), &[2, 2]);
        assert!(out.lm_mask.is_none());
    }

    #[test]
    fn test_forward_before_configure() {
        let m = TGpt::new(config()).unwrap();
        assert!(matches!(
            m.forward(&Tensor::zeros(&[2, 8, 2], tgpt_core::DType::I32)),
            Err(TgptError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_context_length() {
        let m = model(config(), 2);
        let x = Tensor::zeros(&[2, 7, 2], tgpt_core::DType::I32);
        assert!(matches!(m.forward(&x), Err(TgptError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_odd_batch_rejected() {
        let c = config();
        let m = model(c.clone(), 3);
        let x = ids(3, 8, 103, &[0, 0, 0], 99);
        match m.forward(&x) {
            Err(TgptError::InvalidConfig(msg)) => {
                assert_eq!(msg, "batch must be a multiple of 2, got 3")
            }
            other => panic!("expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_leading_axes_flattened() {
        let c = config();
        let m = model(c.clone(), 4);
        let flat = ids(4, 8, 103, &[1, 2, 3, 4], 99);
        let nested = flat.reshape(&[2, 2, 8, 2]).unwrap();
        let a = m.forward(&flat).unwrap();
        let b = m.forward(&nested).unwrap();
        assert_eq!(a.clf_logits.as_f32_slice(), b.clf_logits.as_f32_slice());
    }

    #[test]
    fn test_marker_positions_first_occurrence() {
        let m = model(config(), 2);
        let mut x = ids(2, 8, 103, &[5, 3], 99).as_i32_slice().unwrap().to_vec();
        // Second marker later in example 0 is ignored.
        x[7 * 2] = 99;
        let x = Tensor::from_i32(&x, &[2, 8, 2]);
        assert_eq!(m.marker_positions(&x).unwrap(), vec![5, 3]);

        let none = ids(2, 8, 103, &[], 99);
        assert_eq!(m.marker_positions(&none).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_lm_logits_follow_table_updates() {
        let mut c = config();
        c.freeze_embedding = false;
        let m = model(c, 2);
        let x = ids(2, 8, 103, &[5, 3], 99);
        let before = m.forward(&x).unwrap().lm_logits;

        let (_, w) = m.embedding().named_parameters().remove(0);
        let mut data = w.value().to_f32_vec().unwrap();
        // Row 0 is never looked up, so only its logit column moves.
        data[0] += 1.0;
        w.set(Tensor::from_f32(&data, &w.dims())).unwrap();

        let after = m.forward(&x).unwrap().lm_logits;
        let (b, a) = (before.to_f32_vec().unwrap(), after.to_f32_vec().unwrap());
        let cols = 111;
        assert!((0..14).all(|r| (b[r * cols] - a[r * cols]).abs() > 1e-6));
        assert!((0..14).all(|r| (b[r * cols + 1] - a[r * cols + 1]).abs() < 1e-6));
    }

    #[test]
    fn test_lm_mask_passthrough() {
        let m = model(config(), 2);
        let x = ids(2, 8, 103, &[5, 3], 99);
        let mask = Tensor::ones(&[1, 2, 8]);
        let out = m.forward_with_lm_mask(&x, &mask).unwrap();
        assert_eq!(out.lm_mask.unwrap().dims(), &[2, 8]);
        assert!(m.forward_with_lm_mask(&x, &Tensor::ones(&[2, 7])).is_err());
    }

    #[test]
    fn test_frozen_embedding_parameters() {
        let m = model(config(), 2);
        let frozen: Vec<String> = m
            .named_parameters()
            .into_iter()
            .filter(|(_, p)| !p.is_trainable())
            .map(|(n, _)| n)
            .collect();
        assert_eq!(frozen, vec!["embed.we_tokens".to_string(), "embed.we_positions".to_string()]);
        assert_eq!(m.classifier().weight().unwrap().dims(), vec![1, 16, 1]);
    }

    #[test]
    fn test_same_seed_same_model() {
        let x = ids(2, 8, 103, &[5, 3], 99);
        let a = model(config(), 2).forward(&x).unwrap();
        let b = model(config(), 2).forward(&x).unwrap();
        assert_eq!(a.clf_logits.as_f32_slice(), b.clf_logits.as_f32_slice());
    }

    #[test]
    fn test_linear_attention_and_adapter_model() {
        let c = TGptConfig {
            adapter: Some(Default::default()),
            linear_attention: Some(LinearAttentionConfig {
                num_random_features: 32,
                seed: 1337,
            }),
            ..config()
        };
        let m = model(c, 2);
        let out = m.forward(&ids(2, 8, 103, &[5, 3], 99)).unwrap();
        assert_eq!(out.clf_logits.dims(), &[1, 2]);
        assert!(out.lm_logits.to_f32_vec().unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_train_toggles_every_dropout() {
        let mut m = model(config(), 2);
        let x = ids(2, 8, 103, &[5, 3], 99);
        let eval = m.forward(&x).unwrap().clf_logits;
        assert_eq!(eval.as_f32_slice(), m.forward(&x).unwrap().clf_logits.as_f32_slice());
        m.train(true);
        assert!(m.is_training());
        assert!(m.blocks()[0].is_training());
        assert!(m.embedding().is_training());
    }
}
