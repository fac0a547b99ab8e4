//! Token + position embedding over one shared table.
//!
//! Ids arrive as `[batch, seq, 2]`: channel 0 is the token id, channel 1 the
//! position id already offset past the token and special rows. Both rows are
//! gathered from the same table and summed.

use tgpt_core::{Result, Tensor, TgptError};
use tgpt_nn::parameter::init_rng;
use tgpt_nn::{Dropout, Init, Module, Parameter};
use tracing::debug;

/// Table layout.
#[derive(Debug, Clone)]
pub enum EmbeddingTable {
    /// One trainable matrix `[n_vocab + n_special + n_ctx, n_embd]`.
    Single(Parameter),
    /// Frozen tokens, trainable specials and frozen positions, concatenated
    /// in that order.
    Split {
        tokens: Parameter,
        special: Parameter,
        positions: Parameter,
    },
}

impl EmbeddingTable {
    /// The full table as one tensor. Zero-copy in single mode.
    pub fn materialize(&self) -> Result<Tensor> {
        match self {
            EmbeddingTable::Single(w) => Ok(w.value()),
            EmbeddingTable::Split {
                tokens,
                special,
                positions,
            } => {
                let (t, s, p) = (tokens.value(), special.value(), positions.value());
                Tensor::cat(&[&t, &s, &p], 0)
            }
        }
    }

    pub fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match self {
            EmbeddingTable::Single(w) => vec![("we".into(), w)],
            EmbeddingTable::Split {
                tokens,
                special,
                positions,
            } => vec![
                ("we_tokens".into(), tokens),
                ("we_special".into(), special),
                ("we_positions".into(), positions),
            ],
        }
    }
}

/// Embedding lookup returning both the hidden states and the table.
pub struct Embedding {
    vocab_size: usize,
    num_special: usize,
    context_length: usize,
    embedding_dim: usize,
    freeze: bool,
    seed: Option<u64>,
    dropout: Dropout,
    table: Option<EmbeddingTable>,
}

impl Embedding {
    pub fn new(
        vocab_size: usize,
        num_special: usize,
        context_length: usize,
        embedding_dim: usize,
    ) -> Self {
        Self {
            vocab_size,
            num_special,
            context_length,
            embedding_dim,
            freeze: false,
            seed: None,
            dropout: Dropout::default(),
            table: None,
        }
    }

    /// Split the table so token and position rows stay frozen.
    pub fn frozen(mut self, freeze: bool) -> Self {
        self.freeze = freeze;
        self
    }

    /// Dropout on the table (single mode, training only).
    pub fn with_dropout(mut self, p: f32) -> Result<Self> {
        self.dropout = Dropout::new(p)?;
        if let Some(s) = self.seed {
            self.dropout = self.dropout.with_seed(s.wrapping_add(1));
        }
        Ok(self)
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        if let Some(s) = seed {
            self.dropout = self.dropout.with_seed(s.wrapping_add(1));
        }
        self
    }

    /// Rows in the full table.
    pub fn vocab_total(&self) -> usize {
        self.vocab_size + self.num_special + self.context_length
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn table(&self) -> Option<&EmbeddingTable> {
        self.table.as_ref()
    }

    /// Create the table. Ids must be shaped `[batch, seq, 2]`.
    pub fn configure(&mut self, input_shape: &[usize]) -> Result<()> {
        if input_shape.len() != 3 || input_shape[2] != 2 {
            return Err(TgptError::ShapeMismatch {
                expected: vec![0, 0, 2],
                got: input_shape.to_vec(),
            });
        }
        if self.table.is_some() {
            return Ok(());
        }

        let e = self.embedding_dim;
        debug!(
            rows = self.vocab_total(),
            dim = e,
            frozen = self.freeze,
            "configuring Embedding"
        );
        let mut rng = init_rng(self.seed);
        self.table = Some(if self.freeze {
            EmbeddingTable::Split {
                tokens: Parameter::init("we_tokens", &[self.vocab_size, e], Init::WEIGHT, false, &mut rng),
                special: Parameter::init("we_special", &[self.num_special, e], Init::WEIGHT, true, &mut rng),
                positions: Parameter::init("we_positions", &[self.context_length, e], Init::WEIGHT, false, &mut rng),
            }
        } else {
            EmbeddingTable::Single(Parameter::init(
                "we",
                &[self.vocab_total(), e],
                Init::WEIGHT,
                true,
                &mut rng,
            ))
        });
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.table.is_some()
    }

    /// `(hidden [batch, seq, n_embd], table [vocab_total, n_embd])`.
    ///
    /// The returned table never has dropout applied.
    pub fn forward(&self, ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| TgptError::NotConfigured("Embedding".into()))?;
        let dims = ids.dims();
        if dims.len() != 3 || dims[2] != 2 {
            return Err(TgptError::ShapeMismatch {
                expected: vec![0, 0, 2],
                got: dims.to_vec(),
            });
        }
        let (b, s) = (dims[0] as isize, dims[1] as isize);

        let weights = table.materialize()?;
        let lookup_table = match table {
            EmbeddingTable::Single(_) => self.dropout.forward(&weights)?,
            EmbeddingTable::Split { .. } => weights.clone(),
        };
        let rows = lookup_table.index_select_rows(&ids.to_index_vec()?)?;
        let hidden = rows
            .reshape(&[b, s, 2, self.embedding_dim as isize])?
            .sum_axis(2)?;
        Ok((hidden, weights))
    }

    pub fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match &self.table {
            Some(t) => t.named_parameters(),
            None => vec![],
        }
    }

    pub fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    pub fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgpt_core::DType;

    fn ids(data: &[i32], b: usize, s: usize) -> Tensor {
        Tensor::from_i32(data, &[b, s, 2])
    }

    #[test]
    fn test_lookup_sums_token_and_position() {
        let mut emb = Embedding::new(4, 1, 3, 2);
        emb.configure(&[1, 3, 2]).unwrap();
        let table: Vec<f32> = (0..16).map(|i| i as f32).collect();
        if let Some(EmbeddingTable::Single(w)) = emb.table() {
            w.set(Tensor::from_f32(&table, &[8, 2])).unwrap();
        }
        // token 1 at position row 5, token 3 at position row 6
        let (h, t) = emb.forward(&ids(&[1, 5, 3, 6, 0, 7], 1, 3)).unwrap();
        assert_eq!(h.dims(), &[1, 3, 2]);
        assert_eq!(t.dims(), &[8, 2]);
        assert_eq!(
            h.as_f32_slice().unwrap(),
            &[2.0 + 10.0, 3.0 + 11.0, 6.0 + 12.0, 7.0 + 13.0, 0.0 + 14.0, 1.0 + 15.0]
        );
    }

    #[test]
    fn test_split_table_layout_and_trainability() {
        let mut emb = Embedding::new(10, 2, 4, 3).frozen(true).with_seed(Some(5));
        emb.configure(&[2, 4, 2]).unwrap();
        let (_, table) = emb.forward(&Tensor::zeros(&[2, 4, 2], DType::I32)).unwrap();
        assert_eq!(table.dims(), &[16, 3]);
        let trainable: Vec<String> = emb
            .named_parameters()
            .into_iter()
            .filter(|(_, p)| p.is_trainable())
            .map(|(n, _)| n)
            .collect();
        assert_eq!(trainable, vec!["we_special".to_string()]);

        // Special rows sit right after the token rows.
        if let Some(EmbeddingTable::Split { special, .. }) = emb.table() {
            special.set(Tensor::full(&[2, 3], 7.0)).unwrap();
        }
        let (_, table) = emb.forward(&Tensor::zeros(&[2, 4, 2], DType::I32)).unwrap();
        let data = table.as_f32_slice().unwrap();
        assert!(data[30..36].iter().all(|&v| v == 7.0));
        assert!(data[27..30].iter().all(|&v| v != 7.0));
    }

    #[test]
    fn test_float_ids_accepted() {
        let mut emb = Embedding::new(4, 0, 2, 2);
        emb.configure(&[1, 2, 2]).unwrap();
        let a = emb.forward(&Tensor::from_f32(&[1.0, 4.0, 2.0, 5.0], &[1, 2, 2])).unwrap().0;
        let b = emb.forward(&ids(&[1, 4, 2, 5], 1, 2)).unwrap().0;
        assert_eq!(a.as_f32_slice(), b.as_f32_slice());
    }

    #[test]
    fn test_out_of_range_id() {
        let mut emb = Embedding::new(4, 0, 2, 2);
        emb.configure(&[1, 1, 2]).unwrap();
        assert!(matches!(
            emb.forward(&ids(&[6, 0], 1, 1)),
            Err(TgptError::IndexOutOfRange { index: 6, size: 6 })
        ));
    }

    #[test]
    fn test_dropout_applies_to_lookup_not_returned_table() {
        let mut emb = Embedding::new(50, 0, 4, 8).with_seed(Some(2)).with_dropout(0.5).unwrap();
        emb.configure(&[1, 4, 2]).unwrap();
        emb.train(true);
        let input = ids(&[1, 50, 2, 51, 3, 52, 4, 53], 1, 4);
        let (h, table) = emb.forward(&input).unwrap();
        if let Some(EmbeddingTable::Single(w)) = emb.table() {
            assert_eq!(table.as_f32_slice(), w.value().as_f32_slice());
        }
        emb.train(false);
        let (h_eval, _) = emb.forward(&input).unwrap();
        assert_ne!(h.as_f32_slice(), h_eval.as_f32_slice());
    }

    #[test]
    fn test_rejects_bad_shape() {
        let mut emb = Embedding::new(4, 0, 2, 2);
        assert!(emb.configure(&[1, 2, 3]).is_err());
        emb.configure(&[1, 2, 2]).unwrap();
        assert!(emb.forward(&Tensor::zeros(&[2, 2], DType::I32)).is_err());
    }
}
