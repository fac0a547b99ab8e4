//! Model configuration.

use serde::{Deserialize, Serialize};
use tgpt_core::{Result, TgptError};
use tgpt_nn::{Activation, ProjectionKind};

use crate::mha::AttentionKind;

/// Low-rank adapter settings for every projection in the blocks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub rank: usize,
    pub scale: f32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: tgpt_nn::lora::DEFAULT_RANK,
            scale: tgpt_nn::lora::DEFAULT_SCALE,
        }
    }
}

/// Random-feature attention settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearAttentionConfig {
    pub num_random_features: usize,
    #[serde(default = "default_feature_seed")]
    pub seed: u64,
}

fn default_feature_seed() -> u64 {
    tgpt_attention::DEFAULT_SEED
}

impl Default for LinearAttentionConfig {
    fn default() -> Self {
        Self {
            num_random_features: 256,
            seed: default_feature_seed(),
        }
    }
}

/// Configuration for [`crate::TGpt`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TGptConfig {
    pub vocab_size: usize,
    pub num_special_tokens: usize,
    /// Sequence length every input must have.
    pub context_length: usize,
    pub embedding_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    /// Token id whose first occurrence selects the classification feature.
    pub marker_token_id: i32,
    /// Dropout on the embedding table (single-table mode).
    pub embd_dropout: f32,
    pub attn_dropout: f32,
    pub resid_dropout: f32,
    pub mlp_dropout: f32,
    pub clf_dropout: f32,
    /// Split the table into frozen tokens, trainable specials and frozen positions.
    pub freeze_embedding: bool,
    pub scale: bool,
    pub activation: String,
    pub adapter: Option<AdapterConfig>,
    pub linear_attention: Option<LinearAttentionConfig>,
    /// Seed for parameter init and dropout masks. `None` draws from the OS.
    pub seed: Option<u64>,
}

impl TGptConfig {
    /// GPT-1 sized preset (117M params with the BPE vocabulary).
    pub fn gpt1() -> Self {
        Self {
            vocab_size: 40478,
            num_special_tokens: 3,
            context_length: 512,
            embedding_dim: 768,
            num_heads: 12,
            num_layers: 12,
            marker_token_id: 40478 + 2,
            embd_dropout: 0.1,
            attn_dropout: 0.1,
            resid_dropout: 0.1,
            mlp_dropout: 0.1,
            clf_dropout: 0.1,
            freeze_embedding: true,
            scale: true,
            activation: "gelu".into(),
            adapter: None,
            linear_attention: None,
            seed: None,
        }
    }

    /// Tiny preset for unit tests.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 100,
            num_special_tokens: 3,
            context_length: 8,
            embedding_dim: 16,
            num_heads: 4,
            num_layers: 2,
            marker_token_id: 99,
            ..Self::gpt1()
        }
    }

    /// Rows in the embedding table: tokens, specials, then positions.
    pub fn vocab_total(&self) -> usize {
        self.vocab_size + self.num_special_tokens + self.context_length
    }

    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads.max(1)
    }

    pub fn projection_kind(&self) -> ProjectionKind {
        match self.adapter {
            Some(AdapterConfig { rank, scale }) => ProjectionKind::LowRank { rank, scale },
            None => ProjectionKind::Plain,
        }
    }

    pub fn attention_kind(&self) -> AttentionKind {
        match self.linear_attention {
            Some(LinearAttentionConfig {
                num_random_features,
                seed,
            }) => AttentionKind::Linear {
                num_random_features,
                seed,
            },
            None => AttentionKind::Softmax,
        }
    }

    pub fn activation(&self) -> Result<Activation> {
        Activation::from_name(&self.activation)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.embedding_dim % self.num_heads != 0 {
            return Err(TgptError::DimensionMismatch {
                dim: self.embedding_dim,
                heads: self.num_heads,
            });
        }
        if self.context_length < 2 {
            return Err(TgptError::InvalidConfig(format!(
                "context_length must be at least 2, got {}",
                self.context_length
            )));
        }
        if self.vocab_size == 0 || self.embedding_dim == 0 {
            return Err(TgptError::InvalidConfig(
                "vocab_size and embedding_dim must be positive".into(),
            ));
        }
        for (name, p) in [
            ("embd_dropout", self.embd_dropout),
            ("attn_dropout", self.attn_dropout),
            ("resid_dropout", self.resid_dropout),
            ("mlp_dropout", self.mlp_dropout),
            ("clf_dropout", self.clf_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(TgptError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        if self.marker_token_id < 0 || self.marker_token_id as usize >= self.vocab_total() {
            return Err(TgptError::InvalidConfig(format!(
                "marker token {} outside table of {} rows",
                self.marker_token_id,
                self.vocab_total()
            )));
        }
        if let Some(adapter) = &self.adapter {
            if adapter.rank == 0 {
                return Err(TgptError::InvalidConfig("adapter rank must be positive".into()));
            }
        }
        if let Some(linear) = &self.linear_attention {
            if linear.num_random_features == 0 {
                return Err(TgptError::InvalidConfig(
                    "num_random_features must be positive".into(),
                ));
            }
        }
        self.activation()?;
        Ok(())
    }

    /// Parse from JSON; missing fields take the GPT-1 defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TgptError::InvalidConfig(format!("config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TgptError::InvalidConfig(format!("config JSON: {e}")))
    }
}

impl Default for TGptConfig {
    fn default() -> Self {
        Self::gpt1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        TGptConfig::gpt1().validate().unwrap();
        TGptConfig::tiny().validate().unwrap();
        assert_eq!(TGptConfig::tiny().vocab_total(), 100 + 3 + 8);
        assert_eq!(TGptConfig::gpt1().head_dim(), 64);
    }

    #[test]
    fn test_defaults_follow_gpt1() {
        let c = TGptConfig::default();
        assert_eq!(c.num_heads, 12);
        assert_eq!(c.num_layers, 12);
        assert_eq!(c.attn_dropout, 0.1);
        assert!(c.freeze_embedding);
        assert!(c.scale);
        assert_eq!(c.activation, "gelu");
        assert_eq!(c.projection_kind(), ProjectionKind::Plain);
        assert_eq!(c.attention_kind(), AttentionKind::Softmax);
    }

    #[test]
    fn test_json_partial_fills_defaults() {
        let json = r#"{
            "vocab_size": 50,
            "context_length": 6,
            "embedding_dim": 8,
            "num_heads": 2,
            "marker_token_id": 49,
            "adapter": { "rank": 2, "scale": 16.0 },
            "linear_attention": { "num_random_features": 32 }
        }"#;
        let c = TGptConfig::from_json_str(json).unwrap();
        assert_eq!(c.num_layers, 12);
        assert_eq!(c.projection_kind(), ProjectionKind::LowRank { rank: 2, scale: 16.0 });
        assert_eq!(
            c.attention_kind(),
            AttentionKind::Linear {
                num_random_features: 32,
                seed: 1337
            }
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let c = TGptConfig::tiny();
        let back = TGptConfig::from_json_str(&c.to_json_string().unwrap()).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn test_validate_rejects() {
        let mut c = TGptConfig::tiny();
        c.embedding_dim = 10;
        c.num_heads = 3;
        assert!(matches!(c.validate(), Err(TgptError::DimensionMismatch { dim: 10, heads: 3 })));

        let mut c = TGptConfig::tiny();
        c.marker_token_id = 500;
        assert!(c.validate().is_err());

        let mut c = TGptConfig::tiny();
        c.activation = "nope".into();
        assert!(matches!(c.validate(), Err(TgptError::UnknownActivation(_))));

        let mut c = TGptConfig::tiny();
        c.clf_dropout = 1.0;
        assert!(c.validate().is_err());
    }
}
