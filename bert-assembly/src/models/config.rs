use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

use crate::layers::activation::Activation;

fn default_type_vocab_size() -> usize {
    2
}

/// Model configuration, as stored in `bert_config.json`/`config.json`.
///
/// Unknown keys are ignored.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransformerConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: Activation,
    pub hidden_dropout_prob: f32,
    #[serde(default)]
    pub embedding_size: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
}

#[derive(Debug, Snafu)]
pub enum SpecError {
    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    DropoutProbability { p: f32 },

    #[snafu(display(
        "Hidden size ({hidden_size}) must be divisible by the number of attention heads ({heads})"
    ))]
    IndivisibleHiddenSize { hidden_size: usize, heads: usize },

    #[snafu(display("Kept token {token} is not in the vocabulary (size {vocab_size})"))]
    KeptTokenOutOfRange { token: u32, vocab_size: usize },

    #[snafu(display("{model} requires the maximum number of positions"))]
    MissingMaxPositions { model: String },

    #[snafu(display("The number of attention heads must be positive"))]
    NoAttentionHeads,
}

/// Validated hyperparameters of a transformer.
///
/// When a kept-token list is given, the vocabulary is reduced to the kept
/// tokens and `vocab_size` is the number of kept tokens.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformerSpec {
    attention_head_size: usize,
    dropout_rate: f32,
    embedding_size: usize,
    full_vocab_size: usize,
    hidden_act: Activation,
    hidden_size: usize,
    intermediate_size: usize,
    keep_tokens: Option<Vec<u32>>,
    max_position: Option<usize>,
    num_attention_heads: usize,
    num_hidden_layers: usize,
    segment_vocab_size: usize,
    vocab_size: usize,
}

impl TransformerSpec {
    /// Validate a configuration.
    ///
    /// * `config` - Model configuration.
    /// * `keep_tokens` - Token identifiers to keep from the vocabulary.
    pub fn new(config: &TransformerConfig, keep_tokens: Option<Vec<u32>>) -> Result<Self, SpecError> {
        ensure!(config.num_attention_heads > 0, NoAttentionHeadsSnafu);
        ensure!(
            config.hidden_size % config.num_attention_heads == 0,
            IndivisibleHiddenSizeSnafu {
                hidden_size: config.hidden_size,
                heads: config.num_attention_heads
            }
        );
        ensure!(
            (0.0..1.0).contains(&config.hidden_dropout_prob),
            DropoutProbabilitySnafu {
                p: config.hidden_dropout_prob
            }
        );

        if let Some(keep_tokens) = &keep_tokens {
            if let Some(&token) = keep_tokens
                .iter()
                .find(|&&token| token as usize >= config.vocab_size)
            {
                return KeptTokenOutOfRangeSnafu {
                    token,
                    vocab_size: config.vocab_size,
                }
                .fail();
            }
        }

        Ok(TransformerSpec {
            attention_head_size: config.hidden_size / config.num_attention_heads,
            dropout_rate: config.hidden_dropout_prob,
            embedding_size: config.embedding_size.unwrap_or(config.hidden_size),
            full_vocab_size: config.vocab_size,
            hidden_act: config.hidden_act,
            hidden_size: config.hidden_size,
            intermediate_size: config.intermediate_size,
            max_position: config.max_position_embeddings,
            num_attention_heads: config.num_attention_heads,
            num_hidden_layers: config.num_hidden_layers,
            segment_vocab_size: config.type_vocab_size,
            vocab_size: keep_tokens
                .as_ref()
                .map_or(config.vocab_size, |keep_tokens| keep_tokens.len()),
            keep_tokens,
        })
    }

    pub fn attention_head_size(&self) -> usize {
        self.attention_head_size
    }

    pub fn dropout_rate(&self) -> f32 {
        self.dropout_rate
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// Vocabulary size before reduction to the kept tokens.
    pub fn full_vocab_size(&self) -> usize {
        self.full_vocab_size
    }

    pub fn hidden_act(&self) -> Activation {
        self.hidden_act
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    pub fn keep_tokens(&self) -> Option<&[u32]> {
        self.keep_tokens.as_deref()
    }

    pub fn max_position(&self) -> Option<usize> {
        self.max_position
    }

    pub fn num_attention_heads(&self) -> usize {
        self.num_attention_heads
    }

    pub fn num_hidden_layers(&self) -> usize {
        self.num_hidden_layers
    }

    pub fn segment_vocab_size(&self) -> usize {
        self.segment_vocab_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The maximum number of positions, required by models with absolute
    /// position embeddings.
    pub(crate) fn require_max_position(&self, model: &str) -> Result<usize, SpecError> {
        self.max_position
            .ok_or_else(|| SpecError::MissingMaxPositions {
                model: model.to_string(),
            })
    }
}
