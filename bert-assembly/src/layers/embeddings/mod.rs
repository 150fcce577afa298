/// Embedding layers.
use std::fmt;

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_layer::{
    check_arity, parameter_name, BuildLayer, CallArguments, InputArityError, Layer,
};

mod relative_position;
pub use relative_position::{
    sinusoidal_embeddings, RelativePositionEmbedding, RelativePositionEmbeddingConfig,
    RelativePositionEmbeddingError,
};

/// Errors for embedding layers.
#[derive(Debug, Snafu)]
pub enum EmbeddingError {
    #[snafu(display("Cannot construct embedding layer"))]
    EmbeddingConstruction { source: candle_core::Error },

    #[snafu(display("Invalid embedding input"))]
    EmbeddingInput { source: InputArityError },

    #[snafu(display("Cannot look up embeddings"))]
    Lookup { source: candle_core::Error },

    #[snafu(display(
        "Sequence length {seq_len} exceeds the maximum number of positions ({max_positions})"
    ))]
    TooManyPositions { seq_len: usize, max_positions: usize },

    #[snafu(display("Cannot project to vocabulary"))]
    VocabProjection { source: candle_core::Error },
}

/// Token embedding configuration.
#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    initializer_range: f64,
    input_dim: usize,
    output_dim: usize,
}

impl EmbeddingConfig {
    /// Standard deviation of the embedding initialization.
    ///
    /// Default: `0.02`
    pub fn initializer_range(mut self, initializer_range: f64) -> Self {
        self.initializer_range = initializer_range;
        self
    }

    /// Number of embeddings (vocabulary size).
    ///
    /// Default: `30522`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Width of the embeddings.
    ///
    /// Default: `768`
    pub fn output_dim(mut self, output_dim: usize) -> Self {
        self.output_dim = output_dim;
        self
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            initializer_range: 0.02,
            input_dim: 30522,
            output_dim: 768,
        }
    }
}

impl BuildLayer for EmbeddingConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let embeddings = vb
            .get_with_hints(
                (self.input_dim, self.output_dim),
                "embeddings",
                Init::Randn {
                    mean: 0.,
                    stdev: self.initializer_range,
                },
            )
            .context(EmbeddingConstructionSnafu)?;

        Ok(Box::new(Embedding {
            embeddings,
            name: name.to_string(),
        }))
    }
}

/// Embedding lookup.
///
/// Input: piece identifiers *(batch_size, seq_len)*.
/// Output: *(batch_size, seq_len, output_dim)*.
///
/// Parameters: `embeddings` *(input_dim, output_dim)*.
#[derive(Debug)]
pub struct Embedding {
    embeddings: Tensor,
    name: String,
}

impl Layer for Embedding {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=1).context(EmbeddingInputSnafu)?;
        let ids = &inputs[0];
        let mut dims = ids.dims().to_vec();
        dims.push(self.embeddings.dim(1).context(LookupSnafu)?);
        Ok(ids
            .flatten_all()
            .and_then(|ids| self.embeddings.index_select(&ids, 0))
            .and_then(|embeddings| embeddings.reshape(dims))
            .context(LookupSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        vec![parameter_name(&self.name, "embeddings")]
    }
}

/// Trainable absolute position embedding configuration.
///
/// The position embeddings are added to the input.
#[derive(Clone, Debug)]
pub struct PositionEmbeddingConfig {
    initializer_range: f64,
    max_positions: usize,
    width: usize,
}

impl PositionEmbeddingConfig {
    /// Standard deviation of the embedding initialization.
    ///
    /// Default: `0.02`
    pub fn initializer_range(mut self, initializer_range: f64) -> Self {
        self.initializer_range = initializer_range;
        self
    }

    /// Maximum number of positions.
    ///
    /// Default: `512`
    pub fn max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }

    /// Width of the embeddings.
    ///
    /// Default: `768`
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }
}

impl Default for PositionEmbeddingConfig {
    fn default() -> Self {
        Self {
            initializer_range: 0.02,
            max_positions: 512,
            width: 768,
        }
    }
}

impl BuildLayer for PositionEmbeddingConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let embeddings = vb
            .get_with_hints(
                (self.max_positions, self.width),
                "embeddings",
                Init::Randn {
                    mean: 0.,
                    stdev: self.initializer_range,
                },
            )
            .context(EmbeddingConstructionSnafu)?;

        Ok(Box::new(PositionEmbedding {
            embeddings,
            max_positions: self.max_positions,
            name: name.to_string(),
        }))
    }
}

/// Absolute position embeddings, added to the input.
///
/// Input: *(batch_size, seq_len, width)*.
///
/// Parameters: `embeddings` *(max_positions, width)*.
#[derive(Debug)]
pub struct PositionEmbedding {
    embeddings: Tensor,
    max_positions: usize,
    name: String,
}

impl Layer for PositionEmbedding {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=1).context(EmbeddingInputSnafu)?;
        let input = &inputs[0];
        let seq_len = input.dim(1).context(LookupSnafu)?;
        ensure!(
            seq_len <= self.max_positions,
            TooManyPositionsSnafu {
                seq_len,
                max_positions: self.max_positions
            }
        );

        Ok(self
            .embeddings
            .narrow(0, 0, seq_len)
            .and_then(|positions| input.broadcast_add(&positions))
            .context(LookupSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        vec![parameter_name(&self.name, "embeddings")]
    }
}

/// Output layer that projects to the vocabulary with the transposed
/// token embedding matrix.
///
/// The embedding matrix is shared with the token embedding layer, so it
/// is not a parameter of this layer.
#[derive(Clone)]
pub struct EmbeddingDenseConfig {
    activation: Activation,
    embeddings: Tensor,
}

impl EmbeddingDenseConfig {
    /// Construct the configuration.
    ///
    /// * `embeddings` - Token embedding matrix.
    ///   *Shape:* `(vocab_size, width)`
    pub fn new(embeddings: Tensor) -> Self {
        EmbeddingDenseConfig {
            activation: Activation::Softmax,
            embeddings,
        }
    }

    /// Activation applied to the vocabulary logits.
    ///
    /// Default: `Activation::Softmax`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

impl fmt::Debug for EmbeddingDenseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingDenseConfig")
            .field("activation", &self.activation)
            .field("embeddings", &self.embeddings.dims())
            .finish()
    }
}

impl BuildLayer for EmbeddingDenseConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let vocab_size = self.embeddings.dim(0).context(EmbeddingConstructionSnafu)?;
        let bias = vb
            .get_with_hints(vocab_size, "bias", candle_nn::init::ZERO)
            .context(EmbeddingConstructionSnafu)?;

        Ok(Box::new(EmbeddingDense {
            activation: self.activation,
            bias,
            embeddings: self.embeddings.clone(),
            name: name.to_string(),
        }))
    }
}

/// Projection to the vocabulary, tied to the token embeddings.
///
/// Input: *(batch_size, seq_len, width)*.
/// Output: *(batch_size, seq_len, vocab_size)*.
///
/// Parameters: `bias` *(vocab_size)*.
#[derive(Debug)]
pub struct EmbeddingDense {
    activation: Activation,
    bias: Tensor,
    embeddings: Tensor,
    name: String,
}

impl Layer for EmbeddingDense {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=1).context(EmbeddingInputSnafu)?;
        let logits = self
            .embeddings
            .t()
            .and_then(|kernel| inputs[0].broadcast_matmul(&kernel))
            .and_then(|logits| logits.broadcast_add(&self.bias))
            .context(VocabProjectionSnafu)?;
        Ok(self
            .activation
            .forward(&logits)
            .context(VocabProjectionSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        vec![parameter_name(&self.name, "bias")]
    }
}
