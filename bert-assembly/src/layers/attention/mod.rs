/// Attention layers.
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_layer::{
    check_arity, BuildLayer, CallArguments, InputArityError, Layer, PositionBias,
};
use crate::layers::dense::Projection;

mod mask;
pub use mask::{apply_logit_mask, key_padding_mask, lm_mask, unilm_mask, AttentionMaskError};

#[derive(Debug, Snafu)]
pub enum MultiHeadAttentionError {
    #[snafu(display("Cannot compute attention"))]
    Attend { source: candle_core::Error },

    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: AttentionMaskError },

    #[snafu(display("Cannot construct attention layer"))]
    AttentionConstruction { source: candle_core::Error },

    #[snafu(display("Invalid attention input"))]
    AttentionInput { source: InputArityError },

    #[snafu(display(
        "Attention layer '{name}' expects {expected} inputs for its call arguments, got {got}"
    ))]
    CallArity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[snafu(display("Cannot split or merge attention heads"))]
    Heads { source: candle_core::Error },

    #[snafu(display("Cannot apply relative position bias"))]
    RelativePosition { source: candle_core::Error },
}

/// Multi-head attention configuration.
#[derive(Clone, Debug)]
pub struct MultiHeadAttentionConfig {
    head_size: usize,
    heads: usize,
    hidden_width: usize,
    initializer_range: f64,
}

impl MultiHeadAttentionConfig {
    /// Width of each attention head.
    ///
    /// Default: `64`
    pub fn head_size(mut self, head_size: usize) -> Self {
        self.head_size = head_size;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `12`
    pub fn heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    /// Hidden width, the width of the inputs and the output.
    ///
    /// Default: `768`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Standard deviation of the kernel initialization.
    ///
    /// Default: `0.02`
    pub fn initializer_range(mut self, initializer_range: f64) -> Self {
        self.initializer_range = initializer_range;
        self
    }
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        Self {
            head_size: 64,
            heads: 12,
            hidden_width: 768,
            initializer_range: 0.02,
        }
    }
}

impl BuildLayer for MultiHeadAttentionConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let init = Init::Randn {
            mean: 0.,
            stdev: self.initializer_range,
        };
        let all_heads = self.heads * self.head_size;
        let projection = |prefix: &str, input_width: usize, output_width: usize| {
            Projection::new(
                vb.pp(prefix),
                &format!("{name}.{prefix}"),
                input_width,
                output_width,
                true,
                init,
            )
            .context(AttentionConstructionSnafu)
        };

        Ok(Box::new(MultiHeadAttention {
            head_size: self.head_size,
            heads: self.heads,
            name: name.to_string(),
            query: projection("query", self.hidden_width, all_heads)?,
            key: projection("key", self.hidden_width, all_heads)?,
            value: projection("value", self.hidden_width, all_heads)?,
            output: projection("output", all_heads, self.hidden_width)?,
        }))
    }
}

/// Multi-head scaled dot-product attention (_Vaswani et al., 2017_).
///
/// Inputs, in order: query, key, value *(batch_size, seq_len, width)*,
/// then depending on the call arguments:
///
/// * `v_mask`: key padding mask *(batch_size, key_len)*, non-zero for
///   keys that can be attended to.
/// * `a_mask`: attention mask, broadcastable to
///   *(batch_size, heads, query_len, key_len)*, non-zero where attention
///   is allowed.
/// * `p_bias`: relative position embeddings *(query_len, key_len, head_size)*
///   for [`PositionBias::TypicalRelative`] (_Shaw et al., 2018_).
///
/// Parameters: `query.kernel`, `query.bias`, `key.kernel`, `key.bias`,
/// `value.kernel`, `value.bias`, `output.kernel`, `output.bias`.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
/// * _Shaw et al., 2018_: https://arxiv.org/abs/1803.02155
#[derive(Debug)]
pub struct MultiHeadAttention {
    head_size: usize,
    heads: usize,
    name: String,
    query: Projection,
    key: Projection,
    value: Projection,
    output: Projection,
}

impl MultiHeadAttention {
    /// Project and split into heads.
    ///
    /// `(batch_size, seq_len, width)` -> `(batch_size, heads, seq_len, head_size)`
    fn split_heads(
        &self,
        projection: &Projection,
        xs: &Tensor,
    ) -> Result<Tensor, candle_core::Error> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        projection
            .forward(xs)?
            .reshape((batch_size, seq_len, self.heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `einsum('bhjd,jkd->bhjk', query, positions)`
    fn relative_scores(query: &Tensor, positions: &Tensor) -> Result<Tensor, candle_core::Error> {
        let (batch_size, heads, query_len, head_size) = query.dims4()?;
        let key_len = positions.dim(1)?;
        query
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((query_len, batch_size * heads, head_size))?
            .matmul(&positions.transpose(1, 2)?.contiguous()?)?
            .reshape((query_len, batch_size, heads, key_len))?
            .permute((1, 2, 0, 3))?
            .contiguous()
    }

    /// `einsum('bhjk,jkd->bhjd', weights, positions)`
    fn relative_values(weights: &Tensor, positions: &Tensor) -> Result<Tensor, candle_core::Error> {
        let (batch_size, heads, query_len, key_len) = weights.dims4()?;
        let head_size = positions.dim(2)?;
        weights
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((query_len, batch_size * heads, key_len))?
            .matmul(positions)?
            .reshape((query_len, batch_size, heads, head_size))?
            .permute((1, 2, 0, 3))?
            .contiguous()
    }
}

impl Layer for MultiHeadAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 3..=6).context(AttentionInputSnafu)?;
        let expected = 3
            + arguments.has_v_mask() as usize
            + arguments.has_a_mask() as usize
            + arguments.position_bias().is_some() as usize;
        ensure!(
            inputs.len() == expected,
            CallAritySnafu {
                name: self.name.clone(),
                expected,
                got: inputs.len()
            }
        );

        let mut rest = inputs[3..].iter();
        let key_mask = arguments.has_v_mask().then(|| rest.next()).flatten();
        let attention_mask = arguments.has_a_mask().then(|| rest.next()).flatten();
        let positions = match arguments.position_bias() {
            Some(PositionBias::TypicalRelative) => rest
                .next()
                .map(|positions| positions.to_dtype(inputs[0].dtype()))
                .transpose()
                .context(RelativePositionSnafu)?,
            None => None,
        };

        let query = self.split_heads(&self.query, &inputs[0]).context(HeadsSnafu)?;
        let key = self.split_heads(&self.key, &inputs[1]).context(HeadsSnafu)?;
        let value = self.split_heads(&self.value, &inputs[2]).context(HeadsSnafu)?;

        let mut scores = query
            .matmul(&key.transpose(2, 3).context(AttendSnafu)?.contiguous().context(AttendSnafu)?)
            .context(AttendSnafu)?;
        if let Some(positions) = &positions {
            scores = (scores + Self::relative_scores(&query, positions).context(RelativePositionSnafu)?)
                .context(RelativePositionSnafu)?;
        }
        scores = (scores / (self.head_size as f64).sqrt()).context(AttendSnafu)?;

        scores = apply_logit_mask(&scores, key_mask, attention_mask).context(AttentionMaskSnafu)?;

        // Softmax in single precision to avoid overflows in narrow types.
        let weights = candle_nn::ops::softmax_last_dim(
            &scores.to_dtype(DType::F32).context(AttendSnafu)?,
        )
        .and_then(|weights| weights.to_dtype(query.dtype()))
        .context(AttendSnafu)?;

        let mut attention = weights.matmul(&value).context(AttendSnafu)?;
        if let Some(positions) = &positions {
            attention = (attention
                + Self::relative_values(&weights, positions).context(RelativePositionSnafu)?)
            .context(RelativePositionSnafu)?;
        }

        let (batch_size, _, seq_len, _) = attention.dims4().context(HeadsSnafu)?;
        let attention = attention
            .transpose(1, 2)
            .and_then(|xs| xs.contiguous())
            .and_then(|xs| xs.reshape((batch_size, seq_len, self.heads * self.head_size)))
            .context(HeadsSnafu)?;

        Ok(self
            .output
            .forward(&attention)
            .context(AttendSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        [&self.query, &self.key, &self.value, &self.output]
            .iter()
            .flat_map(|projection| projection.parameter_names())
            .cloned()
            .collect()
    }
}
