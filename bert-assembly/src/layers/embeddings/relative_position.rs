use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_layer::{check_arity, BuildLayer, CallArguments, InputArityError, Layer};

#[derive(Debug, Snafu)]
pub enum RelativePositionEmbeddingError {
    #[snafu(display("Cannot construct relative position table"))]
    Table { source: candle_core::Error },

    #[snafu(display("Invalid relative position input"))]
    RelativePositionInput { source: InputArityError },

    #[snafu(display("Cannot compute relative position embeddings"))]
    RelativeLookup { source: candle_core::Error },
}

/// Sinusoidal position table (_Vaswani et al., 2017_).
///
/// For position `pos` and pair index `i < depth / 2`, column `2i` is
/// `sin(pos / 10000^(2i / depth))` and column `2i + 1` the cosine of the
/// same angle. The table is computed in double precision and rounded to
/// single precision, so it is identical across platforms.
///
/// Returns the table in row-major order, *shape:* `(rows, depth)`.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub fn sinusoidal_embeddings(rows: usize, depth: usize) -> Vec<f32> {
    let mut table = vec![0f32; rows * depth];
    for pos in 0..rows {
        for i in 0..depth / 2 {
            let theta = pos as f64 / 10000f64.powf(2. * i as f64 / depth as f64);
            table[pos * depth + 2 * i] = theta.sin() as f32;
            table[pos * depth + 2 * i + 1] = theta.cos() as f32;
        }
    }
    table
}

/// Relative position embedding configuration.
///
/// The embedding table is fixed (sinusoidal) and not trainable.
#[derive(Clone, Debug)]
pub struct RelativePositionEmbeddingConfig {
    max_distance: usize,
    width: usize,
}

impl RelativePositionEmbeddingConfig {
    /// Distances are clipped to `[-max_distance, max_distance]`, the table
    /// has `2 * max_distance + 1` rows.
    ///
    /// Default: `64`
    pub fn max_distance(mut self, max_distance: usize) -> Self {
        self.max_distance = max_distance;
        self
    }

    /// Width of the embeddings, the attention head size.
    ///
    /// Default: `64`
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }
}

impl Default for RelativePositionEmbeddingConfig {
    fn default() -> Self {
        Self {
            max_distance: 64,
            width: 64,
        }
    }
}

impl BuildLayer for RelativePositionEmbeddingConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let rows = 2 * self.max_distance + 1;
        let table = Tensor::from_vec(
            sinusoidal_embeddings(rows, self.width),
            (rows, self.width),
            vb.device(),
        )
        .and_then(|table| table.to_dtype(vb.dtype()))
        .context(TableSnafu)?;

        Ok(Box::new(RelativePositionEmbedding {
            max_distance: self.max_distance,
            name: name.to_string(),
            table,
        }))
    }
}

/// Relative position embeddings (_Shaw et al., 2018_).
///
/// Inputs: `[query, key]`, *shape:* `(batch_size, seq_len, width)`.
/// Output: embeddings of the clipped distances `key_pos - query_pos`,
/// *shape:* `(query_len, key_len, width)`.
///
/// This layer has no trainable parameters.
///
/// * _Shaw et al., 2018_: https://arxiv.org/abs/1803.02155
#[derive(Debug)]
pub struct RelativePositionEmbedding {
    max_distance: usize,
    name: String,
    table: Tensor,
}

impl RelativePositionEmbedding {
    fn relative_ids(
        &self,
        query_len: usize,
        key_len: usize,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let max_distance = self.max_distance as i64;
        let ids = (0..query_len as i64)
            .flat_map(|q| {
                (0..key_len as i64)
                    .map(move |k| ((k - q).clamp(-max_distance, max_distance) + max_distance) as u32)
            })
            .collect::<Vec<_>>();
        Tensor::from_vec(ids, query_len * key_len, device)
    }
}

impl Layer for RelativePositionEmbedding {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 2..=2).context(RelativePositionInputSnafu)?;
        let query_len = inputs[0].dim(1).context(RelativeLookupSnafu)?;
        let key_len = inputs[1].dim(1).context(RelativeLookupSnafu)?;
        let width = self.table.dim(1).context(RelativeLookupSnafu)?;

        Ok(self
            .relative_ids(query_len, key_len, self.table.device())
            .and_then(|ids| self.table.index_select(&ids, 0))
            .and_then(|embeddings| embeddings.reshape((query_len, key_len, width)))
            .context(RelativeLookupSnafu)?)
    }
}
