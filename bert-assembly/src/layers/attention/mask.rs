use candle_core::{DType, Tensor};
use snafu::{ResultExt, Snafu};

use crate::util::tensor_ext::MinLike;

#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot intersect masks"))]
    IntersectMasks { source: candle_core::Error },
}

/// Convert a mask to a boolean (`u8`) mask.
fn to_bool_mask(mask: &Tensor) -> Result<Tensor, candle_core::Error> {
    match mask.dtype() {
        DType::U8 => Ok(mask.clone()),
        _ => mask.ne(&mask.zeros_like()?),
    }
}

/// Use the key padding mask and/or the attention mask to mask logits.
///
/// * `scores` - Attention logits.
///   *Shape:* `(batch_size, heads, query_len, key_len)`
/// * `key_mask` - Key padding mask, non-zero for keys that can be attended.
///   *Shape:* `(batch_size, key_len)`
/// * `attention_mask` - Attention mask, non-zero where attention is allowed.
///   *Shape:* broadcastable to `(batch_size, heads, query_len, key_len)`
///
/// Returns: Logits with blocked positions set to the minimum value of
/// the logits' data type.
pub fn apply_logit_mask(
    scores: &Tensor,
    key_mask: Option<&Tensor>,
    attention_mask: Option<&Tensor>,
) -> Result<Tensor, AttentionMaskError> {
    let key_mask = key_mask
        .map(|mask| {
            let (batch_size, key_len) = mask.dims2()?;
            to_bool_mask(mask)?.reshape((batch_size, 1, 1, key_len))
        })
        .transpose()
        .context(IntersectMasksSnafu)?;
    let attention_mask = attention_mask
        .map(to_bool_mask)
        .transpose()
        .context(IntersectMasksSnafu)?;

    let mask = match (key_mask, attention_mask) {
        (Some(key_mask), Some(attention_mask)) => key_mask
            .broadcast_mul(&attention_mask)
            .context(IntersectMasksSnafu)?,
        (Some(mask), None) | (None, Some(mask)) => mask,
        (None, None) => return Ok(scores.clone()),
    };

    // Underflows to -inf for more narrow floating point types, which
    // is ok for masking.
    let blocked_value = scores.min_like().context(ApplyLogitsMaskSnafu)?;
    mask.broadcast_as(scores.shape())
        .and_then(|mask| mask.where_cond(scores, &blocked_value))
        .context(ApplyLogitsMaskSnafu)
}

/// Key padding mask from piece identifiers, piece `0` is padding.
///
/// Input: piece identifiers *(batch_size, seq_len)*.
/// Output: `u8` mask *(batch_size, seq_len)*.
pub fn key_padding_mask(inputs: &[Tensor]) -> Result<Tensor, candle_core::Error> {
    let ids = &inputs[0];
    ids.ne(&ids.zeros_like()?)
}

/// `u8` mask of shape `(seq_len, seq_len)` with `mask[i][j] = 1 iff j <= i`.
fn causal(segments: &Tensor) -> Result<Tensor, candle_core::Error> {
    let seq_len = segments.dim(1)?;
    let positions = Tensor::arange(0u32, seq_len as u32, segments.device())?;
    positions
        .reshape((1, seq_len))?
        .broadcast_le(&positions.reshape((seq_len, 1))?)
}

/// Causal language model mask.
///
/// Input: segment identifiers *(batch_size, seq_len)*, only the
/// sequence length is used.
/// Output: `u8` mask *(1, 1, seq_len, seq_len)*, `mask[i][j] = 1 iff j <= i`.
pub fn lm_mask(inputs: &[Tensor]) -> Result<Tensor, candle_core::Error> {
    let mask = causal(&inputs[0])?;
    mask.unsqueeze(0)?.unsqueeze(0)
}

/// Unified language model mask (_Dong et al., 2019_).
///
/// Input: segment identifiers *(batch_size, seq_len)*, `0` for context
/// pieces and `1` for target pieces.
/// Output: `u8` mask *(batch_size, 1, seq_len, seq_len)*. A cell is
/// unmasked when the query or the key is a context piece, otherwise the
/// causal mask applies.
///
/// Context queries thus also attend to target keys. This differs from the
/// stricter `(1 - s_i)(1 - s_j) + s_i * tril(i, j)` formulation, in which
/// context queries only attend to context keys. When the context precedes
/// the targets, target queries see the same keys under both formulations.
///
/// * _Dong et al., 2019_: https://arxiv.org/abs/1905.03197
pub fn unilm_mask(inputs: &[Tensor]) -> Result<Tensor, candle_core::Error> {
    let segments = &inputs[0];
    let (batch_size, seq_len) = segments.dims2()?;
    let context = segments.eq(&segments.zeros_like()?)?;
    causal(segments)?
        .reshape((1, 1, seq_len, seq_len))?
        .broadcast_maximum(&context.reshape((batch_size, 1, seq_len, 1))?)?
        .broadcast_maximum(&context.reshape((batch_size, 1, 1, seq_len))?)
}
