use std::fmt::Debug;

use snafu::{OptionExt, ResultExt, Snafu};

use crate::architectures::{BuildContext, BuildPhases, FinalHeads, LayerNormConds, PhaseOutput};
use crate::checkpoint::{ParameterTransform, VariableMapping};
use crate::error::BoxedError;
use crate::graph::{GraphBuilder, GraphError, NodeId};
use crate::layers::attention::{lm_mask, unilm_mask};
use crate::layers::build_layer::CallArguments;
use crate::layers::lambda::{LambdaConfig, LambdaFn};
use crate::models::TransformerSpec;

#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot add attention mask layer '{name}'"))]
    MaskLayer { name: String, source: GraphError },

    #[snafu(display("Attention mask '{name}' requires a segment input"))]
    MissingSegmentInput { name: String },
}

/// Strategy for computing the attention mask of the blocks.
///
/// A strategy is used for a single build.
pub trait ComputeAttentionMask: Debug {
    /// Attention mask for the block with the given index.
    ///
    /// * `builder` - Graph builder of the model.
    /// * `inputs` - Declared model inputs.
    /// * `index` - Index of the block.
    fn compute_attention_mask(
        &mut self,
        builder: &mut GraphBuilder,
        inputs: &[NodeId],
        index: usize,
    ) -> Result<Option<NodeId>, BoxedError>;
}

/// Blocks attend to all (non-padding) pieces.
#[derive(Debug, Default)]
pub struct NoMask;

impl ComputeAttentionMask for NoMask {
    fn compute_attention_mask(
        &mut self,
        _builder: &mut GraphBuilder,
        _inputs: &[NodeId],
        _index: usize,
    ) -> Result<Option<NodeId>, BoxedError> {
        Ok(None)
    }
}

/// Add a mask layer on the segment input on first use.
fn memoized_mask(
    memo: &mut Option<NodeId>,
    builder: &mut GraphBuilder,
    inputs: &[NodeId],
    function: LambdaFn,
    name: &str,
) -> Result<Option<NodeId>, AttentionMaskError> {
    if let Some(mask) = memo {
        return Ok(Some(*mask));
    }

    let segments = *inputs.get(1).context(MissingSegmentInputSnafu { name })?;
    let mask = builder
        .call(
            segments,
            &LambdaConfig::new(function),
            CallArguments::default(),
            name,
        )
        .context(MaskLayerSnafu { name })?;
    *memo = Some(mask);

    Ok(Some(mask))
}

/// Causal mask for language modeling.
///
/// The mask is computed once per build and shared by all blocks.
#[derive(Debug, Default)]
pub struct LanguageModelMask {
    mask: Option<NodeId>,
}

impl ComputeAttentionMask for LanguageModelMask {
    fn compute_attention_mask(
        &mut self,
        builder: &mut GraphBuilder,
        inputs: &[NodeId],
        _index: usize,
    ) -> Result<Option<NodeId>, BoxedError> {
        Ok(memoized_mask(
            &mut self.mask,
            builder,
            inputs,
            lm_mask,
            "Attention-LM-Mask",
        )?)
    }
}

/// Unified language model mask.
///
/// Context pieces (segment `0`) attend to and are attended by all pieces,
/// target pieces attend causally. The mask is computed once per build and
/// shared by all blocks.
#[derive(Debug, Default)]
pub struct UnifiedLanguageModelMask {
    mask: Option<NodeId>,
}

impl ComputeAttentionMask for UnifiedLanguageModelMask {
    fn compute_attention_mask(
        &mut self,
        builder: &mut GraphBuilder,
        inputs: &[NodeId],
        _index: usize,
    ) -> Result<Option<NodeId>, BoxedError> {
        Ok(memoized_mask(
            &mut self.mask,
            builder,
            inputs,
            unilm_mask,
            "Attention-UniLM-Mask",
        )?)
    }
}

fn language_model_mask() -> Box<dyn ComputeAttentionMask> {
    Box::<LanguageModelMask>::default()
}

fn unified_language_model_mask() -> Box<dyn ComputeAttentionMask> {
    Box::<UnifiedLanguageModelMask>::default()
}

/// Architecture with a different attention mask strategy.
///
/// All phases are delegated to the wrapped architecture. Since language
/// models predict pieces, the MLM head is enabled.
#[derive(Debug)]
pub struct WithAttentionMask {
    inner: Box<dyn BuildPhases>,
    mask: fn() -> Box<dyn ComputeAttentionMask>,
}

impl WithAttentionMask {
    /// Wrap an architecture.
    ///
    /// * `inner` - Wrapped architecture.
    /// * `mask` - Constructs the mask strategy of a build.
    pub fn new(mut inner: Box<dyn BuildPhases>, mask: fn() -> Box<dyn ComputeAttentionMask>) -> Self {
        inner.heads_mut().force_mlm();
        WithAttentionMask { inner, mask }
    }

    /// Wrap an architecture to become a causal language model.
    pub fn language_model(inner: Box<dyn BuildPhases>) -> Self {
        Self::new(inner, language_model_mask)
    }

    /// Wrap an architecture to become a unified language model.
    pub fn unified_language_model(inner: Box<dyn BuildPhases>) -> Self {
        Self::new(inner, unified_language_model_mask)
    }
}

impl BuildPhases for WithAttentionMask {
    fn spec(&self) -> &TransformerSpec {
        self.inner.spec()
    }

    fn heads(&self) -> &FinalHeads {
        self.inner.heads()
    }

    fn heads_mut(&mut self) -> &mut FinalHeads {
        self.inner.heads_mut()
    }

    fn attention_mask(&self) -> Box<dyn ComputeAttentionMask> {
        (self.mask)()
    }

    fn prepare_inputs(&self, ctx: &mut BuildContext) -> Result<Vec<NodeId>, BoxedError> {
        self.inner.prepare_inputs(ctx)
    }

    fn prepare_embeddings(
        &self,
        ctx: &mut BuildContext,
        inputs: &[NodeId],
        conds: LayerNormConds,
    ) -> Result<PhaseOutput, BoxedError> {
        self.inner.prepare_embeddings(ctx, inputs, conds)
    }

    fn prepare_main_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
        index: usize,
    ) -> Result<PhaseOutput, BoxedError> {
        self.inner.prepare_main_layers(ctx, previous, index)
    }

    fn prepare_final_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
    ) -> Result<Vec<NodeId>, BoxedError> {
        self.inner.prepare_final_layers(ctx, previous)
    }

    fn variable_mapping(&self) -> VariableMapping {
        self.inner.variable_mapping()
    }

    fn parameter_transform(&self, variable: &str) -> ParameterTransform<'_> {
        self.inner.parameter_transform(variable)
    }
}
