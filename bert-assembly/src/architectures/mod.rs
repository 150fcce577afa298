/// Build phases of transformer architectures.
use std::fmt::Debug;

use candle_core::Tensor;

use crate::checkpoint::{ParameterTransform, VariableMapping};
use crate::error::BoxedError;
use crate::graph::{simplify, CallInputs, GraphBuilder, GraphError, NodeId};
use crate::layers::activation::Activation;
use crate::layers::build_layer::{BuildLayer, CallArguments};
use crate::layers::layer_norm::ConditionConfig;
use crate::models::TransformerSpec;

mod mask;
pub use mask::{
    AttentionMaskError, ComputeAttentionMask, LanguageModelMask, NoMask,
    UnifiedLanguageModelMask, WithAttentionMask,
};

mod model;
pub use model::{build_model, BuildModelError, TransformerModel};

/// Conditioning of the layer normalizations on an additional model input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Conditioning {
    hidden_activation: Activation,
    hidden_units: Option<usize>,
    width: usize,
}

impl Conditioning {
    /// Condition on a vector of the given width.
    pub fn new(width: usize) -> Self {
        Conditioning {
            hidden_activation: Activation::Linear,
            hidden_units: None,
            width,
        }
    }

    /// Activation of the hidden condition projection.
    ///
    /// Default: `Activation::Linear`
    pub fn hidden_activation(mut self, hidden_activation: Activation) -> Self {
        self.hidden_activation = hidden_activation;
        self
    }

    /// Project the condition to this width before it is used.
    ///
    /// Default: `None`
    pub fn hidden_units(mut self, hidden_units: Option<usize>) -> Self {
        self.hidden_units = hidden_units;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

/// Condition of the layer normalizations, carried between phases.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LayerNormConds {
    condition: Option<(NodeId, Conditioning)>,
}

impl LayerNormConds {
    /// Layer normalizations conditioned on the given node.
    pub fn new(condition: NodeId, conditioning: Conditioning) -> Self {
        LayerNormConds {
            condition: Some((condition, conditioning)),
        }
    }

    /// Unconditional layer normalizations.
    pub fn unconditional() -> Self {
        LayerNormConds::default()
    }

    /// Node holding the condition.
    pub fn condition(&self) -> Option<NodeId> {
        self.condition.map(|(node, _)| node)
    }

    /// Condition configuration for layer normalizations.
    pub fn config(&self) -> Option<ConditionConfig> {
        self.condition.map(|(_, conditioning)| ConditionConfig {
            width: conditioning.width,
            hidden_units: conditioning.hidden_units,
            hidden_activation: conditioning.hidden_activation,
        })
    }

    /// Inputs of a layer normalization of `hidden`.
    pub fn inputs(&self, hidden: NodeId) -> CallInputs {
        simplify([Some(hidden), self.condition()])
    }
}

/// Output of a build phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseOutput {
    /// Hidden representations.
    pub hidden: NodeId,

    /// Key padding mask.
    pub key_mask: Option<NodeId>,

    /// Relative position embeddings.
    pub position_bias: Option<NodeId>,

    /// Condition of the layer normalizations.
    pub conds: LayerNormConds,
}

impl PhaseOutput {
    pub fn new(hidden: NodeId, conds: LayerNormConds) -> Self {
        PhaseOutput {
            hidden,
            key_mask: None,
            position_bias: None,
            conds,
        }
    }

    /// Replace the hidden representations.
    pub fn with_hidden(self, hidden: NodeId) -> Self {
        PhaseOutput { hidden, ..self }
    }
}

/// Heads that are added on top of the last block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FinalHeads {
    mlm: Option<Activation>,
    nsp: bool,
    pool: Option<Activation>,
}

impl FinalHeads {
    /// Add a masked language modeling head with the given activation.
    ///
    /// Default: `None`
    pub fn with_mlm(mut self, mlm: Option<Activation>) -> Self {
        self.mlm = mlm;
        self
    }

    /// Add a next sentence prediction head.
    ///
    /// Default: `false`
    pub fn with_nsp(mut self, nsp: bool) -> Self {
        self.nsp = nsp;
        self
    }

    /// Add a pooler with the given activation.
    ///
    /// Default: `None`
    pub fn with_pool(mut self, pool: Option<Activation>) -> Self {
        self.pool = pool;
        self
    }

    pub fn mlm(&self) -> Option<Activation> {
        self.mlm
    }

    pub fn nsp(&self) -> bool {
        self.nsp
    }

    /// Activation of the pooler, if a pooler is built.
    ///
    /// The pooler is also built for next sentence prediction, it then
    /// defaults to `tanh`.
    pub fn pool(&self) -> Option<Activation> {
        match (self.pool, self.nsp) {
            (Some(activation), _) => Some(activation),
            (None, true) => Some(Activation::Tanh),
            (None, false) => None,
        }
    }

    /// Enable the MLM head with softmax, unless it was already enabled.
    pub(crate) fn force_mlm(&mut self) {
        self.mlm.get_or_insert(Activation::Softmax);
    }
}

/// Graph builder state that is shared by the phases of a build.
pub struct BuildContext<'a> {
    attention_mask: &'a mut dyn ComputeAttentionMask,
    builder: &'a mut GraphBuilder,
    inputs: Vec<NodeId>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(
        builder: &'a mut GraphBuilder,
        attention_mask: &'a mut dyn ComputeAttentionMask,
    ) -> Self {
        BuildContext {
            attention_mask,
            builder,
            inputs: Vec::new(),
        }
    }

    /// Declare a model input.
    pub fn input(&mut self, name: &str) -> NodeId {
        let node = self.builder.input(name);
        self.inputs.push(node);
        node
    }

    /// Declared model inputs.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Invoke a layer, see [`GraphBuilder::call`].
    pub fn call(
        &mut self,
        inputs: impl Into<CallInputs>,
        config: &dyn BuildLayer,
        arguments: CallArguments,
        name: &str,
    ) -> Result<NodeId, GraphError> {
        self.builder.call(inputs, config, arguments, name)
    }

    /// Attention mask for the block with the given index.
    pub fn compute_attention_mask(&mut self, index: usize) -> Result<Option<NodeId>, BoxedError> {
        self.attention_mask
            .compute_attention_mask(self.builder, &self.inputs, index)
    }

    /// Current value of a parameter, see [`GraphBuilder::parameter`].
    pub fn parameter(&self, name: &str) -> Option<Tensor> {
        self.builder.parameter(name)
    }
}

/// Construction recipe of a transformer architecture.
///
/// A model is built by calling the phases in order: inputs, embeddings,
/// one main layer phase per block, and final layers. Each phase receives
/// the output of the previous phase.
pub trait BuildPhases: Debug {
    /// Hyperparameters of the model.
    fn spec(&self) -> &TransformerSpec;

    /// Heads on top of the last block.
    fn heads(&self) -> &FinalHeads;

    fn heads_mut(&mut self) -> &mut FinalHeads;

    /// Attention mask strategy of a build.
    fn attention_mask(&self) -> Box<dyn ComputeAttentionMask> {
        Box::new(NoMask)
    }

    /// Declare the model inputs.
    fn prepare_inputs(&self, ctx: &mut BuildContext) -> Result<Vec<NodeId>, BoxedError>;

    /// Embed the inputs.
    ///
    /// * `inputs` - The inputs returned by [`BuildPhases::prepare_inputs`].
    /// * `conds` - Condition of the layer normalizations.
    fn prepare_embeddings(
        &self,
        ctx: &mut BuildContext,
        inputs: &[NodeId],
        conds: LayerNormConds,
    ) -> Result<PhaseOutput, BoxedError>;

    /// Add the block with the given index.
    fn prepare_main_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
        index: usize,
    ) -> Result<PhaseOutput, BoxedError>;

    /// Add the heads, returns the model outputs.
    fn prepare_final_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
    ) -> Result<Vec<NodeId>, BoxedError>;

    /// Mapping from layer names to checkpoint variable names.
    ///
    /// The mapping covers every layer the architecture can build, it is
    /// filtered to the layers of a built model by
    /// [`TransformerModel::variable_mapping`].
    fn variable_mapping(&self) -> VariableMapping;

    /// Transformation between a checkpoint variable and its parameter.
    fn parameter_transform(&self, variable: &str) -> ParameterTransform<'_> {
        match (variable, self.spec().keep_tokens()) {
            ("bert/embeddings/word_embeddings" | "cls/predictions/output_bias", Some(keep)) => {
                ParameterTransform::KeepRows {
                    rows: keep,
                    vocab_size: self.spec().full_vocab_size(),
                }
            }
            ("cls/seq_relationship/output_weights", _) => ParameterTransform::Transpose,
            _ => ParameterTransform::Identity,
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::{Conditioning, FinalHeads, LayerNormConds};
    use crate::graph::{CallInputs, GraphBuilder};
    use crate::layers::activation::Activation;

    #[test]
    fn nsp_implies_tanh_pooler() {
        assert_eq!(FinalHeads::default().pool(), None);
        assert_eq!(
            FinalHeads::default().with_nsp(true).pool(),
            Some(Activation::Tanh)
        );
        assert_eq!(
            FinalHeads::default()
                .with_nsp(true)
                .with_pool(Some(Activation::Linear))
                .pool(),
            Some(Activation::Linear)
        );
    }

    #[test]
    fn forcing_mlm_keeps_activation() {
        let mut heads = FinalHeads::default();
        heads.force_mlm();
        assert_eq!(heads.mlm(), Some(Activation::Softmax));

        let mut heads = FinalHeads::default().with_mlm(Some(Activation::Linear));
        heads.force_mlm();
        assert_eq!(heads.mlm(), Some(Activation::Linear));
    }

    #[test]
    fn conds_add_condition_input() {
        let mut builder = GraphBuilder::new(DType::F32, &Device::Cpu);
        let hidden = builder.input("Hidden");
        let condition = builder.input("Condition");

        let unconditional = LayerNormConds::unconditional();
        assert_eq!(unconditional.inputs(hidden), CallInputs::Single(hidden));
        assert!(unconditional.config().is_none());

        let conds = LayerNormConds::new(condition, Conditioning::new(4).hidden_units(Some(2)));
        assert_eq!(conds.inputs(hidden), CallInputs::Many(vec![hidden, condition]));
        let config = conds.config().unwrap();
        assert_eq!(config.width, 4);
        assert_eq!(config.hidden_units, Some(2));
    }
}
