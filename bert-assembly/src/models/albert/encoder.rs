use crate::architectures::{BuildContext, BuildPhases, FinalHeads, LayerNormConds, PhaseOutput};
use crate::checkpoint::VariableMapping;
use crate::error::BoxedError;
use crate::graph::NodeId;
use crate::models::bert::{
    block, block_layout_mapping, declare_inputs, embedding_mapping, embeddings, final_layers,
    head_mapping, BlockLayout, BlockNames,
};
use crate::models::{SpecError, TransformerSpec};

/// Variable prefix of the shared block in ALBERT checkpoints.
const SHARED_BLOCK_PREFIX: &str = "bert/encoder/transformer/group_0/inner_group_0/";

const ALBERT_BLOCK_LAYOUT: BlockLayout = BlockLayout {
    attention: [
        "attention_1/self/query/kernel",
        "attention_1/self/query/bias",
        "attention_1/self/key/kernel",
        "attention_1/self/key/bias",
        "attention_1/self/value/kernel",
        "attention_1/self/value/bias",
        "attention_1/output/dense/kernel",
        "attention_1/output/dense/bias",
    ],
    attention_norm: ["LayerNorm/beta", "LayerNorm/gamma"],
    feed_forward: [
        "ffn_1/intermediate/dense/kernel",
        "ffn_1/intermediate/dense/bias",
        "ffn_1/intermediate/output/dense/kernel",
        "ffn_1/intermediate/output/dense/bias",
    ],
    feed_forward_norm: ["LayerNorm_1/beta", "LayerNorm_1/gamma"],
};

/// Mapping of the embeddings and heads, with the given blocks mapped to
/// the shared block of an ALBERT checkpoint.
fn albert_mapping(blocks: impl IntoIterator<Item = BlockNames>) -> VariableMapping {
    let mut mapping = VariableMapping::default();
    embedding_mapping(&mut mapping);
    for names in blocks {
        block_layout_mapping(
            &mut mapping,
            &names,
            SHARED_BLOCK_PREFIX,
            &ALBERT_BLOCK_LAYOUT,
        );
    }
    head_mapping(&mut mapping);
    mapping
}

/// ALBERT encoder (Lan et al., 2019).
///
/// All blocks share their parameters, since every block uses the same
/// layer names.
///
/// See [ALBERT: A Lite BERT for Self-supervised Learning of Language Representations](https://arxiv.org/abs/1909.11942).
#[derive(Clone, Debug)]
pub struct Albert {
    heads: FinalHeads,
    spec: TransformerSpec,
}

impl Albert {
    pub fn new(spec: TransformerSpec, heads: FinalHeads) -> Result<Self, SpecError> {
        spec.require_max_position("ALBERT")?;
        Ok(Albert { heads, spec })
    }
}

impl BuildPhases for Albert {
    fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    fn heads(&self) -> &FinalHeads {
        &self.heads
    }

    fn heads_mut(&mut self) -> &mut FinalHeads {
        &mut self.heads
    }

    fn prepare_inputs(&self, ctx: &mut BuildContext) -> Result<Vec<NodeId>, BoxedError> {
        Ok(declare_inputs(ctx))
    }

    fn prepare_embeddings(
        &self,
        ctx: &mut BuildContext,
        inputs: &[NodeId],
        conds: LayerNormConds,
    ) -> Result<PhaseOutput, BoxedError> {
        embeddings(ctx, &self.spec, inputs, conds, true)
    }

    fn prepare_main_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
        _index: usize,
    ) -> Result<PhaseOutput, BoxedError> {
        // Blocks are identical, so they use the mask of the first block.
        block(ctx, &self.spec, previous, &BlockNames::shared(), 0)
    }

    fn prepare_final_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
    ) -> Result<Vec<NodeId>, BoxedError> {
        final_layers(ctx, &self.spec, &self.heads, previous)
    }

    fn variable_mapping(&self) -> VariableMapping {
        albert_mapping([BlockNames::shared()])
    }
}

/// ALBERT with a separate set of parameters per block.
///
/// The model is built like BERT. Every block is initialized from the
/// shared block of an ALBERT checkpoint.
#[derive(Clone, Debug)]
pub struct AlbertUnshared {
    heads: FinalHeads,
    spec: TransformerSpec,
}

impl AlbertUnshared {
    pub fn new(spec: TransformerSpec, heads: FinalHeads) -> Result<Self, SpecError> {
        spec.require_max_position("ALBERT")?;
        Ok(AlbertUnshared { heads, spec })
    }
}

impl BuildPhases for AlbertUnshared {
    fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    fn heads(&self) -> &FinalHeads {
        &self.heads
    }

    fn heads_mut(&mut self) -> &mut FinalHeads {
        &mut self.heads
    }

    fn prepare_inputs(&self, ctx: &mut BuildContext) -> Result<Vec<NodeId>, BoxedError> {
        Ok(declare_inputs(ctx))
    }

    fn prepare_embeddings(
        &self,
        ctx: &mut BuildContext,
        inputs: &[NodeId],
        conds: LayerNormConds,
    ) -> Result<PhaseOutput, BoxedError> {
        embeddings(ctx, &self.spec, inputs, conds, true)
    }

    fn prepare_main_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
        index: usize,
    ) -> Result<PhaseOutput, BoxedError> {
        block(ctx, &self.spec, previous, &BlockNames::indexed(index), index)
    }

    fn prepare_final_layers(
        &self,
        ctx: &mut BuildContext,
        previous: PhaseOutput,
    ) -> Result<Vec<NodeId>, BoxedError> {
        final_layers(ctx, &self.spec, &self.heads, previous)
    }

    fn variable_mapping(&self) -> VariableMapping {
        albert_mapping((0..self.spec.num_hidden_layers()).map(BlockNames::indexed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::{Albert, AlbertUnshared};
    use crate::architectures::{build_model, FinalHeads};
    use crate::models::tests::tiny_config;
    use crate::models::{TransformerConfig, TransformerSpec};

    fn spec(config: &TransformerConfig) -> TransformerSpec {
        TransformerSpec::new(config, None).unwrap()
    }

    #[test]
    #[report]
    fn blocks_share_layers() -> Result<(), Whatever> {
        let shallow = tiny_config();
        let deep = TransformerConfig {
            num_hidden_layers: 6,
            ..tiny_config()
        };

        let shallow_model = build_model(
            Box::new(Albert::new(spec(&shallow), FinalHeads::default()).unwrap()),
            None,
            DType::F32,
            &Device::Cpu,
        )
        .whatever_context("Cannot build model")?;
        let deep_model = build_model(
            Box::new(Albert::new(spec(&deep), FinalHeads::default()).unwrap()),
            None,
            DType::F32,
            &Device::Cpu,
        )
        .whatever_context("Cannot build model")?;

        assert_eq!(shallow_model.registry().len(), deep_model.registry().len());
        assert!(deep_model
            .layer("Transformer-MultiHeadSelfAttention")
            .is_some());
        assert!(deep_model
            .layer("Transformer-0-MultiHeadSelfAttention")
            .is_none());

        let mapping = deep_model.variable_mapping();
        assert_eq!(
            mapping.get("Transformer-FeedForward-Norm"),
            Some(
                [
                    "bert/encoder/transformer/group_0/inner_group_0/LayerNorm_1/beta".to_string(),
                    "bert/encoder/transformer/group_0/inner_group_0/LayerNorm_1/gamma".to_string()
                ]
                .as_slice()
            )
        );

        let pieces = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).whatever_context("pieces")?;
        let outputs = deep_model
            .forward_t(
                &[
                    pieces.clone(),
                    pieces.zeros_like().whatever_context("segments")?,
                ],
                false,
            )
            .whatever_context("Cannot apply model")?;
        assert_eq!(outputs[0].dims(), &[1, 3, 8]);

        Ok(())
    }

    #[test]
    #[report]
    fn unshared_blocks_map_to_shared_variables() -> Result<(), Whatever> {
        let config = tiny_config();
        let model = build_model(
            Box::new(AlbertUnshared::new(spec(&config), FinalHeads::default()).unwrap()),
            None,
            DType::F32,
            &Device::Cpu,
        )
        .whatever_context("Cannot build model")?;

        assert!(!Arc::ptr_eq(
            model.layer("Transformer-0-FeedForward").unwrap(),
            model.layer("Transformer-1-FeedForward").unwrap()
        ));

        let mapping = model.variable_mapping();
        assert!(mapping.get("Transformer-FeedForward").is_none());
        assert_eq!(
            mapping.get("Transformer-0-FeedForward"),
            mapping.get("Transformer-1-FeedForward")
        );
        assert_eq!(
            mapping.get("Transformer-1-MultiHeadSelfAttention").unwrap()[6],
            "bert/encoder/transformer/group_0/inner_group_0/attention_1/output/dense/kernel"
        );

        Ok(())
    }
}
