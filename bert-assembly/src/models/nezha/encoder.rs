use crate::architectures::{BuildContext, BuildPhases, FinalHeads, LayerNormConds, PhaseOutput};
use crate::checkpoint::VariableMapping;
use crate::error::BoxedError;
use crate::graph::NodeId;
use crate::layers::build_layer::CallArguments;
use crate::layers::embeddings::RelativePositionEmbeddingConfig;
use crate::models::bert::{
    block, block_mapping, declare_inputs, embedding_mapping, embeddings, final_layers,
    head_mapping, BlockNames,
};
use crate::models::TransformerSpec;

/// Relative distances are clipped to `[-64, 64]`.
const MAX_RELATIVE_DISTANCE: usize = 64;

/// NEZHA encoder (Wei et al., 2019).
///
/// NEZHA replaces the absolute position embeddings of BERT by fixed
/// sinusoidal relative position embeddings in every attention layer.
///
/// See [NEZHA: Neural Contextualized Representation for Chinese Language Understanding](https://arxiv.org/abs/1909.00204).
#[derive(Clone, Debug)]
pub struct Nezha {
    heads: FinalHeads,
    spec: TransformerSpec,
}

impl Nezha {
    pub fn new(spec: TransformerSpec, heads: FinalHeads) -> Self {
        Nezha { heads, spec }
    }
}

impl BuildPhases for Nezha {
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
        let mut output = embeddings(ctx, &self.spec, inputs, conds, false)?;

        // Shared by the attention layers of all blocks.
        let x = output.hidden;
        output.position_bias = Some(ctx.call(
            vec![x, x],
            &RelativePositionEmbeddingConfig::default()
                .max_distance(MAX_RELATIVE_DISTANCE)
                .width(self.spec.attention_head_size()),
            CallArguments::default(),
            "Embedding-Relative-Position",
        )?);

        Ok(output)
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
        let mut mapping = VariableMapping::default();
        embedding_mapping(&mut mapping);
        mapping.retain(|layer| layer != "Embedding-Position");
        for index in 0..self.spec.num_hidden_layers() {
            block_mapping(
                &mut mapping,
                &BlockNames::indexed(index),
                &format!("bert/encoder/layer_{index}/"),
            );
        }
        head_mapping(&mut mapping);
        mapping
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::Nezha;
    use crate::architectures::{build_model, FinalHeads};
    use crate::layers::activation::Activation;
    use crate::models::tests::tiny_config;
    use crate::models::{TransformerConfig, TransformerSpec};

    #[test]
    #[report]
    fn relative_positions_replace_absolute_positions() -> Result<(), Whatever> {
        // NEZHA does not need a maximum number of positions.
        let config = TransformerConfig {
            max_position_embeddings: None,
            ..tiny_config()
        };
        let spec = TransformerSpec::new(&config, None).whatever_context("Invalid config")?;
        let nezha = Nezha::new(spec, FinalHeads::default().with_mlm(Some(Activation::Softmax)));
        let model = build_model(Box::new(nezha), None, DType::F32, &Device::Cpu)
            .whatever_context("Cannot build model")?;

        assert!(model.layer("Embedding-Position").is_none());
        assert!(model.layer("Embedding-Relative-Position").is_some());
        // Built once with the embeddings, before the first block.
        let names = model.registry().names().collect::<Vec<_>>();
        let position = |layer: &str| names.iter().position(|name| *name == layer);
        assert_eq!(
            names
                .iter()
                .filter(|name| **name == "Embedding-Relative-Position")
                .count(),
            1
        );
        assert!(
            position("Embedding-Relative-Position")
                < position("Transformer-0-MultiHeadSelfAttention")
        );
        // The relative position table is not trainable.
        assert!(model
            .layer("Embedding-Relative-Position")
            .unwrap()
            .parameter_names()
            .is_empty());
        assert!(model.variable_mapping().get("Embedding-Position").is_none());
        assert!(model
            .variable_mapping()
            .get("Transformer-1-MultiHeadSelfAttention")
            .is_some());

        // Longer than any absolute position table of the configuration.
        let pieces = Tensor::arange(1u32, 19, &Device::Cpu)
            .and_then(|pieces| pieces.reshape((1, 18)))
            .whatever_context("Cannot create pieces")?;
        let outputs = model
            .forward_t(
                &[
                    pieces.clone(),
                    pieces.zeros_like().whatever_context("segments")?,
                ],
                false,
            )
            .whatever_context("Cannot apply model")?;
        assert_eq!(outputs[0].dims(), &[1, 18, config.vocab_size]);

        Ok(())
    }
}
