use snafu::{OptionExt, Snafu};

use crate::architectures::{BuildContext, BuildPhases, FinalHeads, LayerNormConds, PhaseOutput};
use crate::checkpoint::VariableMapping;
use crate::error::BoxedError;
use crate::graph::{GraphError, NodeId};
use crate::layers::activation::Activation;
use crate::layers::attention::{key_padding_mask, MultiHeadAttentionConfig};
use crate::layers::build_layer::{CallArguments, PositionBias};
use crate::layers::dense::DenseConfig;
use crate::layers::dropout::DropoutConfig;
use crate::layers::embeddings::{EmbeddingConfig, EmbeddingDenseConfig, PositionEmbeddingConfig};
use crate::layers::feedforward::FeedForwardConfig;
use crate::layers::lambda::{first_token, LambdaConfig};
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::merge::AddConfig;
use crate::models::{SpecError, TransformerSpec};

#[derive(Debug, Snafu)]
pub enum BertError {
    #[snafu(display("Embeddings require piece and segment inputs, got {got} inputs"))]
    EmbeddingInputs { got: usize },

    #[snafu(display("The MLM head requires the token embeddings"))]
    MissingTokenEmbeddings,
}

/// BERT encoder (Devlin et al., 2018).
///
/// Every block has its own parameters.
///
/// See [BERT: Pre-training of Deep Bidirectional Transformers for Language Understanding](https://arxiv.org/abs/1810.04805).
#[derive(Clone, Debug)]
pub struct Bert {
    heads: FinalHeads,
    spec: TransformerSpec,
}

impl Bert {
    /// Construct a BERT architecture.
    ///
    /// BERT uses absolute position embeddings, so the maximum number of
    /// positions must be known.
    pub fn new(spec: TransformerSpec, heads: FinalHeads) -> Result<Self, SpecError> {
        spec.require_max_position("BERT")?;
        Ok(Bert { heads, spec })
    }
}

impl BuildPhases for Bert {
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
        let mut mapping = VariableMapping::default();
        embedding_mapping(&mut mapping);
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

/// Names of the layers of a block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BlockNames {
    pub(crate) attention: String,
    pub(crate) feed_forward: String,
}

impl BlockNames {
    /// Names of a block with its own parameters.
    pub(crate) fn indexed(index: usize) -> Self {
        BlockNames {
            attention: format!("Transformer-{index}-MultiHeadSelfAttention"),
            feed_forward: format!("Transformer-{index}-FeedForward"),
        }
    }

    /// Names of a block whose parameters are shared by all blocks.
    pub(crate) fn shared() -> Self {
        BlockNames {
            attention: "Transformer-MultiHeadSelfAttention".to_string(),
            feed_forward: "Transformer-FeedForward".to_string(),
        }
    }
}

pub(crate) fn declare_inputs(ctx: &mut BuildContext) -> Vec<NodeId> {
    vec![ctx.input("Input-Token"), ctx.input("Input-Segment")]
}

fn dropout(spec: &TransformerSpec) -> DropoutConfig {
    DropoutConfig::default().p(spec.dropout_rate())
}

fn layer_norm(
    ctx: &mut BuildContext,
    input: NodeId,
    size: usize,
    conds: &LayerNormConds,
    name: &str,
) -> Result<NodeId, GraphError> {
    ctx.call(
        conds.inputs(input),
        &LayerNormConfig::default()
            .size(size)
            .condition(conds.config()),
        CallArguments::default(),
        name,
    )
}

/// Piece and segment embeddings, with optional absolute position
/// embeddings.
///
/// Also adds the key padding mask, piece `0` is padding.
pub(crate) fn embeddings(
    ctx: &mut BuildContext,
    spec: &TransformerSpec,
    inputs: &[NodeId],
    conds: LayerNormConds,
    absolute_positions: bool,
) -> Result<PhaseOutput, BoxedError> {
    let (pieces, segments) = match inputs {
        [pieces, segments, ..] => (*pieces, *segments),
        _ => return EmbeddingInputsSnafu { got: inputs.len() }.fail().map_err(Into::into),
    };
    let embedding_size = spec.embedding_size();

    let key_mask = ctx.call(
        pieces,
        &LambdaConfig::new(key_padding_mask),
        CallArguments::default(),
        "Sequence-Mask",
    )?;

    let piece_embeddings = ctx.call(
        pieces,
        &EmbeddingConfig::default()
            .input_dim(spec.vocab_size())
            .output_dim(embedding_size),
        CallArguments::default(),
        "Embedding-Token",
    )?;
    let segment_embeddings = ctx.call(
        segments,
        &EmbeddingConfig::default()
            .input_dim(spec.segment_vocab_size())
            .output_dim(embedding_size),
        CallArguments::default(),
        "Embedding-Segment",
    )?;
    let mut x = ctx.call(
        vec![piece_embeddings, segment_embeddings],
        &AddConfig,
        CallArguments::default(),
        "Embedding-Token-Segment",
    )?;

    if absolute_positions {
        x = ctx.call(
            x,
            &PositionEmbeddingConfig::default()
                .max_positions(spec.require_max_position("BERT")?)
                .width(embedding_size),
            CallArguments::default(),
            "Embedding-Position",
        )?;
    }

    x = layer_norm(ctx, x, embedding_size, &conds, "Embedding-Norm")?;
    x = ctx.call(
        x,
        &dropout(spec),
        CallArguments::default(),
        "Embedding-Dropout",
    )?;

    if embedding_size != spec.hidden_size() {
        x = ctx.call(
            x,
            &DenseConfig::default()
                .input_width(embedding_size)
                .units(spec.hidden_size()),
            CallArguments::default(),
            "Embedding-Mapping",
        )?;
    }

    Ok(PhaseOutput {
        key_mask: Some(key_mask),
        ..PhaseOutput::new(x, conds)
    })
}

/// Dropout, residual connection, and normalization after a sublayer.
fn residual(
    ctx: &mut BuildContext,
    spec: &TransformerSpec,
    input: NodeId,
    output: NodeId,
    conds: &LayerNormConds,
    name: &str,
) -> Result<NodeId, GraphError> {
    let output = ctx.call(
        output,
        &dropout(spec),
        CallArguments::default(),
        &format!("{name}-Dropout"),
    )?;
    let sum = ctx.call(
        vec![input, output],
        &AddConfig,
        CallArguments::default(),
        &format!("{name}-Add"),
    )?;
    layer_norm(ctx, sum, spec.hidden_size(), conds, &format!("{name}-Norm"))
}

/// A transformer block: self-attention followed by a pointwise
/// feed-forward layer, each with a post-norm residual connection.
///
/// * `names` - Layer names, blocks that use the same names share their
///   parameters.
/// * `mask_index` - Block index passed to the attention mask strategy.
pub(crate) fn block(
    ctx: &mut BuildContext,
    spec: &TransformerSpec,
    previous: PhaseOutput,
    names: &BlockNames,
    mask_index: usize,
) -> Result<PhaseOutput, BoxedError> {
    let attention_mask = ctx.compute_attention_mask(mask_index)?;

    let x = previous.hidden;
    let mut inputs = vec![x, x, x];
    inputs.extend(previous.key_mask);
    inputs.extend(attention_mask);
    inputs.extend(previous.position_bias);
    let arguments = CallArguments::default()
        .v_mask(previous.key_mask.is_some())
        .a_mask(attention_mask.is_some())
        .p_bias(
            previous
                .position_bias
                .map(|_| PositionBias::TypicalRelative),
        );

    let attention = ctx.call(
        inputs,
        &MultiHeadAttentionConfig::default()
            .head_size(spec.attention_head_size())
            .heads(spec.num_attention_heads())
            .hidden_width(spec.hidden_size()),
        arguments,
        &names.attention,
    )?;
    let x = residual(ctx, spec, x, attention, &previous.conds, &names.attention)?;

    let feed_forward = ctx.call(
        x,
        &FeedForwardConfig::default()
            .activation(spec.hidden_act())
            .hidden_width(spec.hidden_size())
            .intermediate_width(spec.intermediate_size()),
        CallArguments::default(),
        &names.feed_forward,
    )?;
    let x = residual(ctx, spec, x, feed_forward, &previous.conds, &names.feed_forward)?;

    Ok(previous.with_hidden(x))
}

/// Pooler, next sentence prediction, and masked language modeling heads.
pub(crate) fn final_layers(
    ctx: &mut BuildContext,
    spec: &TransformerSpec,
    heads: &FinalHeads,
    previous: PhaseOutput,
) -> Result<Vec<NodeId>, BoxedError> {
    let sequence = previous.hidden;
    let mut outputs = vec![sequence];

    if let Some(activation) = heads.pool() {
        let first = ctx.call(
            sequence,
            &LambdaConfig::new(first_token),
            CallArguments::default(),
            "Pooler",
        )?;
        let mut x = ctx.call(
            first,
            &DenseConfig::default()
                .activation(activation)
                .input_width(spec.hidden_size())
                .units(spec.hidden_size()),
            CallArguments::default(),
            "Pooler-Dense",
        )?;
        if heads.nsp() {
            x = ctx.call(
                x,
                &DenseConfig::default()
                    .activation(Activation::Softmax)
                    .input_width(spec.hidden_size())
                    .units(2),
                CallArguments::default(),
                "NSP-Proba",
            )?;
        }
        outputs.push(x);
    }

    if let Some(activation) = heads.mlm() {
        let x = ctx.call(
            sequence,
            &DenseConfig::default()
                .activation(spec.hidden_act())
                .input_width(spec.hidden_size())
                .units(spec.embedding_size()),
            CallArguments::default(),
            "MLM-Dense",
        )?;
        let x = layer_norm(ctx, x, spec.embedding_size(), &previous.conds, "MLM-Norm")?;
        let embeddings = ctx
            .parameter("Embedding-Token.embeddings")
            .context(MissingTokenEmbeddingsSnafu)?;
        let x = ctx.call(
            x,
            &EmbeddingDenseConfig::new(embeddings).activation(activation),
            CallArguments::default(),
            "MLM-Proba",
        )?;
        outputs.push(x);
    }

    Ok(select_outputs(outputs))
}

/// Select the model outputs from `[sequence, pooled?, mlm?]`.
///
/// The sequence output is only returned when there are no heads.
fn select_outputs(mut outputs: Vec<NodeId>) -> Vec<NodeId> {
    if outputs.len() > 1 {
        outputs.remove(0);
    }
    outputs
}

fn variable_names(prefix: &str, names: &[&str]) -> Vec<String> {
    names.iter().map(|name| format!("{prefix}{name}")).collect()
}

pub(crate) fn embedding_mapping(mapping: &mut VariableMapping) {
    mapping.insert(
        "Embedding-Token",
        variable_names("bert/embeddings/", &["word_embeddings"]),
    );
    mapping.insert(
        "Embedding-Segment",
        variable_names("bert/embeddings/", &["token_type_embeddings"]),
    );
    mapping.insert(
        "Embedding-Position",
        variable_names("bert/embeddings/", &["position_embeddings"]),
    );
    mapping.insert(
        "Embedding-Norm",
        variable_names("bert/embeddings/LayerNorm/", &["beta", "gamma"]),
    );
    mapping.insert(
        "Embedding-Mapping",
        variable_names(
            "bert/encoder/embedding_hidden_mapping_in/",
            &["kernel", "bias"],
        ),
    );
}

/// Checkpoint layout of a block.
pub(crate) struct BlockLayout {
    pub(crate) attention: [&'static str; 8],
    pub(crate) attention_norm: [&'static str; 2],
    pub(crate) feed_forward: [&'static str; 4],
    pub(crate) feed_forward_norm: [&'static str; 2],
}

pub(crate) const BERT_BLOCK_LAYOUT: BlockLayout = BlockLayout {
    attention: [
        "attention/self/query/kernel",
        "attention/self/query/bias",
        "attention/self/key/kernel",
        "attention/self/key/bias",
        "attention/self/value/kernel",
        "attention/self/value/bias",
        "attention/output/dense/kernel",
        "attention/output/dense/bias",
    ],
    attention_norm: [
        "attention/output/LayerNorm/beta",
        "attention/output/LayerNorm/gamma",
    ],
    feed_forward: [
        "intermediate/dense/kernel",
        "intermediate/dense/bias",
        "output/dense/kernel",
        "output/dense/bias",
    ],
    feed_forward_norm: ["output/LayerNorm/beta", "output/LayerNorm/gamma"],
};

/// Map the layers of a block to variables with the given prefix.
pub(crate) fn block_layout_mapping(
    mapping: &mut VariableMapping,
    names: &BlockNames,
    prefix: &str,
    layout: &BlockLayout,
) {
    mapping.insert(
        names.attention.as_str(),
        variable_names(prefix, &layout.attention),
    );
    mapping.insert(
        format!("{}-Norm", names.attention),
        variable_names(prefix, &layout.attention_norm),
    );
    mapping.insert(
        names.feed_forward.as_str(),
        variable_names(prefix, &layout.feed_forward),
    );
    mapping.insert(
        format!("{}-Norm", names.feed_forward),
        variable_names(prefix, &layout.feed_forward_norm),
    );
}

pub(crate) fn block_mapping(mapping: &mut VariableMapping, names: &BlockNames, prefix: &str) {
    block_layout_mapping(mapping, names, prefix, &BERT_BLOCK_LAYOUT)
}

pub(crate) fn head_mapping(mapping: &mut VariableMapping) {
    mapping.insert(
        "Pooler-Dense",
        variable_names("bert/pooler/dense/", &["kernel", "bias"]),
    );
    mapping.insert(
        "NSP-Proba",
        variable_names("cls/seq_relationship/", &["output_weights", "output_bias"]),
    );
    mapping.insert(
        "MLM-Dense",
        variable_names("cls/predictions/transform/dense/", &["kernel", "bias"]),
    );
    mapping.insert(
        "MLM-Norm",
        variable_names("cls/predictions/transform/LayerNorm/", &["beta", "gamma"]),
    );
    mapping.insert(
        "MLM-Proba",
        variable_names("cls/predictions/", &["output_bias"]),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device, IndexOp, Tensor};
    use ndarray::ArrayD;
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::{select_outputs, Bert};
    use crate::architectures::{build_model, Conditioning, FinalHeads};
    use crate::graph::GraphBuilder;
    use crate::layers::activation::Activation;
    use crate::models::tests::tiny_config;
    use crate::models::{SpecError, TransformerConfig, TransformerSpec};
    use crate::util::tests::{assert_tensor_eq, IntoArrayD};

    fn tiny_bert(config: &TransformerConfig, heads: FinalHeads) -> Result<Bert, Whatever> {
        let spec = TransformerSpec::new(config, None).whatever_context("Invalid config")?;
        Bert::new(spec, heads).whatever_context("Cannot construct BERT")
    }

    fn segments(pieces: &Tensor) -> Result<Tensor, Whatever> {
        pieces.zeros_like().whatever_context("Cannot create segments")
    }

    #[test]
    #[report]
    fn blocks_have_their_own_layers() -> Result<(), Whatever> {
        let config = tiny_config();
        let bert = tiny_bert(&config, FinalHeads::default())?;
        let model = build_model(Box::new(bert), None, DType::F32, &Device::Cpu)
            .whatever_context("Cannot build model")?;

        assert_eq!(model.input_names(), &["Input-Token", "Input-Segment"]);
        let first = model.layer("Transformer-0-MultiHeadSelfAttention").unwrap();
        let second = model.layer("Transformer-1-MultiHeadSelfAttention").unwrap();
        assert!(!Arc::ptr_eq(first, second));
        assert!(model.layer("Transformer-1-FeedForward-Norm").is_some());
        assert!(model.layer("Embedding-Mapping").is_none());

        // Zero dropout builds no dropout layers.
        assert!(model.layer("Embedding-Dropout").is_some());
        let no_dropout = tiny_bert(
            &TransformerConfig {
                hidden_dropout_prob: 0.0,
                ..config
            },
            FinalHeads::default(),
        )?;
        let model = build_model(Box::new(no_dropout), None, DType::F32, &Device::Cpu)
            .whatever_context("Cannot build model")?;
        assert!(model.layer("Embedding-Dropout").is_none());

        Ok(())
    }

    #[test]
    #[report]
    fn embedding_mapping_when_sizes_differ() -> Result<(), Whatever> {
        let config = TransformerConfig {
            embedding_size: Some(4),
            ..tiny_config()
        };
        let bert = tiny_bert(&config, FinalHeads::default())?;
        let model = build_model(Box::new(bert), None, DType::F32, &Device::Cpu)
            .whatever_context("Cannot build model")?;
        assert!(model.layer("Embedding-Mapping").is_some());
        assert_eq!(
            model
                .parameter("Embedding-Token.embeddings")
                .unwrap()
                .dims(),
            &[config.vocab_size, 4]
        );

        let pieces = Tensor::new(&[[2u32, 3, 4]], &Device::Cpu).whatever_context("pieces")?;
        let outputs = model
            .forward_t(&[pieces.clone(), segments(&pieces)?], false)
            .whatever_context("Cannot apply model")?;
        assert_eq!(outputs[0].dims(), &[1, 3, config.hidden_size]);

        Ok(())
    }

    #[rstest]
    #[case(FinalHeads::default(), vec![vec![2, 5, 8]])]
    #[case(FinalHeads::default().with_pool(Some(Activation::Tanh)), vec![vec![2, 8]])]
    #[case(FinalHeads::default().with_nsp(true), vec![vec![2, 2]])]
    #[case(FinalHeads::default().with_mlm(Some(Activation::Softmax)), vec![vec![2, 5, 20]])]
    #[case(
        FinalHeads::default().with_nsp(true).with_mlm(Some(Activation::Softmax)),
        vec![vec![2, 2], vec![2, 5, 20]]
    )]
    fn output_arity(#[case] heads: FinalHeads, #[case] shapes: Vec<Vec<usize>>) {
        let bert = tiny_bert(&tiny_config(), heads).unwrap();
        let model = build_model(Box::new(bert), None, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.n_outputs(), shapes.len());

        let pieces = Tensor::new(&[[1u32, 2, 3, 4, 5], [6, 7, 8, 0, 0]], &Device::Cpu).unwrap();
        let outputs = model
            .forward_t(&[pieces.clone(), pieces.zeros_like().unwrap()], false)
            .unwrap();
        assert_eq!(
            outputs
                .iter()
                .map(|output| output.dims().to_vec())
                .collect::<Vec<_>>(),
            shapes
        );
    }

    #[test]
    fn sequence_output_is_dropped_with_heads() {
        let mut builder = GraphBuilder::new(DType::F32, &Device::Cpu);
        let nodes = (0..3)
            .map(|index| builder.input(format!("{index}")))
            .collect::<Vec<_>>();
        assert_eq!(select_outputs(nodes[..1].to_vec()), nodes[..1].to_vec());
        assert_eq!(select_outputs(nodes[..2].to_vec()), nodes[1..2].to_vec());
        assert_eq!(select_outputs(nodes.clone()), nodes[1..].to_vec());
    }

    #[test]
    #[report]
    fn padding_does_not_change_outputs() -> Result<(), Whatever> {
        let bert = tiny_bert(&tiny_config(), FinalHeads::default())?;
        let model = build_model(Box::new(bert), None, DType::F32, &Device::Cpu)
            .whatever_context("Cannot build model")?;

        let pieces = Tensor::new(&[[5u32, 9, 2]], &Device::Cpu).whatever_context("pieces")?;
        let padded = Tensor::new(&[[5u32, 9, 2, 0, 0]], &Device::Cpu).whatever_context("pieces")?;
        let output = model
            .forward_t(&[pieces.clone(), segments(&pieces)?], false)
            .whatever_context("Cannot apply model")?;
        let padded_output = model
            .forward_t(&[padded.clone(), segments(&padded)?], false)
            .whatever_context("Cannot apply model")?;

        let expected: ArrayD<f32> = (&output[0])
            .into_arrayd()
            .whatever_context("Cannot convert output")?;
        assert_tensor_eq!(
            padded_output[0]
                .i((.., ..3, ..))
                .whatever_context("Cannot slice output")?,
            expected,
            epsilon = 1e-5f32
        );

        Ok(())
    }

    #[test]
    #[report]
    fn conditional_layer_norms_add_input() -> Result<(), Whatever> {
        let bert = tiny_bert(&tiny_config(), FinalHeads::default())?;
        let model = build_model(
            Box::new(bert),
            Some(Conditioning::new(3).hidden_units(Some(4))),
            DType::F32,
            &Device::Cpu,
        )
        .whatever_context("Cannot build model")?;
        assert_eq!(
            model.input_names(),
            &["Input-Token", "Input-Segment", "Input-Condition"]
        );
        assert!(model
            .parameter("Transformer-1-FeedForward-Norm.hidden_dense.kernel")
            .is_some());

        let pieces = Tensor::new(&[[5u32, 9, 2]], &Device::Cpu).whatever_context("pieces")?;
        let condition = Tensor::ones((1, 3), DType::F32, &Device::Cpu).whatever_context("cond")?;
        let outputs = model
            .forward_t(&[pieces.clone(), segments(&pieces)?, condition], false)
            .whatever_context("Cannot apply model")?;
        assert_eq!(outputs[0].dims(), &[1, 3, 8]);

        Ok(())
    }

    #[test]
    fn bert_requires_max_positions() {
        let config = TransformerConfig {
            max_position_embeddings: None,
            ..tiny_config()
        };
        let spec = TransformerSpec::new(&config, None).unwrap();
        assert!(matches!(
            Bert::new(spec, FinalHeads::default()),
            Err(SpecError::MissingMaxPositions { .. })
        ));
    }
}
