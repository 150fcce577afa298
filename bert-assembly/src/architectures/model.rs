use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildContext, BuildPhases, Conditioning, LayerNormConds};
use crate::checkpoint::{ParameterTransform, VariableMapping};
use crate::error::BoxedError;
use crate::graph::{Graph, GraphBuilder, GraphError, LayerRegistry, NodeId};
use crate::layers::build_layer::Layer;
use crate::models::TransformerSpec;

#[derive(Debug, Snafu)]
pub enum BuildModelError {
    #[snafu(display("Cannot prepare embeddings"))]
    Embeddings { source: BoxedError },

    #[snafu(display("Cannot prepare final layers"))]
    FinalLayers { source: BoxedError },

    #[snafu(display("Cannot prepare inputs"))]
    Inputs { source: BoxedError },

    #[snafu(display("Cannot prepare main layers of block {index}"))]
    MainLayers { index: usize, source: BoxedError },
}

/// Build a model by running the phases of an architecture.
///
/// * `phases` - Architecture of the model.
/// * `conditioning` - Condition the layer normalizations on an additional
///   model input (`Input-Condition`).
/// * `dtype` - Data type of the parameters.
/// * `device` - Device to allocate the parameters on.
pub fn build_model(
    phases: Box<dyn BuildPhases>,
    conditioning: Option<Conditioning>,
    dtype: DType,
    device: &Device,
) -> Result<TransformerModel, BuildModelError> {
    let mut builder = GraphBuilder::new(dtype, device);
    let mut attention_mask = phases.attention_mask();
    let mut ctx = BuildContext::new(&mut builder, attention_mask.as_mut());

    let inputs = phases.prepare_inputs(&mut ctx).context(InputsSnafu)?;
    let conds = match conditioning {
        Some(conditioning) => {
            LayerNormConds::new(ctx.input("Input-Condition"), conditioning)
        }
        None => LayerNormConds::unconditional(),
    };

    let mut output = phases
        .prepare_embeddings(&mut ctx, &inputs, conds)
        .context(EmbeddingsSnafu)?;
    for index in 0..phases.spec().num_hidden_layers() {
        output = phases
            .prepare_main_layers(&mut ctx, output, index)
            .context(MainLayersSnafu { index })?;
    }
    let outputs = phases
        .prepare_final_layers(&mut ctx, output)
        .context(FinalLayersSnafu)?;

    let (graph, registry, var_map) = builder.finish();
    tracing::info!(
        layers = registry.len(),
        parameters = var_map.all_vars().len(),
        inputs = graph.input_names().len(),
        outputs = outputs.len(),
        "built model"
    );

    Ok(TransformerModel {
        device: device.clone(),
        graph,
        outputs,
        phases,
        registry,
        var_map,
    })
}

/// A built transformer model.
///
/// The layer graph of a model is fixed, only the parameter values can
/// change (see [`TransformerModel::load_weights_from_checkpoint`]).
pub struct TransformerModel {
    device: Device,
    graph: Graph,
    outputs: Vec<NodeId>,
    phases: Box<dyn BuildPhases>,
    registry: LayerRegistry,
    var_map: VarMap,
}

impl fmt::Debug for TransformerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters = match self.var_map.data().lock() {
            Ok(data) => data
                .iter()
                .map(|(name, var)| (name.clone(), var.dims().to_vec()))
                .collect::<BTreeMap<_, _>>(),
            Err(_) => BTreeMap::new(),
        };
        f.debug_struct("TransformerModel")
            .field("device", &self.device)
            .field("graph", &self.graph)
            .field("outputs", &self.outputs)
            .field("phases", &self.phases)
            .field("registry", &self.registry)
            .field("parameters", &parameters)
            .finish()
    }
}

impl TransformerModel {
    /// Apply the model.
    ///
    /// * `inputs` - Model inputs, in the order of
    ///   [`TransformerModel::input_names`]. Piece and segment identifiers
    ///   have shape `(batch_size, seq_len)`, the condition has shape
    ///   `(batch_size, width)`.
    /// * `train` - Whether to apply the model in training mode.
    pub fn forward_t(&self, inputs: &[Tensor], train: bool) -> Result<Vec<Tensor>, GraphError> {
        self.graph.forward_t(inputs, &self.outputs, train)
    }

    /// Names of the model inputs.
    pub fn input_names(&self) -> &[String] {
        self.graph.input_names()
    }

    /// Number of model outputs.
    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Get a layer by name.
    pub fn layer(&self, name: &str) -> Option<&Arc<dyn Layer>> {
        self.registry.get(name)
    }

    /// Layers of the model.
    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// Hyperparameters of the model.
    pub fn spec(&self) -> &TransformerSpec {
        self.phases.spec()
    }

    /// Get a parameter by its full name.
    pub fn parameter(&self, name: &str) -> Option<Var> {
        self.var_map.data().lock().ok()?.get(name).cloned()
    }

    /// Mapping from the layers of this model to checkpoint variables.
    pub fn variable_mapping(&self) -> VariableMapping {
        let mut mapping = self.phases.variable_mapping();
        mapping.retain(|layer| self.registry.contains(layer));
        mapping
    }

    pub(crate) fn parameter_transform(&self, variable: &str) -> ParameterTransform<'_> {
        self.phases.parameter_transform(variable)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use crate::models::tests::tiny_config;
    use crate::models::{build_transformer_model, BuildOptions};

    #[test]
    fn debug_lists_parameter_shapes() {
        let model =
            build_transformer_model(&tiny_config(), None, BuildOptions::default(), &Device::Cpu)
                .unwrap();
        let debug = format!("{model:?}");
        assert!(debug.starts_with("TransformerModel"));
        assert!(debug.contains("\"Embedding-Token.embeddings\": [20, 8]"));
    }
}
