/// Name-addressed layer graphs.
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_layer::{BuildLayer, CallArguments, Layer};

mod registry;
pub use registry::{LayerRegistry, RegistryError};

#[derive(Debug, Snafu)]
pub enum GraphError {
    #[snafu(display("Cannot build layer '{name}'"))]
    BuildLayer { name: String, source: BoxedError },

    #[snafu(display("Cannot register layer '{name}'"))]
    Register { name: String, source: RegistryError },

    #[snafu(display("Layer '{name}' is a passthrough and takes a single input, got {got}"))]
    Passthrough { name: String, got: usize },

    #[snafu(display("Graph expects {expected} inputs, got {got}"))]
    InputCount { expected: usize, got: usize },

    #[snafu(display("Cannot apply layer '{name}'"))]
    Forward { name: String, source: BoxedError },

    #[snafu(display("Node {index} does not exist in the graph"))]
    UnknownNode { index: usize },
}

/// Identifier of a node in the graph.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Inputs of a layer call: a single node or a list of nodes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallInputs {
    Single(NodeId),
    Many(Vec<NodeId>),
}

impl CallInputs {
    pub fn nodes(&self) -> &[NodeId] {
        match self {
            CallInputs::Single(node) => std::slice::from_ref(node),
            CallInputs::Many(nodes) => nodes,
        }
    }
}

impl From<NodeId> for CallInputs {
    fn from(node: NodeId) -> Self {
        CallInputs::Single(node)
    }
}

impl From<Vec<NodeId>> for CallInputs {
    fn from(nodes: Vec<NodeId>) -> Self {
        CallInputs::Many(nodes)
    }
}

/// Drop absent entries, a list with one remaining entry collapses to
/// that entry.
pub fn simplify(inputs: impl IntoIterator<Item = Option<NodeId>>) -> CallInputs {
    let mut nodes = inputs.into_iter().flatten().collect::<Vec<_>>();
    if nodes.len() == 1 {
        CallInputs::Single(nodes.remove(0))
    } else {
        CallInputs::Many(nodes)
    }
}

#[derive(Debug)]
enum Node {
    Input {
        index: usize,
    },
    Call {
        layer: Arc<dyn Layer>,
        inputs: Vec<NodeId>,
        arguments: CallArguments,
    },
}

/// Append-only graph of declared inputs and layer invocations.
///
/// Nodes are evaluated in construction order, which is a topological
/// order since a call can only refer to earlier nodes.
#[derive(Debug, Default)]
pub struct Graph {
    input_names: Vec<String>,
    nodes: Vec<Node>,
}

impl Graph {
    /// Names of the declared inputs, in order.
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Evaluate the graph.
    ///
    /// * `inputs` - Tensors for the declared inputs, in declaration order.
    /// * `outputs` - Nodes to return.
    /// * `train` - Whether to evaluate in training mode.
    pub fn forward_t(
        &self,
        inputs: &[Tensor],
        outputs: &[NodeId],
        train: bool,
    ) -> Result<Vec<Tensor>, GraphError> {
        ensure!(
            inputs.len() == self.input_names.len(),
            InputCountSnafu {
                expected: self.input_names.len(),
                got: inputs.len()
            }
        );

        let last_needed = outputs.iter().map(|node| node.0).max();
        let mut values: Vec<Tensor> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.iter().take(last_needed.map_or(0, |last| last + 1)) {
            let value = match node {
                Node::Input { index } => inputs[*index].clone(),
                Node::Call {
                    layer,
                    inputs,
                    arguments,
                } => {
                    let layer_inputs = inputs
                        .iter()
                        .map(|node| values[node.0].clone())
                        .collect::<Vec<_>>();
                    layer
                        .forward_t(&layer_inputs, arguments, train)
                        .context(ForwardSnafu { name: layer.name() })?
                }
            };
            values.push(value);
        }

        outputs
            .iter()
            .map(|node| {
                values
                    .get(node.0)
                    .cloned()
                    .context(UnknownNodeSnafu { index: node.0 })
            })
            .collect()
    }
}

/// Graph under construction.
///
/// Layers are built lazily on their first call and registered by name.
/// Their parameters are stored in the builder's `VarMap` under
/// `<layer name>.<parameter>`.
pub struct GraphBuilder {
    device: Device,
    dtype: DType,
    graph: Graph,
    registry: LayerRegistry,
    var_map: VarMap,
}

impl GraphBuilder {
    /// Construct an empty graph builder.
    ///
    /// * `dtype` - Data type of the parameters.
    /// * `device` - Device on which parameters are allocated.
    pub fn new(dtype: DType, device: &Device) -> Self {
        GraphBuilder {
            device: device.clone(),
            dtype,
            graph: Graph::default(),
            registry: LayerRegistry::default(),
            var_map: VarMap::new(),
        }
    }

    /// Declare a graph input.
    pub fn input(&mut self, name: impl Into<String>) -> NodeId {
        let index = self.graph.input_names.len();
        self.graph.input_names.push(name.into());
        self.push(Node::Input { index })
    }

    /// Invoke the layer with the given name.
    ///
    /// If a layer with this name was built before, the existing instance is
    /// invoked. Otherwise a layer is built from `config`, registered, and
    /// invoked. Passthrough configurations return their single input
    /// without constructing a layer.
    ///
    /// * `inputs` - Input node(s) of the call.
    /// * `config` - Configuration to build the layer from.
    /// * `arguments` - Call-time arguments.
    /// * `name` - Name of the layer.
    pub fn call(
        &mut self,
        inputs: impl Into<CallInputs>,
        config: &dyn BuildLayer,
        arguments: CallArguments,
        name: &str,
    ) -> Result<NodeId, GraphError> {
        let inputs = inputs.into();
        for node in inputs.nodes() {
            ensure!(
                node.0 < self.graph.nodes.len(),
                UnknownNodeSnafu { index: node.0 }
            );
        }

        if config.passthrough() {
            return match inputs.nodes() {
                [node] => Ok(*node),
                nodes => PassthroughSnafu {
                    name,
                    got: nodes.len(),
                }
                .fail(),
            };
        }

        let layer = match self
            .registry
            .lookup(name, config)
            .context(RegisterSnafu { name })?
        {
            Some(layer) => {
                tracing::debug!(layer = name, "reusing layer");
                layer
            }
            None => {
                let vb = VarBuilder::from_varmap(&self.var_map, self.dtype, &self.device);
                let layer: Arc<dyn Layer> = config
                    .build(name, vb.pp(name))
                    .context(BuildLayerSnafu { name })?
                    .into();
                tracing::debug!(
                    layer = name,
                    parameters = layer.parameter_names().len(),
                    "built layer"
                );
                self.registry.register(layer.clone(), config);
                layer
            }
        };

        Ok(self.push(Node::Call {
            layer,
            inputs: inputs.nodes().to_vec(),
            arguments,
        }))
    }

    /// Current value of a parameter.
    ///
    /// The returned tensor shares storage with the parameter.
    pub fn parameter(&self, name: &str) -> Option<Tensor> {
        self.var_map
            .data()
            .lock()
            .ok()?
            .get(name)
            .map(|var| var.as_tensor().clone())
    }

    /// The layer registry.
    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// Finish construction.
    pub fn finish(self) -> (Graph, LayerRegistry, VarMap) {
        (self.graph, self.registry, self.var_map)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.graph.nodes.push(node);
        NodeId(self.graph.nodes.len() - 1)
    }
}
