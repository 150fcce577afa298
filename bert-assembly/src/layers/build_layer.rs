use std::fmt::Debug;
use std::ops::RangeInclusive;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ensure, Snafu};

use crate::error::BoxedError;

/// Position bias flavors understood by attention layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PositionBias {
    /// Relative position embeddings that are added to the attention scores
    /// and to the attention values (Shaw et al., 2018). Used by NEZHA.
    TypicalRelative,
}

/// Call-time arguments of a layer invocation.
///
/// These arguments describe how the positional inputs of a call should be
/// interpreted. They do not change the construction of a layer, so the same
/// layer instance can be invoked with different arguments.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallArguments {
    v_mask: bool,
    a_mask: bool,
    p_bias: Option<PositionBias>,
}

impl CallArguments {
    /// A key padding mask follows the query, key, and value inputs.
    ///
    /// Default: `false`
    pub fn v_mask(mut self, v_mask: bool) -> Self {
        self.v_mask = v_mask;
        self
    }

    /// An attention mask follows the query, key, value, and padding mask
    /// inputs.
    ///
    /// Default: `false`
    pub fn a_mask(mut self, a_mask: bool) -> Self {
        self.a_mask = a_mask;
        self
    }

    /// Position bias, its input is the last input of the call.
    ///
    /// Default: `None`
    pub fn p_bias(mut self, p_bias: Option<PositionBias>) -> Self {
        self.p_bias = p_bias;
        self
    }

    pub fn has_v_mask(&self) -> bool {
        self.v_mask
    }

    pub fn has_a_mask(&self) -> bool {
        self.a_mask
    }

    pub fn position_bias(&self) -> Option<PositionBias> {
        self.p_bias
    }
}

/// A layer instance.
///
/// Layers are constructed once per name and can be invoked any number of
/// times. Trainable parameters live in the `VarMap` of the model and are
/// identified by their full names.
pub trait Layer: Debug + Send + Sync {
    /// Name under which the layer was registered.
    fn name(&self) -> &str;

    /// Apply the layer.
    ///
    /// * `inputs` - Positional inputs of the call.
    /// * `arguments` - Call-time arguments.
    /// * `train` - Whether the layer is applied in training mode.
    fn forward_t(
        &self,
        inputs: &[Tensor],
        arguments: &CallArguments,
        train: bool,
    ) -> Result<Tensor, BoxedError>;

    /// Full names of the trainable parameters of this layer.
    ///
    /// The order is fixed and documented per layer kind, checkpoint
    /// mappings rely on it.
    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Layer configurations that can build layers.
pub trait BuildLayer: Debug {
    /// Build a layer.
    ///
    /// * `name` - Name of the layer.
    /// * `vb` - Variable builder, scoped to the layer name.
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError>;

    /// Whether calls of this layer kind pass their input through unchanged.
    ///
    /// No layer is constructed for such calls.
    fn passthrough(&self) -> bool {
        false
    }
}

/// Full name of a layer parameter.
pub(crate) fn parameter_name(layer: &str, parameter: &str) -> String {
    format!("{layer}.{parameter}")
}

#[derive(Debug, Snafu)]
#[snafu(display("Layer '{name}' expects {expected:?} inputs, got {got}"))]
pub struct InputArityError {
    name: String,
    expected: RangeInclusive<usize>,
    got: usize,
}

/// Check that a layer was called with an acceptable number of inputs.
pub(crate) fn check_arity(
    name: &str,
    inputs: &[Tensor],
    expected: RangeInclusive<usize>,
) -> Result<(), InputArityError> {
    ensure!(
        expected.contains(&inputs.len()),
        InputAritySnafu {
            name,
            expected,
            got: inputs.len(),
        }
    );
    Ok(())
}
