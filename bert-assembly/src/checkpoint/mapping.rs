use std::collections::HashMap;

use candle_core::{Tensor, Var};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::architectures::TransformerModel;
use crate::checkpoint::{CheckpointReader, CheckpointWriter};
use crate::error::BoxedError;

#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot assign parameter '{parameter}'"))]
    Assign {
        parameter: String,
        source: candle_core::Error,
    },

    #[snafu(display("Model has no layer '{layer}'"))]
    LayerNotFound { layer: String },

    #[snafu(display("Cannot load variable '{name}'"))]
    LoadVariable { name: String, source: BoxedError },

    #[snafu(display("Layer '{layer}' has no parameter '{parameter}'"))]
    ParameterNotFound { layer: String, parameter: String },

    #[snafu(display(
        "Variable '{name}' of layer '{layer}' has shape {got:?}, parameter has shape {expected:?}"
    ))]
    ShapeMismatch {
        layer: String,
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[snafu(display(
        "Layer '{layer}' has {parameters} parameters, but {names} variables are mapped to it"
    ))]
    TooManyNames {
        layer: String,
        names: usize,
        parameters: usize,
    },

    #[snafu(display("Cannot transform variable '{name}'"))]
    Transform {
        name: String,
        source: candle_core::Error,
    },

    #[snafu(display("Checkpoint does not contain variable '{name}' of layer '{layer}'"))]
    VariableNotFound { layer: String, name: String },

    #[snafu(display("Cannot write checkpoint"))]
    Write { source: BoxedError },
}

/// A checkpoint variable paired with the parameter it maps to.
struct MappedVariable {
    name: String,
    layer: String,
    parameter: String,
    var: Var,
}

impl TransformerModel {
    /// Pair the mapped checkpoint variables with their parameters.
    fn mapped_variables(&self) -> Result<Vec<MappedVariable>, CheckpointError> {
        let mut mapped = Vec::new();
        for (layer_name, names) in self.variable_mapping().iter() {
            let layer = self
                .layer(layer_name)
                .context(LayerNotFoundSnafu { layer: layer_name })?;
            let parameters = layer.parameter_names();
            ensure!(
                names.len() <= parameters.len(),
                TooManyNamesSnafu {
                    layer: layer_name,
                    names: names.len(),
                    parameters: parameters.len(),
                }
            );

            // Remaining parameters are not stored in checkpoints.
            for (name, parameter) in names.iter().zip(parameters) {
                let var = self.parameter(&parameter).context(ParameterNotFoundSnafu {
                    layer: layer_name,
                    parameter: &parameter,
                })?;
                mapped.push(MappedVariable {
                    name: name.clone(),
                    layer: layer_name.to_string(),
                    parameter,
                    var,
                });
            }
        }

        Ok(mapped)
    }

    /// Load parameters from a checkpoint.
    ///
    /// All mapped variables are read and validated before any parameter is
    /// updated, so the parameters are left unchanged when loading fails.
    /// Parameters without a mapped variable keep their values.
    pub fn load_weights_from_checkpoint(
        &self,
        checkpoint: &dyn CheckpointReader,
    ) -> Result<(), CheckpointError> {
        let mapped = self.mapped_variables()?;

        let mut values = Vec::with_capacity(mapped.len());
        for variable in &mapped {
            let MappedVariable {
                name, layer, var, ..
            } = variable;
            ensure!(
                checkpoint.contains_variable(name),
                VariableNotFoundSnafu { layer, name }
            );
            let value = checkpoint
                .load_variable(name, self.device())
                .context(LoadVariableSnafu { name })?;
            let value = self
                .parameter_transform(name)
                .load(value)
                .and_then(|value| value.to_dtype(var.dtype()))
                .context(TransformSnafu { name })?;
            ensure!(
                value.dims() == var.dims(),
                ShapeMismatchSnafu {
                    layer,
                    name,
                    expected: var.dims().to_vec(),
                    got: value.dims().to_vec(),
                }
            );
            values.push(value);
        }

        for (variable, value) in mapped.iter().zip(&values) {
            variable.var.set(value).context(AssignSnafu {
                parameter: &variable.parameter,
            })?;
        }

        tracing::info!(variables = values.len(), "loaded checkpoint");

        Ok(())
    }

    /// Save the mapped parameters to a checkpoint.
    ///
    /// The complete set of variables is passed to the writer in a single
    /// call. When several layers map to the same variable, the layer that
    /// comes first in the mapping is saved.
    pub fn save_weights_as_checkpoint(
        &self,
        writer: &mut dyn CheckpointWriter,
    ) -> Result<(), CheckpointError> {
        let mut variables: HashMap<String, Tensor> = HashMap::new();
        for MappedVariable { name, var, .. } in self.mapped_variables()? {
            // Layers mapped to the same variable store the first layer's value.
            if variables.contains_key(&name) {
                continue;
            }
            let value = self
                .parameter_transform(&name)
                .save(var.as_tensor().clone())
                .context(TransformSnafu { name: &name })?;
            variables.insert(name, value);
        }

        let n_variables = variables.len();
        writer.write_variables(variables).context(WriteSnafu)?;

        tracing::info!(variables = n_variables, "saved checkpoint");

        Ok(())
    }
}
