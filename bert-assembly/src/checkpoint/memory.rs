use std::collections::HashMap;

use candle_core::{Device, Tensor};
use snafu::{OptionExt, ResultExt, Snafu};

use super::{CheckpointReader, CheckpointWriter};
use crate::error::BoxedError;

#[derive(Debug, Snafu)]
pub enum InMemoryCheckpointError {
    #[snafu(display("Checkpoint has no variable '{name}'"))]
    UnknownVariable { name: String },

    #[snafu(display("Cannot move variable '{name}' to device"))]
    ToDevice {
        name: String,
        source: candle_core::Error,
    },
}

/// Checkpoint that keeps its variables in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpoint {
    variables: HashMap<String, Tensor>,
}

impl InMemoryCheckpoint {
    pub fn new(variables: HashMap<String, Tensor>) -> Self {
        InMemoryCheckpoint { variables }
    }

    /// Get a variable.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.variables.get(name)
    }

    /// Add or replace a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        self.variables.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn into_variables(self) -> HashMap<String, Tensor> {
        self.variables
    }
}

impl CheckpointReader for InMemoryCheckpoint {
    fn contains_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    fn load_variable(&self, name: &str, device: &Device) -> Result<Tensor, BoxedError> {
        Ok(self
            .variables
            .get(name)
            .context(UnknownVariableSnafu { name })?
            .to_device(device)
            .context(ToDeviceSnafu { name })?)
    }

    fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }
}

impl CheckpointWriter for InMemoryCheckpoint {
    fn write_variables(&mut self, variables: HashMap<String, Tensor>) -> Result<(), BoxedError> {
        // Copy values, parameters are updated in-place.
        for (name, value) in variables {
            self.variables.insert(name, value.copy()?);
        }
        Ok(())
    }
}
