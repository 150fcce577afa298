/// Checkpoints and the mapping between layer parameters and checkpoint
/// variables.
use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::error::BoxedError;

mod mapping;
pub use mapping::CheckpointError;

mod memory;
pub use memory::InMemoryCheckpoint;

mod repo;
pub use repo::{open_checkpoint, OpenCheckpointError};

mod safetensors;
pub use safetensors::{SafeTensorsCheckpoint, SafeTensorsWriter, SafeTensorsWriterError};

/// Read access to the variables of a checkpoint.
pub trait CheckpointReader {
    /// Check whether the checkpoint has a variable with the given name.
    fn contains_variable(&self, name: &str) -> bool;

    /// Load a variable.
    ///
    /// * `name` - Name of the variable in the checkpoint.
    /// * `device` - Device to place the variable on.
    fn load_variable(&self, name: &str, device: &Device) -> Result<Tensor, BoxedError>;

    /// Names of all variables in the checkpoint.
    fn variable_names(&self) -> Vec<String>;
}

/// Write access to a checkpoint.
pub trait CheckpointWriter {
    /// Write a complete set of variables.
    fn write_variables(&mut self, variables: HashMap<String, Tensor>) -> Result<(), BoxedError>;
}

/// Transformation between a checkpoint variable and a layer parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParameterTransform<'a> {
    /// Use the value as-is.
    Identity,

    /// Keep the given rows of a variable with `vocab_size` rows on load.
    /// On save, the parameter is written as-is, so only the kept rows are
    /// stored. Such a reduced variable is loaded without selecting rows.
    KeepRows { rows: &'a [u32], vocab_size: usize },

    /// The checkpoint stores the transpose of the parameter.
    Transpose,
}

impl ParameterTransform<'_> {
    /// Transform a checkpoint value into a parameter value.
    pub fn load(&self, value: Tensor) -> Result<Tensor, candle_core::Error> {
        match self {
            ParameterTransform::Identity => Ok(value),
            ParameterTransform::KeepRows { rows, vocab_size } => {
                let n_rows = value.dim(0)?;
                if n_rows != *vocab_size && n_rows == rows.len() {
                    return Ok(value);
                }
                let rows = Tensor::from_slice(rows, rows.len(), value.device())?;
                value.index_select(&rows, 0)
            }
            ParameterTransform::Transpose => value.t()?.contiguous(),
        }
    }

    /// Transform a parameter value into a checkpoint value.
    pub fn save(&self, value: Tensor) -> Result<Tensor, candle_core::Error> {
        match self {
            ParameterTransform::Identity | ParameterTransform::KeepRows { .. } => Ok(value),
            ParameterTransform::Transpose => value.t()?.contiguous(),
        }
    }
}

/// Mapping from layer names to the ordered checkpoint variable names of
/// their parameters.
///
/// The n-th variable name of a layer corresponds to the n-th parameter
/// of the layer. Layers can have more parameters than variable names,
/// the remaining parameters are not stored in checkpoints.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VariableMapping {
    entries: Vec<(String, Vec<String>)>,
}

impl VariableMapping {
    /// Add or replace the variable names of a layer.
    pub fn insert(&mut self, layer: impl Into<String>, variables: Vec<String>) {
        let layer = layer.into();
        match self.entries.iter_mut().find(|(name, _)| *name == layer) {
            Some((_, existing)) => *existing = variables,
            None => self.entries.push((layer, variables)),
        }
    }

    /// Variable names of a layer.
    pub fn get(&self, layer: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == layer)
            .map(|(_, variables)| variables.as_slice())
    }

    /// Iterate over layer names and their variable names.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(layer, variables)| (layer.as_str(), variables.as_slice()))
    }

    /// Only keep the layers for which the predicate is true.
    pub fn retain(&mut self, mut predicate: impl FnMut(&str) -> bool) {
        self.entries.retain(|(layer, _)| predicate(layer));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<String>)> for VariableMapping {
    fn from_iter<T: IntoIterator<Item = (S, Vec<String>)>>(iter: T) -> Self {
        let mut mapping = VariableMapping::default();
        for (layer, variables) in iter {
            mapping.insert(layer, variables);
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::{ParameterTransform, VariableMapping};

    #[test]
    #[report]
    fn keep_rows_selects_rows_on_load_only() -> Result<(), Whatever> {
        let value = Tensor::new(&[[0f32, 0.], [1., 1.], [2., 2.]], &Device::Cpu)
            .whatever_context("Cannot create value")?;
        let keep = [2u32, 0];
        let transform = ParameterTransform::KeepRows {
            rows: &keep,
            vocab_size: 3,
        };

        let loaded = transform
            .load(value)
            .whatever_context("Cannot transform value")?;
        assert_eq!(
            loaded.to_vec2::<f32>().whatever_context("Cannot convert")?,
            vec![vec![2., 2.], vec![0., 0.]]
        );

        let saved = transform
            .save(loaded.clone())
            .whatever_context("Cannot transform value")?;
        assert_eq!(saved.dims(), loaded.dims());

        // Saved rows are already reduced.
        let reloaded = transform
            .load(saved)
            .whatever_context("Cannot transform value")?;
        assert_eq!(
            reloaded.to_vec2::<f32>().whatever_context("Cannot convert")?,
            vec![vec![2., 2.], vec![0., 0.]]
        );

        Ok(())
    }

    #[test]
    #[report]
    fn transpose_round_trips() -> Result<(), Whatever> {
        let value = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &Device::Cpu)
            .whatever_context("Cannot create value")?;
        let transform = ParameterTransform::Transpose;
        let loaded = transform
            .load(value.clone())
            .whatever_context("Cannot transform value")?;
        assert_eq!(loaded.dims(), &[3, 2]);
        let saved = transform
            .save(loaded)
            .whatever_context("Cannot transform value")?;
        assert_eq!(
            saved.to_vec2::<f32>().whatever_context("Cannot convert")?,
            value.to_vec2::<f32>().whatever_context("Cannot convert")?
        );
        Ok(())
    }

    #[test]
    fn mapping_keeps_insertion_order() {
        let mut mapping: VariableMapping = [
            ("Embedding-Token", vec!["bert/embeddings/word_embeddings".to_string()]),
            ("Pooler-Dense", vec!["bert/pooler/dense/kernel".to_string()]),
        ]
        .into_iter()
        .collect();
        mapping.insert(
            "Pooler-Dense",
            vec![
                "bert/pooler/dense/kernel".to_string(),
                "bert/pooler/dense/bias".to_string(),
            ],
        );

        assert_eq!(
            mapping.iter().map(|(layer, _)| layer).collect::<Vec<_>>(),
            vec!["Embedding-Token", "Pooler-Dense"]
        );
        assert_eq!(mapping.get("Pooler-Dense").map(|names| names.len()), Some(2));

        mapping.retain(|layer| layer != "Pooler-Dense");
        assert_eq!(mapping.len(), 1);
        assert!(mapping.get("Pooler-Dense").is_none());
    }
}
