use std::collections::HashMap;
use std::sync::Arc;

use snafu::{ensure, Snafu};

use crate::layers::build_layer::{BuildLayer, Layer};

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display(
        "Layer '{name}' was already built with a different configuration: {existing}, requested: {requested}"
    ))]
    ConflictingLayer {
        name: String,
        existing: String,
        requested: String,
    },
}

#[derive(Debug)]
struct RegisteredLayer {
    layer: Arc<dyn Layer>,
    signature: String,
}

/// Name-addressed store of layer instances.
///
/// A layer name maps to exactly one instance. Looking up a name with the
/// configuration it was built from returns the registered instance, which
/// is how parameters are shared between call sites.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: HashMap<String, RegisteredLayer>,
    order: Vec<String>,
}

/// Signature of a layer configuration, used to detect name clashes.
pub(crate) fn signature(config: &dyn BuildLayer) -> String {
    format!("{config:?}")
}

impl LayerRegistry {
    /// Look up the layer with the given name.
    ///
    /// Returns `Ok(None)` if the name is not registered and an error if the
    /// layer under this name was built from a different configuration.
    pub(crate) fn lookup(
        &self,
        name: &str,
        config: &dyn BuildLayer,
    ) -> Result<Option<Arc<dyn Layer>>, RegistryError> {
        match self.layers.get(name) {
            Some(registered) => {
                let requested = signature(config);
                ensure!(
                    registered.signature == requested,
                    ConflictingLayerSnafu {
                        name,
                        existing: registered.signature.clone(),
                        requested,
                    }
                );
                Ok(Some(registered.layer.clone()))
            }
            None => Ok(None),
        }
    }

    /// Register a newly-built layer.
    pub(crate) fn register(&mut self, layer: Arc<dyn Layer>, config: &dyn BuildLayer) {
        let name = layer.name().to_string();
        self.order.push(name.clone());
        self.layers.insert(
            name,
            RegisteredLayer {
                layer,
                signature: signature(config),
            },
        );
    }

    /// Get a layer by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Layer>> {
        self.layers.get(name).map(|registered| &registered.layer)
    }

    /// Check whether a layer with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Layer names in the order in which the layers were built.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
