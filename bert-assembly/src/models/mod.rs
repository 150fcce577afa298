pub mod albert;

pub mod bert;

mod config;
pub use config::{SpecError, TransformerConfig, TransformerSpec};

mod factory;
pub use factory::{
    build_transformer_model, build_transformer_model_from_repo, Application, BuildOptions,
    BuildTransformerError, ModelKind,
};

pub mod nezha;

#[cfg(test)]
pub(crate) use config::tests;
