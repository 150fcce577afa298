use candle_core::{ModuleT, Tensor};
use candle_nn::{Dropout as CandleDropout, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_layer::{check_arity, BuildLayer, CallArguments, InputArityError, Layer};

#[derive(Debug, Snafu)]
pub enum DropoutError {
    #[snafu(display("Cannot apply dropout"))]
    ApplyDropout { source: candle_core::Error },

    #[snafu(display("Invalid dropout input"))]
    DropoutInput { source: InputArityError },
}

/// Dropout configuration.
#[derive(Clone, Debug)]
pub struct DropoutConfig {
    p: f32,
}

impl DropoutConfig {
    /// Dropout probability.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

impl BuildLayer for DropoutConfig {
    fn build(&self, name: &str, _vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        Ok(Box::new(Dropout {
            dropout: CandleDropout::new(self.p),
            name: name.to_string(),
        }))
    }

    fn passthrough(&self) -> bool {
        self.p == 0.0
    }
}

/// Dropout layer, only active in training mode.
#[derive(Debug)]
pub struct Dropout {
    dropout: CandleDropout,
    name: String,
}

impl Layer for Dropout {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=1).context(DropoutInputSnafu)?;
        Ok(self
            .dropout
            .forward_t(&inputs[0], train)
            .context(ApplyDropoutSnafu)?)
    }
}
