use std::fmt;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_layer::{BuildLayer, CallArguments, Layer};

#[derive(Debug, Snafu)]
#[snafu(display("Cannot apply lambda layer '{name}'"))]
pub struct LambdaError {
    name: String,
    source: candle_core::Error,
}

/// Function applied by a lambda layer.
pub type LambdaFn = fn(&[Tensor]) -> Result<Tensor, candle_core::Error>;

/// Parameterless layer that applies a function to its inputs.
#[derive(Clone)]
pub struct LambdaConfig {
    function: LambdaFn,
}

impl LambdaConfig {
    pub fn new(function: LambdaFn) -> Self {
        LambdaConfig { function }
    }
}

impl fmt::Debug for LambdaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Function pointers are compared by address in layer signatures.
        write!(f, "LambdaConfig({:p})", self.function as *const ())
    }
}

impl BuildLayer for LambdaConfig {
    fn build(&self, name: &str, _vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        Ok(Box::new(Lambda {
            function: self.function,
            name: name.to_string(),
        }))
    }
}

pub struct Lambda {
    function: LambdaFn,
    name: String,
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda").field("name", &self.name).finish()
    }
}

impl Layer for Lambda {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        Ok((self.function)(inputs).context(LambdaSnafu {
            name: self.name.clone(),
        })?)
    }
}

/// Select the representation of the first sequence element.
///
/// `(batch, seq_len, width)` -> `(batch, width)`
pub fn first_token(inputs: &[Tensor]) -> Result<Tensor, candle_core::Error> {
    inputs[0].narrow(1, 0, 1)?.squeeze(1)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::layers::build_layer::{BuildLayer, CallArguments};
    use crate::layers::lambda::{first_token, LambdaConfig};

    #[test]
    #[report]
    fn first_token_selects_first_position() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let pooler = LambdaConfig::new(first_token)
            .build("Pooler", VarBuilder::from_varmap(&var_map, DType::F32, &device))
            .map_err(|e| Whatever::with_source(e, "Cannot build lambda layer".into()))?;

        let hidden = Tensor::arange(0f32, 12., &device)
            .and_then(|t| t.reshape((2, 3, 2)))
            .whatever_context("Cannot create hidden")?;
        let output: Vec<Vec<f32>> = pooler
            .forward_t(&[hidden], &CallArguments::default(), false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply lambda".into()))?
            .to_vec2()
            .whatever_context("Cannot convert output")?;
        assert_eq!(output, vec![vec![0., 1.], vec![6., 7.]]);

        Ok(())
    }
}
