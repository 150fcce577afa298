use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_layer::{check_arity, BuildLayer, CallArguments, InputArityError, Layer};

#[derive(Debug, Snafu)]
pub enum AddError {
    #[snafu(display("Cannot add inputs"))]
    AddInputs { source: candle_core::Error },

    #[snafu(display("Invalid add input"))]
    AddArity { source: InputArityError },
}

/// Element-wise sum of all inputs, used for residual connections and
/// for combining embeddings.
#[derive(Clone, Debug, Default)]
pub struct AddConfig;

impl BuildLayer for AddConfig {
    fn build(&self, name: &str, _vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        Ok(Box::new(Add {
            name: name.to_string(),
        }))
    }
}

#[derive(Debug)]
pub struct Add {
    name: String,
}

impl Layer for Add {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 2..=usize::MAX).context(AddAritySnafu)?;
        let mut sum = inputs[0].clone();
        for input in &inputs[1..] {
            sum = sum.broadcast_add(input).context(AddInputsSnafu)?;
        }
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::layers::build_layer::{BuildLayer, CallArguments};
    use crate::layers::merge::AddConfig;

    #[test]
    #[report]
    fn add_sums_all_inputs() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let add = AddConfig
            .build("Add", VarBuilder::from_varmap(&var_map, DType::F32, &device))
            .map_err(|e| Whatever::with_source(e, "Cannot build add layer".into()))?;

        let a = Tensor::new(&[1f32, 2.], &device).whatever_context("Cannot create input")?;
        let output: Vec<f32> = add
            .forward_t(&[a.clone(), a.clone(), a], &CallArguments::default(), false)
            .map_err(|e| Whatever::with_source(e, "Cannot add".into()))?
            .to_vec1()
            .whatever_context("Cannot convert output")?;
        assert_eq!(output, vec![3., 6.]);

        Ok(())
    }

    #[test]
    fn add_rejects_single_input() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let add = AddConfig
            .build("Add", VarBuilder::from_varmap(&var_map, DType::F32, &device))
            .unwrap();
        let a = Tensor::new(&[1f32], &device).unwrap();
        assert!(add
            .forward_t(&[a], &CallArguments::default(), false)
            .is_err());
    }
}
