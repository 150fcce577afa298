use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_layer::{check_arity, BuildLayer, CallArguments, InputArityError, Layer};
use crate::layers::dense::Projection;

/// Errors for point-wise feed-forward layers.
#[derive(Debug, Snafu)]
pub enum FeedForwardError {
    #[snafu(display("Cannot apply feed-forward activation"))]
    FeedForwardActivation { source: candle_core::Error },

    #[snafu(display("Cannot construct feed-forward layer"))]
    FeedForwardConstruction { source: candle_core::Error },

    #[snafu(display("Invalid feed-forward input"))]
    FeedForwardInput { source: InputArityError },

    #[snafu(display("Cannot apply feed-forward projection"))]
    FeedForwardProjection { source: candle_core::Error },
}

/// Point-wise feed-forward layer configuration.
#[derive(Clone, Debug)]
pub struct FeedForwardConfig {
    activation: Activation,
    hidden_width: usize,
    initializer_range: f64,
    intermediate_width: usize,
}

impl FeedForwardConfig {
    /// Activation applied to the intermediate representation.
    ///
    /// Default: `Activation::Gelu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Hidden width, the width of the input and output.
    ///
    /// Default: `768`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Standard deviation of the kernel initialization.
    ///
    /// Default: `0.02`
    pub fn initializer_range(mut self, initializer_range: f64) -> Self {
        self.initializer_range = initializer_range;
        self
    }

    /// Intermediate width.
    ///
    /// Default: `3072`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Gelu,
            hidden_width: 768,
            initializer_range: 0.02,
            intermediate_width: 3072,
        }
    }
}

impl BuildLayer for FeedForwardConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let init = Init::Randn {
            mean: 0.,
            stdev: self.initializer_range,
        };

        let intermediate = Projection::new(
            vb.pp("dense_1"),
            &format!("{name}.dense_1"),
            self.hidden_width,
            self.intermediate_width,
            true,
            init,
        )
        .context(FeedForwardConstructionSnafu)?;

        let output = Projection::new(
            vb.pp("dense_2"),
            &format!("{name}.dense_2"),
            self.intermediate_width,
            self.hidden_width,
            true,
            init,
        )
        .context(FeedForwardConstructionSnafu)?;

        Ok(Box::new(PointwiseFeedForward {
            activation: self.activation,
            intermediate,
            name: name.to_string(),
            output,
        }))
    }
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// This layer is applied pointwise, meaning that the same
/// transformation is applied to each sequence element. This
/// transformation is:
///
/// `g(xW_1 + b_1)W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an
/// intermediate width, `g` is a non-linear activation
/// function and `W_2` and `b_2` transform the
/// output of the activation back to the input width.
///
/// Parameters: `dense_1.kernel`, `dense_1.bias`, `dense_2.kernel`,
/// `dense_2.bias`.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
#[derive(Debug)]
pub struct PointwiseFeedForward {
    activation: Activation,
    intermediate: Projection,
    name: String,
    output: Projection,
}

impl Layer for PointwiseFeedForward {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=1).context(FeedForwardInputSnafu)?;
        let hidden = self
            .intermediate
            .forward(&inputs[0])
            .context(FeedForwardProjectionSnafu)?;
        let hidden = self
            .activation
            .forward(&hidden)
            .context(FeedForwardActivationSnafu)?;
        Ok(self
            .output
            .forward(&hidden)
            .context(FeedForwardProjectionSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        self.intermediate
            .parameter_names()
            .iter()
            .chain(self.output.parameter_names())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::layers::build_layer::{BuildLayer, CallArguments};
    use crate::layers::feedforward::FeedForwardConfig;

    #[test]
    #[report]
    fn feedforward_keeps_hidden_width() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let ffn = FeedForwardConfig::default()
            .hidden_width(4)
            .intermediate_width(16)
            .build("FeedForward", vb.pp("FeedForward"))
            .map_err(|e| Whatever::with_source(e, "Cannot build feed-forward layer".into()))?;

        assert_eq!(
            ffn.parameter_names(),
            vec![
                "FeedForward.dense_1.kernel",
                "FeedForward.dense_1.bias",
                "FeedForward.dense_2.kernel",
                "FeedForward.dense_2.bias"
            ]
        );

        let input =
            Tensor::ones((2, 3, 4), DType::F32, &device).whatever_context("Cannot create input")?;
        let output = ffn
            .forward_t(&[input], &CallArguments::default(), false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply feed-forward layer".into()))?;
        assert_eq!(output.dims(), &[2, 3, 4]);

        Ok(())
    }
}
