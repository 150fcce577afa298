use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_layer::{
    check_arity, parameter_name, BuildLayer, CallArguments, InputArityError, Layer,
};

/// Errors for dense layers.
#[derive(Debug, Snafu)]
pub enum DenseError {
    #[snafu(display("Cannot apply activation"))]
    Activation { source: candle_core::Error },

    #[snafu(display("Cannot construct dense layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Invalid dense layer input"))]
    Input { source: InputArityError },

    #[snafu(display("Cannot apply affine transformation"))]
    Projection { source: candle_core::Error },
}

/// Affine transformation with a kernel in `(input_width, output_width)` layout.
///
/// Kernels are stored input-major, like the reference checkpoints, so that
/// checkpoint values can be assigned without transposition.
#[derive(Debug)]
pub(crate) struct Projection {
    kernel: Tensor,
    bias: Option<Tensor>,
    parameter_names: Vec<String>,
}

impl Projection {
    /// Construct a projection.
    ///
    /// * `vb` - Variable builder scoped to the projection.
    /// * `path` - Full name of the projection, used for parameter names.
    /// * `input_width` - Width of the input.
    /// * `output_width` - Width of the output.
    /// * `use_bias` - Whether to add a bias.
    /// * `kernel_init` - Kernel initialization.
    pub(crate) fn new(
        vb: VarBuilder,
        path: &str,
        input_width: usize,
        output_width: usize,
        use_bias: bool,
        kernel_init: Init,
    ) -> Result<Self, candle_core::Error> {
        let kernel = vb.get_with_hints((input_width, output_width), "kernel", kernel_init)?;
        let mut parameter_names = vec![parameter_name(path, "kernel")];

        let bias = if use_bias {
            parameter_names.push(parameter_name(path, "bias"));
            Some(vb.get_with_hints(output_width, "bias", candle_nn::init::ZERO)?)
        } else {
            None
        };

        Ok(Projection {
            kernel,
            bias,
            parameter_names,
        })
    }

    /// Parameter names: kernel, then bias (if any).
    pub(crate) fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let xs = xs.broadcast_matmul(&self.kernel)?;
        match &self.bias {
            Some(bias) => xs.broadcast_add(bias),
            None => Ok(xs),
        }
    }
}

/// Dense layer configuration.
#[derive(Clone, Debug)]
pub struct DenseConfig {
    activation: Activation,
    initializer_range: f64,
    input_width: usize,
    units: usize,
    use_bias: bool,
}

impl DenseConfig {
    /// Activation applied to the output.
    ///
    /// Default: `Activation::Linear`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Standard deviation of the kernel initialization.
    ///
    /// Default: `0.02`
    pub fn initializer_range(mut self, initializer_range: f64) -> Self {
        self.initializer_range = initializer_range;
        self
    }

    /// Width of the input.
    ///
    /// Default: `768`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Width of the output.
    ///
    /// Default: `768`
    pub fn units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    /// Whether to add a bias.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }
}

impl Default for DenseConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Linear,
            initializer_range: 0.02,
            input_width: 768,
            units: 768,
            use_bias: true,
        }
    }
}

impl BuildLayer for DenseConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let projection = Projection::new(
            vb,
            name,
            self.input_width,
            self.units,
            self.use_bias,
            Init::Randn {
                mean: 0.,
                stdev: self.initializer_range,
            },
        )
        .context(ConstructionSnafu)?;

        Ok(Box::new(Dense {
            activation: self.activation,
            name: name.to_string(),
            projection,
        }))
    }
}

/// Dense layer.
///
/// Parameters: `kernel` *(input_width, units)*, `bias` *(units)*.
#[derive(Debug)]
pub struct Dense {
    activation: Activation,
    name: String,
    projection: Projection,
}

impl Layer for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=1).context(InputSnafu)?;
        let output = self
            .projection
            .forward(&inputs[0])
            .context(ProjectionSnafu)?;
        Ok(self
            .activation
            .forward(&output)
            .context(ActivationSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        self.projection.parameter_names().to_vec()
    }
}
