use candle_core::{DType, Tensor, D};
use candle_nn::{Init, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_layer::{
    check_arity, parameter_name, BuildLayer, CallArguments, InputArityError, Layer,
};
use crate::layers::dense::Projection;

/// Errors for layer normalization.
#[derive(Debug, Snafu)]
pub enum LayerNormError {
    #[snafu(display("Cannot compute condition projection"))]
    Condition { source: candle_core::Error },

    #[snafu(display("Cannot construct layer norm"))]
    LayerNormConstruction { source: candle_core::Error },

    #[snafu(display("Invalid layer norm input"))]
    LayerNormInput { source: InputArityError },

    #[snafu(display("Layer norm '{name}' is conditional, but no condition was passed"))]
    MissingCondition { name: String },

    #[snafu(display("Cannot normalize"))]
    Normalize { source: candle_core::Error },
}

/// Conditioning of a layer normalization.
///
/// When a layer normalization is conditional, its shift and scale are
/// modulated by projections of a fixed-width condition vector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConditionConfig {
    /// Width of the condition vector.
    pub width: usize,

    /// Project the condition to this width before computing the shift
    /// and scale.
    pub hidden_units: Option<usize>,

    /// Activation of the condition projection.
    pub hidden_activation: Activation,
}

/// Layer norm configuration.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    condition: Option<ConditionConfig>,
    eps: f64,
    size: usize,
}

impl LayerNormConfig {
    /// Condition the shift and scale on an additional input.
    ///
    /// Default: `None`
    pub fn condition(mut self, condition: Option<ConditionConfig>) -> Self {
        self.condition = condition;
        self
    }

    /// Epsilon value.
    ///
    /// Default: `1e-12`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `768`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            condition: None,
            eps: 1e-12,
            size: 768,
        }
    }
}

impl BuildLayer for LayerNormConfig {
    fn build(&self, name: &str, vb: VarBuilder) -> Result<Box<dyn Layer>, BoxedError> {
        let beta = vb
            .get_with_hints(self.size, "beta", candle_nn::init::ZERO)
            .context(LayerNormConstructionSnafu)?;
        let gamma = vb
            .get_with_hints(self.size, "gamma", candle_nn::init::ONE)
            .context(LayerNormConstructionSnafu)?;

        let condition = self
            .condition
            .map(|condition| ConditionProjections::new(&vb, name, self.size, condition))
            .transpose()
            .context(LayerNormConstructionSnafu)?;

        Ok(Box::new(LayerNorm {
            beta,
            condition,
            eps: self.eps,
            gamma,
            name: name.to_string(),
        }))
    }
}

#[derive(Debug)]
struct ConditionProjections {
    hidden: Option<(Projection, Activation)>,
    beta: Projection,
    gamma: Projection,
}

impl ConditionProjections {
    fn new(
        vb: &VarBuilder,
        name: &str,
        size: usize,
        condition: ConditionConfig,
    ) -> Result<Self, candle_core::Error> {
        let (hidden, width) = match condition.hidden_units {
            Some(hidden_units) => (
                Some((
                    Projection::new(
                        vb.pp("hidden_dense"),
                        &format!("{name}.hidden_dense"),
                        condition.width,
                        hidden_units,
                        false,
                        Init::Randn {
                            mean: 0.,
                            stdev: 0.02,
                        },
                    )?,
                    condition.hidden_activation,
                )),
                hidden_units,
            ),
            None => (None, condition.width),
        };

        // Zero-initialized, so that the layer starts out unconditional.
        let beta = Projection::new(
            vb.pp("beta_dense"),
            &format!("{name}.beta_dense"),
            width,
            size,
            false,
            candle_nn::init::ZERO,
        )?;
        let gamma = Projection::new(
            vb.pp("gamma_dense"),
            &format!("{name}.gamma_dense"),
            width,
            size,
            false,
            candle_nn::init::ZERO,
        )?;

        Ok(ConditionProjections {
            hidden,
            beta,
            gamma,
        })
    }

    /// Compute the shift and scale offsets for the given condition.
    fn forward(&self, condition: &Tensor, rank: usize) -> Result<(Tensor, Tensor), candle_core::Error> {
        let mut condition = match &self.hidden {
            Some((projection, activation)) => activation.forward(&projection.forward(condition)?)?,
            None => condition.clone(),
        };

        // (batch, width) -> (batch, 1, ..., width) to broadcast over the
        // sequence dimensions of the input.
        while condition.rank() < rank {
            condition = condition.unsqueeze(1)?;
        }

        Ok((self.beta.forward(&condition)?, self.gamma.forward(&condition)?))
    }

    fn parameter_names(&self) -> impl Iterator<Item = &String> {
        self.hidden
            .iter()
            .flat_map(|(projection, _)| projection.parameter_names())
            .chain(self.beta.parameter_names())
            .chain(self.gamma.parameter_names())
    }
}

/// Layer normalization (_Ba et al., 2016_), optionally conditional.
///
/// Inputs: `[hidden]`, or `[hidden, condition]` for a conditional layer norm.
///
/// Parameters: `beta`, `gamma`, then for conditional layer norms
/// `hidden_dense.kernel` (when the condition is projected),
/// `beta_dense.kernel`, and `gamma_dense.kernel`.
///
/// * _Ba et al., 2016_: https://arxiv.org/abs/1607.06450
#[derive(Debug)]
pub struct LayerNorm {
    beta: Tensor,
    condition: Option<ConditionProjections>,
    eps: f64,
    gamma: Tensor,
    name: String,
}

impl LayerNorm {
    fn normalize(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let dtype = xs.dtype();
        let internal_dtype = match dtype {
            DType::F16 | DType::BF16 => DType::F32,
            dtype => dtype,
        };
        let xs = xs.to_dtype(internal_dtype)?;
        let xs = xs.broadcast_sub(&xs.mean_keepdim(D::Minus1)?)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?
            .to_dtype(dtype)
    }
}

impl Layer for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(
        &self,
        inputs: &[Tensor],
        _arguments: &CallArguments,
        _train: bool,
    ) -> Result<Tensor, BoxedError> {
        check_arity(&self.name, inputs, 1..=2).context(LayerNormInputSnafu)?;
        let xs = &inputs[0];
        let normalized = self.normalize(xs).context(NormalizeSnafu)?;

        let (beta, gamma) = match &self.condition {
            Some(condition) => {
                ensure!(
                    inputs.len() == 2,
                    MissingConditionSnafu {
                        name: self.name.clone()
                    }
                );
                let (beta, gamma) = condition
                    .forward(&inputs[1], xs.rank())
                    .context(ConditionSnafu)?;
                (
                    beta.broadcast_add(&self.beta).context(ConditionSnafu)?,
                    gamma.broadcast_add(&self.gamma).context(ConditionSnafu)?,
                )
            }
            None => (self.beta.clone(), self.gamma.clone()),
        };

        Ok(normalized
            .broadcast_mul(&gamma)
            .and_then(|xs| xs.broadcast_add(&beta))
            .context(NormalizeSnafu)?)
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names = vec![
            parameter_name(&self.name, "beta"),
            parameter_name(&self.name, "gamma"),
        ];
        if let Some(condition) = &self.condition {
            names.extend(condition.parameter_names().cloned());
        }
        names
    }
}
