use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use serde::{Deserialize, Serialize};

/// Activation functions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Gausian Error Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    #[serde(alias = "gelu_erf")]
    Gelu,

    /// Gausian Error Linear Unit approximation.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    #[serde(alias = "gelu_tanh")]
    GeluNew,

    /// Identity.
    #[default]
    Linear,

    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    Relu,

    /// Logistic sigmoid.
    Sigmoid,

    /// Sigmoid Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    #[serde(alias = "swish")]
    Silu,

    /// Softmax over the last dimension.
    Softmax,

    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Apply the activation function.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        use Activation::*;
        match self {
            Gelu => xs.gelu_erf(),
            GeluNew => xs.gelu(),
            Linear => Ok(xs.clone()),
            Relu => xs.relu(),
            Sigmoid => xs.neg()?.exp()?.affine(1.0, 1.0)?.recip(),
            Silu => xs.silu(),
            Softmax => softmax(xs, D::Minus1),
            Tanh => xs.tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::Activation;

    #[test]
    fn activation_names_follow_checkpoint_configs() {
        let parsed: Vec<Activation> =
            serde_json::from_str(r#"["gelu", "gelu_new", "relu", "swish", "tanh", "linear"]"#)
                .unwrap();
        assert_eq!(
            parsed,
            vec![
                Activation::Gelu,
                Activation::GeluNew,
                Activation::Relu,
                Activation::Silu,
                Activation::Tanh,
                Activation::Linear
            ]
        );
    }

    #[test]
    #[report]
    fn softmax_normalizes_last_dimension() -> Result<(), Whatever> {
        let xs = Tensor::new(&[[1f32, 2., 3.], [0., 0., 0.]], &Device::Cpu)
            .whatever_context("Cannot create tensor")?;
        let sums: Vec<f32> = Activation::Softmax
            .forward(&xs)
            .and_then(|xs| xs.sum(1))
            .and_then(|xs| xs.to_vec1())
            .whatever_context("Cannot apply softmax")?;
        for sum in sums {
            approx::assert_relative_eq!(sum, 1.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    #[report]
    fn sigmoid_of_zero_is_one_half() -> Result<(), Whatever> {
        let xs = Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu)
            .whatever_context("Cannot create tensor")?;
        let ys: Vec<f32> = Activation::Sigmoid
            .forward(&xs)
            .and_then(|ys| ys.to_vec1())
            .whatever_context("Cannot apply sigmoid")?;
        assert_eq!(ys, vec![0.5, 0.5, 0.5]);
        Ok(())
    }
}
