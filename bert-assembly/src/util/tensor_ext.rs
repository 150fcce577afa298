/// Tensor extension traits.
use candle_core::{DType, Tensor};
use half::{bf16, f16};

/// Tensors filled with the minimum value of their data type.
pub trait MinLike: Sized {
    /// Get a tensor with the shape, data type, and device of `self`,
    /// filled with the data type's minimum value.
    fn min_like(&self) -> Result<Self, candle_core::Error>;
}

impl MinLike for Tensor {
    fn min_like(&self) -> Result<Self, candle_core::Error> {
        let min = match self.dtype() {
            DType::BF16 => bf16::MIN.to_f64(),
            DType::F16 => f16::MIN.to_f64(),
            DType::F32 => f32::MIN as f64,
            DType::F64 => f64::MIN,
            DType::U8 | DType::U32 => 0.,
            DType::I64 => i64::MIN as f64,
        };
        self.zeros_like()?.affine(0., min)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Tensor};
    use half::f16;

    use super::MinLike;
    use crate::util::device::tests::test_devices;

    #[test]
    fn min_like_fills_with_minimum() {
        for device in test_devices() {
            let scores = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
            let min = scores.min_like().unwrap();
            assert_eq!(min.dims(), &[2, 3]);
            assert_eq!(min.device().location(), device.location());
            assert_eq!(min.to_vec2::<f32>().unwrap(), vec![vec![f32::MIN; 3]; 2]);

            let scores = Tensor::zeros(4, DType::F16, &device).unwrap();
            assert_eq!(
                scores.min_like().unwrap().to_vec1::<f16>().unwrap(),
                vec![f16::MIN; 4]
            );
        }
    }
}
