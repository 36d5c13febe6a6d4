//! Conversion between `ndarray` arrays and burn tensors.
//!
//! Engine arrays are channels-last `(B, H, W, C)`; burn convolutions read
//! channels-first `(B, C, H, W)`.

use attrib_core::{DType, FloatArray, UnconnectedGradients};
use burn::prelude::*;
use burn::tensor::{DType as BurnDType, Element, TensorData};
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};

use crate::error::{ModelError, Result};

/// Element type of a backend's float tensors.
pub(crate) fn float_dtype<B: Backend>() -> DType {
    match <B::FloatElem as Element>::dtype() {
        BurnDType::F16 => DType::F16,
        BurnDType::BF16 => DType::BF16,
        BurnDType::F64 => DType::F64,
        _ => DType::F32,
    }
}

fn dims<const D: usize>(shape: &[usize]) -> Result<[usize; D]> {
    <[usize; D]>::try_from(shape)
        .map_err(|_| ModelError::Shape(format!("expected a rank {D} array, got shape {shape:?}")))
}

/// `(B, H, W, C)` array to a `(B, C, H, W)` tensor.
pub(crate) fn image_to_tensor<B: Backend>(
    x: &ArrayD<f32>,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let shape = dims::<4>(x.shape())?;
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), shape);
    Ok(Tensor::<B, 4>::from_data(data, device)
        .swap_dims(1, 3)
        .swap_dims(2, 3))
}

/// `(B, K)` array to a tensor.
pub(crate) fn matrix_to_tensor<B: Backend>(
    x: &ArrayD<f32>,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let shape = dims::<2>(x.shape())?;
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), shape);
    Ok(Tensor::<B, 2>::from_data(data, device))
}

/// Read a tensor back, keeping the backend's element type.
pub(crate) fn tensor_to_array<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<FloatArray> {
    let shape = IxDyn(&t.dims());
    let data = t.into_data();
    let dtype = data.dtype;
    let array = match dtype {
        BurnDType::F16 => FloatArray::F16(shaped(shape, data.to_vec::<f16>())?),
        BurnDType::BF16 => FloatArray::BF16(shaped(shape, data.to_vec::<bf16>())?),
        BurnDType::F64 => FloatArray::F64(shaped(shape, data.to_vec::<f64>())?),
        _ => FloatArray::F32(shaped(shape, data.convert::<f32>().to_vec::<f32>())?),
    };
    Ok(array)
}

/// Read a `(B, C, H, W)` tensor back as a `(B, H, W, C)` array.
pub(crate) fn image_tensor_to_array<B: Backend>(t: Tensor<B, 4>) -> Result<FloatArray> {
    tensor_to_array(t.swap_dims(1, 3).swap_dims(1, 2))
}

/// Channels-last shape of a `(B, C, H, W)` tensor.
pub(crate) fn channels_last([batch, channels, height, width]: [usize; 4]) -> Vec<usize> {
    vec![batch, height, width, channels]
}

/// Gradient reported for a tensor the objective does not reach.
pub(crate) fn unconnected(
    shape: &[usize],
    dtype: DType,
    policy: UnconnectedGradients,
) -> Option<FloatArray> {
    match policy {
        UnconnectedGradients::Zero => {
            Some(FloatArray::from_f32(ArrayD::zeros(IxDyn(shape)), dtype))
        }
        UnconnectedGradients::None => None,
    }
}

fn shaped<E, T: std::fmt::Debug>(
    shape: IxDyn,
    values: std::result::Result<Vec<E>, T>,
) -> Result<ArrayD<E>> {
    let values = values.map_err(|e| ModelError::Data(format!("{e:?}")))?;
    ArrayD::from_shape_vec(shape, values).map_err(|e| ModelError::Shape(e.to_string()))
}
