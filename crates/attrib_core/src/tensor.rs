//! Element types, precision policies and dtype-tagged arrays.

use half::{bf16, f16};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Floating point element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// IEEE half precision.
    F16,
    /// Brain floating point.
    BF16,
    /// Single precision.
    F32,
    /// Double precision.
    F64,
}

impl DType {
    /// Width of the element in bits.
    #[must_use]
    pub const fn bits(&self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 16,
            Self::F32 => 32,
            Self::F64 => 64,
        }
    }
}

/// Precision descriptor of a model.
///
/// A model is mixed precision when it computes in a narrower type than the
/// one its variables are stored in. The descriptor is reported by the model
/// for each request rather than read from process-wide state.
///
/// Attribution arithmetic always runs in `f32`, whatever the variable type.
/// Results in a narrower type are widened; `f64` results are narrowed, so
/// a double precision model loses precision beyond `f32` in its maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precision {
    /// Type activations and gradients are computed in.
    pub compute: DType,
    /// Type variables are stored in.
    pub variable: DType,
}

impl Precision {
    /// Uniform single precision.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            compute: DType::F32,
            variable: DType::F32,
        }
    }

    /// Half precision compute with single precision variables.
    #[must_use]
    pub const fn mixed_f16() -> Self {
        Self {
            compute: DType::F16,
            variable: DType::F32,
        }
    }

    /// Bfloat16 compute with single precision variables.
    #[must_use]
    pub const fn mixed_bf16() -> Self {
        Self {
            compute: DType::BF16,
            variable: DType::F32,
        }
    }

    /// Whether compute and variable types differ.
    #[must_use]
    pub fn is_mixed(&self) -> bool {
        self.compute != self.variable
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::full()
    }
}

/// An array tagged with the element type it was produced in.
///
/// Gradient tapes return their results in the model's compute type; the
/// engine widens them before doing arithmetic on them.
#[derive(Debug, Clone, PartialEq)]
pub enum FloatArray {
    /// Half precision payload.
    F16(ArrayD<f16>),
    /// Bfloat16 payload.
    BF16(ArrayD<bf16>),
    /// Single precision payload.
    F32(ArrayD<f32>),
    /// Double precision payload.
    F64(ArrayD<f64>),
}

impl FloatArray {
    /// Element type of the payload.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    /// Shape of the payload.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F16(a) => a.shape(),
            Self::BF16(a) => a.shape(),
            Self::F32(a) => a.shape(),
            Self::F64(a) => a.shape(),
        }
    }

    /// Quantize a single precision array to `dtype`.
    #[must_use]
    pub fn from_f32(array: ArrayD<f32>, dtype: DType) -> Self {
        match dtype {
            DType::F16 => Self::F16(array.mapv(f16::from_f32)),
            DType::BF16 => Self::BF16(array.mapv(bf16::from_f32)),
            DType::F32 => Self::F32(array),
            DType::F64 => Self::F64(array.mapv(f64::from)),
        }
    }

    /// Cast the payload to `dtype`.
    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        if self.dtype() == dtype {
            return self;
        }
        match (self, dtype) {
            (Self::F64(a), DType::F32) => Self::F32(a.mapv(|v| v as f32)),
            (Self::F64(a), DType::F16) => Self::F16(a.mapv(f16::from_f64)),
            (Self::F64(a), DType::BF16) => Self::BF16(a.mapv(bf16::from_f64)),
            (other, DType::F64) => Self::F64(other.into_f64()),
            (other, target) => Self::from_f32(other.into_f32(), target),
        }
    }

    /// Widen (or narrow, for f64) the payload to single precision.
    #[must_use]
    pub fn into_f32(self) -> ArrayD<f32> {
        match self {
            Self::F16(a) => a.mapv(f16::to_f32),
            Self::BF16(a) => a.mapv(bf16::to_f32),
            Self::F32(a) => a,
            Self::F64(a) => a.mapv(|v| v as f32),
        }
    }

    fn into_f64(self) -> ArrayD<f64> {
        match self {
            Self::F16(a) => a.mapv(f16::to_f64),
            Self::BF16(a) => a.mapv(bf16::to_f64),
            Self::F32(a) => a.mapv(f64::from),
            Self::F64(a) => a,
        }
    }
}

impl From<ArrayD<f32>> for FloatArray {
    fn from(array: ArrayD<f32>) -> Self {
        Self::F32(array)
    }
}
