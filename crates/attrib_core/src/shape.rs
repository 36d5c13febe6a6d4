//! Shape metadata for model inputs, outputs and layers.

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VisError};
use crate::tensor::DType;

/// Declared shape of one model input or output, excluding the batch axis.
///
/// `None` entries are dynamic and accept any size.
///
/// # Example
///
/// ```rust
/// use attrib_core::TensorSpec;
///
/// let spec = TensorSpec::new("image", [8, 8, 3]);
/// assert_eq!(spec.rank(), 3);
/// assert_eq!(spec.channels(), Some(3));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Name of the tensor.
    pub name: String,
    /// Per-example shape.
    pub shape: Vec<Option<usize>>,
    /// Element type.
    pub dtype: DType,
}

impl TensorSpec {
    /// Create a spec with a fully static per-example shape.
    pub fn new(name: impl Into<String>, shape: impl AsRef<[usize]>) -> Self {
        Self {
            name: name.into(),
            shape: shape.as_ref().iter().copied().map(Some).collect(),
            dtype: DType::F32,
        }
    }

    /// Create a spec whose dimensions may be dynamic.
    pub fn dynamic(name: impl Into<String>, shape: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: DType::F32,
        }
    }

    /// Set the element type.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Per-example rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of the trailing (channel) axis if it is static.
    #[must_use]
    pub fn channels(&self) -> Option<usize> {
        self.shape.last().copied().flatten()
    }

    /// Validate a seed input against this spec.
    ///
    /// A tensor of the per-example rank is promoted to a batch of one by
    /// inserting a leading axis. A tensor of rank + 1 is taken as a batch.
    /// Static dimensions must match exactly.
    pub fn conform(&self, index: usize, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let rank = self.rank();
        let x = if x.ndim() == rank {
            x.insert_axis(Axis(0))
        } else if x.ndim() == rank + 1 {
            x
        } else {
            return Err(VisError::InvalidSeedInput {
                index,
                expected: format!("rank {} or {} for `{}`", rank, rank + 1, self.name),
                got: format!("rank {} ({:?})", x.ndim(), x.shape()),
            });
        };

        self.check_batch(index, &x)?;
        Ok(x)
    }

    /// Check that `x` is already a batch matching this spec.
    ///
    /// Unlike [`TensorSpec::conform`], no batch axis is inserted: `x` must
    /// have rank + 1 axes and static dimensions must match exactly.
    pub fn check_batch(&self, index: usize, x: &ArrayD<f32>) -> Result<()> {
        if x.ndim() != self.rank() + 1 {
            return Err(VisError::InvalidSeedInput {
                index,
                expected: format!("a batch of rank {} for `{}`", self.rank() + 1, self.name),
                got: format!("rank {} ({:?})", x.ndim(), x.shape()),
            });
        }
        let per_example = &x.shape()[1..];
        let matches = self
            .shape
            .iter()
            .zip(per_example)
            .all(|(expected, got)| expected.map_or(true, |e| e == *got));
        if !matches {
            return Err(VisError::InvalidSeedInput {
                index,
                expected: format!("{} per example for `{}`", format_dims(&self.shape), self.name),
                got: format!("{:?}", per_example),
            });
        }
        Ok(())
    }
}

/// Render a possibly dynamic shape as `(8, 8, ?)`.
pub fn format_dims(shape: &[Option<usize>]) -> String {
    let dims: Vec<String> = shape
        .iter()
        .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
        .collect();
    format!("({})", dims.join(", "))
}

/// Stable identity of a layer inside a model.
///
/// Identity survives structural transformations such as cloning or
/// appending an extra output, so a resolved layer can be found again in
/// the transformed model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(pub usize);

/// Introspection record of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer identity.
    pub id: LayerId,
    /// Layer name.
    pub name: String,
    /// Per-example output shape.
    pub output_shape: Vec<Option<usize>>,
}

impl LayerSpec {
    /// Create a layer record.
    pub fn new(id: LayerId, name: impl Into<String>, output_shape: Vec<Option<usize>>) -> Self {
        Self {
            id,
            name: name.into(),
            output_shape,
        }
    }

    /// Whether the layer output is a spatial feature map.
    ///
    /// Flat outputs `(batch, units)` are not spatial; anything with at least
    /// one axis between batch and channels is.
    #[must_use]
    pub fn is_spatial(&self) -> bool {
        self.output_shape.len() >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_conform_promotes_missing_batch_axis() {
        let spec = TensorSpec::new("image", [8, 8, 3]);
        let x = ArrayD::<f32>::zeros(IxDyn(&[8, 8, 3]));
        let x = spec.conform(0, x).unwrap();
        assert_eq!(x.shape(), &[1, 8, 8, 3]);
    }

    #[test]
    fn test_conform_keeps_batch() {
        let spec = TensorSpec::new("image", [8, 8, 3]);
        let x = ArrayD::<f32>::zeros(IxDyn(&[5, 8, 8, 3]));
        assert_eq!(spec.conform(0, x).unwrap().shape(), &[5, 8, 8, 3]);
    }

    #[test]
    fn test_conform_rejects_wrong_rank() {
        let spec = TensorSpec::new("image", [8, 8, 3]);
        let x = ArrayD::<f32>::zeros(IxDyn(&[8]));
        let err = spec.conform(2, x).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().contains("seed input 2"));
    }

    #[test]
    fn test_conform_rejects_wrong_dims() {
        let spec = TensorSpec::new("image", [8, 8, 3]);
        let x = ArrayD::<f32>::zeros(IxDyn(&[1, 10, 10, 3]));
        assert!(spec.conform(0, x).is_err());
    }

    #[test]
    fn test_check_batch_requires_batch_axis() {
        let spec = TensorSpec::new("image", [8, 8, 3]);
        assert!(spec.check_batch(0, &ArrayD::zeros(IxDyn(&[2, 8, 8, 3]))).is_ok());

        let unbatched = spec.check_batch(0, &ArrayD::zeros(IxDyn(&[8, 8, 3]))).unwrap_err();
        assert!(unbatched.is_invalid_argument());
        let scalar = spec.check_batch(1, &ArrayD::zeros(IxDyn(&[]))).unwrap_err();
        assert!(scalar.to_string().contains("seed input 1"));
    }

    #[test]
    fn test_dynamic_dims_accept_any_size() {
        let spec = TensorSpec::dynamic("seq", vec![None, Some(4)]);
        let x = ArrayD::<f32>::zeros(IxDyn(&[2, 17, 4]));
        assert!(spec.conform(0, x).is_ok());
        assert_eq!(format_dims(&spec.shape), "(?, 4)");
    }

    #[test]
    fn test_layer_is_spatial() {
        let conv = LayerSpec::new(LayerId(0), "conv", vec![Some(6), Some(6), Some(4)]);
        let dense = LayerSpec::new(LayerId(1), "dense", vec![Some(10)]);
        assert!(conv.is_spatial());
        assert!(!dense.is_spatial());
    }
}
