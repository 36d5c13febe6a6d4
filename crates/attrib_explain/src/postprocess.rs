//! Map post-processing: activation, resampling, standardization.

use std::fmt;
use std::sync::Arc;

use attrib_core::{Result, VisError};
use ndarray::{ArrayD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

/// Ranges at or below this are treated as constant by [`standardize`].
pub const STANDARDIZE_EPSILON: f32 = 1e-7;

/// Elementwise function applied to a raw map or to gradients.
#[derive(Clone, Default, Serialize, Deserialize)]
pub enum ActivationModifier {
    /// Leave values unchanged.
    #[default]
    Identity,
    /// `max(x, 0)`.
    Relu,
    /// `|x|`.
    Abs,
    /// Any elementwise function. Not serializable.
    #[serde(skip)]
    Custom(Arc<dyn Fn(f32) -> f32 + Send + Sync>),
}

impl ActivationModifier {
    /// Wrap an elementwise function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Apply to one value.
    #[inline]
    pub fn apply_scalar(&self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Relu => x.max(0.0),
            Self::Abs => x.abs(),
            Self::Custom(f) => f(x),
        }
    }

    /// Apply elementwise, in place.
    pub fn apply(&self, map: &mut ArrayD<f32>) {
        if !matches!(self, Self::Identity) {
            map.mapv_inplace(|x| self.apply_scalar(x));
        }
    }
}

impl fmt::Debug for ActivationModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "Identity"),
            Self::Relu => write!(f, "Relu"),
            Self::Abs => write!(f, "Abs"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Reduction over the channel axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelReduction {
    /// Largest value across channels.
    #[default]
    Max,
    /// Average across channels.
    Mean,
}

/// Resample `map` to `target` with order-1 (linear) interpolation.
///
/// Corner samples are aligned: output index `j` reads input position
/// `j * (in - 1) / (out - 1)`. Axes whose size already matches are left
/// alone, so the batch axis is never resampled.
///
/// # Errors
///
/// [`VisError::ShapeMismatch`] if the ranks differ or a size is zero.
pub fn zoom(map: &ArrayD<f32>, target: &[usize]) -> Result<ArrayD<f32>> {
    if map.ndim() != target.len() {
        return Err(VisError::ShapeMismatch(format!(
            "cannot zoom a map of shape {:?} to {:?}",
            map.shape(),
            target
        )));
    }
    if map.shape().iter().chain(target).any(|&d| d == 0) {
        return Err(VisError::ShapeMismatch(format!(
            "cannot zoom between {:?} and {:?}: zero-sized axis",
            map.shape(),
            target
        )));
    }

    let mut out = map.clone();
    for (axis, &size) in target.iter().enumerate() {
        if out.shape()[axis] != size {
            out = resample_axis(&out, axis, size);
        }
    }
    Ok(out)
}

fn resample_axis(map: &ArrayD<f32>, axis: usize, size: usize) -> ArrayD<f32> {
    let input = map.shape()[axis];
    let mut shape = map.shape().to_vec();
    shape[axis] = size;
    let mut out = ArrayD::zeros(IxDyn(&shape));

    let denom = size.saturating_sub(1).max(1) as f64;
    for j in 0..size {
        let src = (j * (input - 1)) as f64 / denom;
        let lo = (src.floor() as usize).min(input - 1);
        let hi = (lo + 1).min(input - 1);
        let t = (src - lo as f64) as f32;

        let below = map.index_axis(Axis(axis), lo);
        let above = map.index_axis(Axis(axis), hi);
        Zip::from(out.index_axis_mut(Axis(axis), j))
            .and(&below)
            .and(&above)
            .for_each(|o, &a, &b| *o = a + (b - a) * t);
    }
    out
}

/// Rescale each example to `[0, 1]`.
///
/// An example whose value range is at most [`STANDARDIZE_EPSILON`] maps to
/// all zeros.
#[must_use]
pub fn standardize(mut map: ArrayD<f32>) -> ArrayD<f32> {
    if map.ndim() == 0 {
        return map;
    }
    for mut example in map.axis_iter_mut(Axis(0)) {
        let (min, max) = example
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        if range.is_finite() && range > STANDARDIZE_EPSILON {
            example.mapv_inplace(|v| (v - min) / range);
        } else {
            example.fill(0.0);
        }
    }
    map
}

/// Reduce the trailing channel axis.
///
/// Arrays of rank below 2 have no channel axis and are returned unchanged.
#[must_use]
pub fn reduce_channels(map: ArrayD<f32>, reduction: ChannelReduction) -> ArrayD<f32> {
    if map.ndim() < 2 {
        return map;
    }
    let last = Axis(map.ndim() - 1);
    match reduction {
        ChannelReduction::Max => map.fold_axis(last, f32::NEG_INFINITY, |&acc, &v| acc.max(v)),
        ChannelReduction::Mean => {
            let n = map.shape()[last.index()] as f32;
            map.sum_axis(last).mapv(|v| v / n)
        }
    }
}

/// Repeat a channel-less map along a new trailing axis of size `channels`.
#[must_use]
pub fn broadcast_channels(map: &ArrayD<f32>, channels: usize) -> ArrayD<f32> {
    let mut shape = map.shape().to_vec();
    shape.push(channels);
    let expanded = map.view().insert_axis(Axis(map.ndim()));
    let mut out = ArrayD::zeros(IxDyn(&shape));
    Zip::from(&mut out)
        .and_broadcast(&expanded)
        .for_each(|o, &v| *o = v);
    out
}

/// Turn one raw map into one map per target input shape.
///
/// For each target (a full input shape, channels last) the activation is
/// applied, the map is zoomed to the target's leading axes, standardized
/// if requested, and with `keepdims` repeated across the target's channels.
pub fn postprocess(
    raw: &ArrayD<f32>,
    targets: &[Vec<usize>],
    activation: Option<&ActivationModifier>,
    standardize_maps: bool,
    keepdims: bool,
) -> Result<Vec<ArrayD<f32>>> {
    let mut activated = raw.clone();
    if let Some(activation) = activation {
        activation.apply(&mut activated);
    }

    targets
        .iter()
        .map(|target| {
            if target.len() < activated.ndim() {
                return Err(VisError::ShapeMismatch(format!(
                    "map of shape {:?} has more axes than input shape {:?}",
                    activated.shape(),
                    target
                )));
            }
            let mut map = zoom(&activated, &target[..activated.ndim()])?;
            if standardize_maps {
                map = standardize(map);
            }
            if keepdims {
                if let Some(&channels) = target.last() {
                    map = broadcast_channels(&map, channels);
                }
            }
            Ok(map)
        })
        .collect()
}
