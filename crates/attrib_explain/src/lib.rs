//! # attrib_explain
//!
//! Attribution maps for differentiable models.
//!
//! This crate provides:
//! - [`Score`] variants reducing a model output to one value per example
//! - [`extract`], the gradient extraction engine
//! - [`Saliency`] (vanilla gradients and SmoothGrad)
//! - [`Gradcam`] and [`GradcamPlusPlus`] class activation maps
//! - [`SmoothGrad`] noise averaging and the map post-processing helpers
//!
//! Models are consumed through [`attrib_core::DifferentiableModel`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod gradcam;
mod gradcam_plus_plus;
mod gradient;
mod penultimate;
mod postprocess;
mod saliency;
mod score;
mod smooth;
mod visualization;

#[cfg(test)]
pub(crate) mod testing;

pub use gradcam::{Gradcam, GradcamConfig};
pub use gradcam_plus_plus::GradcamPlusPlus;
pub use gradient::{extract, Extraction};
pub use penultimate::{augment, locate, LayerHint};
pub use postprocess::{
    broadcast_channels, postprocess, reduce_channels, standardize, zoom, ActivationModifier,
    ChannelReduction, STANDARDIZE_EPSILON,
};
pub use saliency::{Saliency, SaliencyConfig};
pub use score::{
    resolve_scores, BinaryScore, CategoricalScore, CustomScore, Objective, Score, Scores,
};
pub use smooth::{Aggregation, RunningMoments, SmoothGrad};
pub use visualization::{ModelRef, ModelVisualization};
