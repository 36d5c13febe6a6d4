//! # attrib
//!
//! Gradient-based attribution maps for differentiable models in Rust.
//!
//! attrib-rs explains which parts of an input drive a model's prediction:
//!
//! - **Saliency**: input gradients, optionally averaged over noisy copies
//!   of the input (SmoothGrad)
//! - **Grad-CAM / Grad-CAM++**: class activation maps computed at a
//!   convolutional layer and resized to the input resolution
//! - **Scores**: categorical, binary, custom and inactive objectives, one
//!   per model output
//! - **Models**: any type implementing [`core::DifferentiableModel`]; burn
//!   reference networks are included
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use attrib::prelude::*;
//! use burn_autodiff::Autodiff;
//! use burn_ndarray::NdArray;
//!
//! type B = Autodiff<NdArray>;
//!
//! let mut model = ConvNetConfig::new(32, 32, 3, 10).init::<B>(&Default::default())?;
//! let image = ndarray::ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 32, 32, 3]));
//!
//! let saliency = Saliency::with_modifiers(&mut model, &[&ReplaceToLinear], true)?;
//! let map = saliency.compute(Score::categorical(3), image.clone(), &SaliencyConfig::default())?;
//!
//! let cam = Gradcam::borrowed(&mut model)
//!     .compute(Score::categorical(3), image, &GradcamConfig::default())?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export all crates
pub use attrib_core as core;
pub use attrib_explain as explain;
pub use attrib_models as models;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use attrib::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use attrib_core::{
        DifferentiableModel, GradientTape, GradientTarget, LayerId, LayerSpec, ModelModifier,
        OneOrMany, Precision, Result, Seed, SeedInputs, TensorSpec, UnconnectedGradients,
        VisError,
    };

    // Attribution
    pub use attrib_explain::{
        ActivationModifier, Aggregation, BinaryScore, CategoricalScore, CustomScore, Gradcam,
        GradcamConfig, GradcamPlusPlus, LayerHint, Saliency, SaliencyConfig, Score, Scores,
        SmoothGrad,
    };

    // Models
    pub use attrib_models::{ConvNet, ConvNetConfig, OutputActivation, ReplaceToLinear};
}
