//! # attrib_core
//!
//! Core types and traits for attrib-rs attribution maps.
//!
//! This crate provides:
//! - [`DifferentiableModel`] and [`GradientTape`], the interface a model
//!   implements to be explained
//! - [`ModelModifier`] for structural model transformations
//! - [`OneOrMany`] for single/list argument normalization
//! - [`TensorSpec`] and [`LayerSpec`] shape metadata
//! - [`Precision`], [`DType`] and [`FloatArray`] for mixed precision models
//! - [`Seed`] for reproducible noise
//! - Error types and common utilities
//!
//! ## Shape Convention
//!
//! Images follow the channels-last convention `(B, H, W, C)`:
//! - `B`: Batch size
//! - `H`, `W`: Spatial axes (any number of them)
//! - `C`: Channels
//!
//! Specs describe one example, without the batch axis.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod arity;
mod error;
mod model_trait;
mod seed;
mod shape;
mod tensor;

pub use arity::{OneOrMany, SeedInputs};
pub use error::{Result, VisError};
pub use model_trait::{
    DifferentiableModel, GradientTape, GradientTarget, ModelModifier, UnconnectedGradients,
};
pub use seed::Seed;
pub use shape::{format_dims, LayerId, LayerSpec, TensorSpec};
pub use tensor::{DType, FloatArray, Precision};
