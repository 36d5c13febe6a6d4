//! # attrib_models
//!
//! Burn-backed reference networks for attrib-rs.
//!
//! [`ConvNet`] is a small convolutional image classifier with any number
//! of image inputs and output heads. It implements
//! [`attrib_core::DifferentiableModel`] on any burn
//! [`AutodiffBackend`](burn::tensor::backend::AutodiffBackend), so the
//! attribution engine can explain it end to end.
//!
//! [`ReplaceToLinear`] is the usual model modifier applied before
//! computing attributions.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod convert;
pub mod convnet;
pub mod error;
pub mod modifier;

pub use convnet::{ConvNet, ConvNetConfig, ConvNetTape, ImageShape, OutputActivation};
pub use error::{ModelError, Result};
pub use modifier::ReplaceToLinear;
