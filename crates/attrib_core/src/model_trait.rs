//! The differentiable model interface consumed by the attribution engine.
//!
//! The engine never differentiates anything itself. A model records a
//! forward pass on a [`GradientTape`] and the tape answers one
//! vector-Jacobian product: given the derivative of the objective with
//! respect to each model output (the cotangents), it returns the derivative
//! with respect to the watched tensors.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shape::{LayerId, LayerSpec, TensorSpec};
use crate::tensor::{FloatArray, Precision};

/// What gradients are taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientTarget {
    /// Every model input, in declaration order.
    Inputs,
    /// One model output, typically the extra activation output appended by
    /// [`DifferentiableModel::with_layer_output`].
    Output(usize),
}

/// Gradient returned for a watched tensor the objective does not reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnconnectedGradients {
    /// Fill with zeros, so the resulting map is well defined.
    #[default]
    Zero,
    /// Leave undefined; the engine reports it as an error.
    None,
}

/// A recorded forward pass.
///
/// The tape owns whatever the model retained to run the backward pass.
/// [`GradientTape::gradient`] consumes it; dropping it on an error path
/// releases the same resources.
pub trait GradientTape {
    /// Model outputs of the recorded pass, in declaration order, in the
    /// model's compute type.
    fn outputs(&self) -> &[FloatArray];

    /// Backpropagate `cotangents` and return gradients for `target`.
    ///
    /// `cotangents` holds one entry per scored output, starting at output 0;
    /// outputs beyond `cotangents.len()` receive no cotangent. The returned
    /// list has one entry per watched tensor, `None` meaning unconnected
    /// under [`UnconnectedGradients::None`].
    fn gradient(
        self,
        cotangents: &[ArrayD<f32>],
        target: GradientTarget,
        policy: UnconnectedGradients,
    ) -> Result<Vec<Option<FloatArray>>>;
}

/// A model whose outputs can be differentiated with respect to its inputs
/// or its intermediate activations.
pub trait DifferentiableModel {
    /// Tape type recorded by [`DifferentiableModel::record`].
    type Tape: GradientTape;

    /// Ordered input specs.
    fn inputs(&self) -> &[TensorSpec];

    /// Ordered output specs.
    fn outputs(&self) -> &[TensorSpec];

    /// Ordered layer sequence, in execution order.
    fn layers(&self) -> Vec<LayerSpec>;

    /// Precision the model computes in.
    fn precision(&self) -> Precision {
        Precision::full()
    }

    /// Run a forward pass with gradient tracking.
    fn record(&self, inputs: &[ArrayD<f32>], training: bool) -> Result<Self::Tape>;

    /// Build a model whose outputs are this model's outputs followed by the
    /// activation of `layer`.
    fn with_layer_output(&self, layer: LayerId) -> Result<Self>
    where
        Self: Sized;
}

/// A structural transformation applied to a model before attribution.
///
/// Modifiers work in place. Whether the caller's model or a private clone
/// is modified is decided by whoever applies them.
pub trait ModelModifier<M> {
    /// Apply the transformation.
    fn modify(&self, model: &mut M) -> Result<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "ModelModifier"
    }
}

impl<M, F> ModelModifier<M> for F
where
    F: Fn(&mut M) -> Result<()>,
{
    fn modify(&self, model: &mut M) -> Result<()> {
        self(model)
    }

    fn name(&self) -> &str {
        "closure"
    }
}
