//! Grad-CAM++.
//!
//! Based on "Grad-CAM++: Improved Visual Explanations for Deep
//! Convolutional Networks" by Chattopadhyay et al. (2018).

use std::ops::ControlFlow;

use attrib_core::{DifferentiableModel, ModelModifier, OneOrMany, Result, SeedInputs, VisError};
use ndarray::{Array1, Array2, ArrayD, Axis, Zip};

use crate::gradcam::{compute_cam, flatten_spatial, watched, weighted_channel_sum, GradcamConfig};
use crate::gradient::Extraction;
use crate::postprocess::ActivationModifier;
use crate::score::Scores;
use crate::visualization::ModelVisualization;

/// Grad-CAM++ visualizer.
///
/// Weights each position of the layer activation with higher order
/// gradient terms of the exponentiated score, which localizes multiple
/// occurrences of a class better than the plain gradient mean.
#[derive(Debug)]
pub struct GradcamPlusPlus<'a, M> {
    vis: ModelVisualization<'a, M>,
}

impl<'a, M: DifferentiableModel> GradcamPlusPlus<'a, M> {
    /// Explain `model`, taking ownership of it.
    pub fn new(model: M) -> Self {
        Self {
            vis: ModelVisualization::owned(model),
        }
    }

    /// Explain the caller's model.
    pub fn borrowed(model: &'a mut M) -> Self {
        Self {
            vis: ModelVisualization::borrowed(model),
        }
    }

    /// Apply `modifiers` first; see [`ModelVisualization::with_modifiers`].
    pub fn with_modifiers(
        model: &'a mut M,
        modifiers: &[&dyn ModelModifier<M>],
        clone: bool,
    ) -> Result<Self>
    where
        M: Clone,
    {
        Ok(Self {
            vis: ModelVisualization::with_modifiers(model, modifiers, clone)?,
        })
    }

    /// The explained model.
    pub fn model(&self) -> &M {
        self.vis.model()
    }

    /// Compute class activation maps; see [`crate::Gradcam::compute`].
    pub fn compute(
        &self,
        score: impl Into<Scores>,
        seed_input: impl Into<SeedInputs>,
        config: &GradcamConfig,
    ) -> Result<OneOrMany<ArrayD<f32>>> {
        self.compute_with_observer(score, seed_input, config, |_, _| ControlFlow::Continue(()))
    }

    /// Like [`GradcamPlusPlus::compute`], reporting smoothing progress.
    pub fn compute_with_observer<O>(
        &self,
        score: impl Into<Scores>,
        seed_input: impl Into<SeedInputs>,
        config: &GradcamConfig,
        observer: O,
    ) -> Result<OneOrMany<ArrayD<f32>>>
    where
        O: FnMut(usize, usize) -> ControlFlow<()>,
    {
        compute_cam(
            &self.vis,
            score.into(),
            seed_input.into(),
            config,
            observer,
            gradcam_plus_plus_map,
        )
    }
}

/// Raw Grad-CAM++ map of one extraction.
fn gradcam_plus_plus_map(
    extraction: &Extraction,
    activation_modifier: Option<&ActivationModifier>,
) -> Result<ArrayD<f32>> {
    let (activation, gradient) = watched(extraction)?;
    let act = flatten_spatial(activation)?;
    let grad = flatten_spatial(gradient)?;
    let (batch, _, channels) = act.dim();

    // exp of the summed score of every output, one factor per example
    let mut exp_score = Array1::<f32>::zeros(batch);
    for values in &extraction.score_values {
        if values.len() != batch {
            return Err(VisError::ShapeMismatch(format!(
                "{} score values for a batch of {batch}",
                values.len()
            )));
        }
        Zip::from(&mut exp_score)
            .and(values)
            .for_each(|s, &v| *s += v.exp());
    }

    let global_sum = act.sum_axis(Axis(1));
    let mut weights = Array2::<f32>::zeros((batch, channels));
    for b in 0..batch {
        let g = grad.index_axis(Axis(0), b);
        let first = g.mapv(|v| exp_score[b] * v);
        let second = &first * &g;
        let third = &second * &g;

        let mut alphas = second.clone();
        Zip::from(&mut alphas)
            .and(&third)
            .and_broadcast(&global_sum.row(b))
            .for_each(|alpha, &t, &sum| {
                let s = *alpha;
                let mut denom = 2.0 * s + t * sum;
                if s == 0.0 {
                    denom += 1.0;
                }
                *alpha = s / denom;
            });
        let norm = alphas
            .sum_axis(Axis(0))
            .mapv(|n| if n == 0.0 { 1.0 } else { n });
        alphas /= &norm;

        let mut linear = first;
        if let Some(modifier) = activation_modifier {
            linear.mapv_inplace(|v| modifier.apply_scalar(v));
        }
        weights.row_mut(b).assign(&(&linear * &alphas).sum_axis(Axis(0)));
    }
    weighted_channel_sum(activation, &act.view(), &weights)
}
