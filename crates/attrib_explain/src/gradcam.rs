//! Gradient-weighted Class Activation Mapping.
//!
//! Based on "Grad-CAM: Visual Explanations from Deep Networks via
//! Gradient-based Localization" by Selvaraju et al. (2017).
//!
//! The activation of a spatial layer is weighted per channel by the
//! spatial mean of the score gradient, summed over channels, and resampled
//! to each input's resolution.

use std::ops::ControlFlow;

use attrib_core::{
    DifferentiableModel, GradientTarget, ModelModifier, OneOrMany, Result, Seed, SeedInputs,
    UnconnectedGradients, VisError,
};
use ndarray::{Array2, ArrayD, ArrayView3, Axis, CowArray, Ix3, IxDyn};
use serde::{Deserialize, Serialize};

use crate::gradient::{extract, Extraction};
use crate::penultimate::{augment, LayerHint};
use crate::postprocess::{postprocess, standardize, ActivationModifier};
use crate::score::Scores;
use crate::smooth::Aggregation;
use crate::visualization::{smoother, ModelVisualization};

/// Configuration for [`Gradcam`] and [`crate::GradcamPlusPlus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradcamConfig {
    /// Layer to compute the map at; the last layer when unset.
    pub penultimate_layer: Option<LayerHint>,
    /// Search backward for a spatial layer when the hinted one is not.
    pub seek_penultimate_conv_layer: bool,
    /// Applied to the raw map (and, for Grad-CAM++, to the gradient weights).
    pub activation_modifier: Option<ActivationModifier>,
    /// Resample the map to each input's resolution.
    pub expand_cam: bool,
    /// Rescale each map to `[0, 1]`.
    pub standardize_cam: bool,
    /// Repeat the map across each input's channels.
    pub keepdims: bool,
    /// Number of noisy trials; 0 or 1 disables smoothing.
    pub smooth_samples: usize,
    /// Noise standard deviation relative to each example's value range.
    pub smooth_noise: f32,
    /// How trial maps are combined.
    pub smooth_aggregation: Aggregation,
    /// Seed of the noise draws.
    pub noise_seed: Option<Seed>,
    /// Run the model in training mode.
    pub training: bool,
    /// Gradient for a layer the scores do not reach.
    pub unconnected_gradients: UnconnectedGradients,
}

impl Default for GradcamConfig {
    fn default() -> Self {
        Self {
            penultimate_layer: None,
            seek_penultimate_conv_layer: true,
            activation_modifier: Some(ActivationModifier::Relu),
            expand_cam: true,
            standardize_cam: true,
            keepdims: false,
            smooth_samples: 1,
            smooth_noise: 0.20,
            smooth_aggregation: Aggregation::Mean,
            noise_seed: None,
            training: false,
            unconnected_gradients: UnconnectedGradients::Zero,
        }
    }
}

impl GradcamConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the map at `layer`.
    #[must_use]
    pub fn with_penultimate_layer(mut self, layer: impl Into<LayerHint>) -> Self {
        self.penultimate_layer = Some(layer.into());
        self
    }

    /// Enable or disable the backward search for a spatial layer.
    #[must_use]
    pub fn with_seek_penultimate_conv_layer(mut self, seek: bool) -> Self {
        self.seek_penultimate_conv_layer = seek;
        self
    }

    /// Set the activation modifier; `None` keeps the signed map.
    #[must_use]
    pub fn with_activation_modifier(mut self, modifier: Option<ActivationModifier>) -> Self {
        self.activation_modifier = modifier;
        self
    }

    /// Enable or disable resampling to the input resolution.
    #[must_use]
    pub fn with_expand_cam(mut self, expand: bool) -> Self {
        self.expand_cam = expand;
        self
    }

    /// Enable or disable standardization.
    #[must_use]
    pub fn with_standardize_cam(mut self, standardize: bool) -> Self {
        self.standardize_cam = standardize;
        self
    }

    /// Repeat the map across input channels.
    #[must_use]
    pub fn with_keepdims(mut self, keepdims: bool) -> Self {
        self.keepdims = keepdims;
        self
    }

    /// Average the map over `samples` noisy trials at relative noise `noise`.
    #[must_use]
    pub fn with_smoothing(mut self, samples: usize, noise: f32) -> Self {
        self.smooth_samples = samples;
        self.smooth_noise = noise;
        self
    }

    /// Set how trial maps are combined.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.smooth_aggregation = aggregation;
        self
    }

    /// Fix the noise seed.
    #[must_use]
    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.noise_seed = Some(seed);
        self
    }

    /// Run the model in training mode.
    #[must_use]
    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    /// Set the unconnected gradient policy.
    #[must_use]
    pub fn with_unconnected_gradients(mut self, policy: UnconnectedGradients) -> Self {
        self.unconnected_gradients = policy;
        self
    }
}

/// Grad-CAM visualizer.
#[derive(Debug)]
pub struct Gradcam<'a, M> {
    vis: ModelVisualization<'a, M>,
}

impl<'a, M: DifferentiableModel> Gradcam<'a, M> {
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

    /// Compute class activation maps.
    ///
    /// With `expand_cam`, one map per model input is returned, resampled to
    /// that input's spatial shape. Without it, the single map at the
    /// layer's resolution is returned.
    ///
    /// # Errors
    ///
    /// [`VisError::InvalidArgument`] for bad scores or seed inputs and when
    /// no spatial layer can be found, before the model is run.
    pub fn compute(
        &self,
        score: impl Into<Scores>,
        seed_input: impl Into<SeedInputs>,
        config: &GradcamConfig,
    ) -> Result<OneOrMany<ArrayD<f32>>> {
        self.compute_with_observer(score, seed_input, config, |_, _| ControlFlow::Continue(()))
    }

    /// Like [`Gradcam::compute`], reporting smoothing progress to `observer`.
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
            |extraction, _| gradcam_map(extraction),
        )
    }
}

/// Shared driver of the class activation methods.
///
/// `cam` turns one extraction into a raw map of shape `(batch, spatial..)`.
pub(crate) fn compute_cam<M, O, F>(
    vis: &ModelVisualization<'_, M>,
    scores: Scores,
    seed_input: SeedInputs,
    config: &GradcamConfig,
    observer: O,
    cam: F,
) -> Result<OneOrMany<ArrayD<f32>>>
where
    M: DifferentiableModel,
    O: FnMut(usize, usize) -> ControlFlow<()>,
    F: Fn(&Extraction, Option<&ActivationModifier>) -> Result<ArrayD<f32>>,
{
    let scores = vis.prepare_scores(scores)?;
    let (inputs, was_many) = vis.prepare_inputs(seed_input)?;
    let model = vis.model();
    let (augmented, layer) = augment(
        model,
        config.penultimate_layer.as_ref(),
        config.seek_penultimate_conv_layer,
    )?;
    let target = GradientTarget::Output(model.outputs().len());
    let _span = tracing::debug_span!("cam", layer = %layer.name, samples = config.smooth_samples)
        .entered();

    let smooth = smoother(
        config.smooth_samples,
        config.smooth_noise,
        config.noise_seed,
        config.smooth_aggregation,
    );
    let activation = config.activation_modifier.as_ref();
    let mut cams = smooth.run_with_observer(
        &inputs,
        |noisy| {
            let extraction = extract(
                &augmented,
                noisy,
                &scores,
                target,
                config.training,
                config.unconnected_gradients,
            )?;
            Ok(vec![cam(&extraction, activation)?])
        },
        observer,
    )?;
    let raw = cams
        .pop()
        .ok_or_else(|| VisError::ShapeMismatch("no map was produced".to_string()))?;

    if !config.expand_cam {
        let mut map = raw;
        if let Some(activation) = activation {
            activation.apply(&mut map);
        }
        if config.standardize_cam {
            map = standardize(map);
        }
        return Ok(OneOrMany::Single(map));
    }

    let targets: Vec<Vec<usize>> = inputs.iter().map(|x| x.shape().to_vec()).collect();
    let maps = postprocess(&raw, &targets, activation, config.standardize_cam, config.keepdims)?;
    Ok(OneOrMany::restore(maps, was_many))
}

/// View a `(batch, spatial.., channels)` array as `(batch, positions, channels)`.
pub(crate) fn flatten_spatial(x: &ArrayD<f32>) -> Result<CowArray<'_, f32, Ix3>> {
    if x.ndim() < 3 {
        return Err(VisError::ShapeMismatch(format!(
            "expected a spatial activation (batch, spatial.., channels), got {:?}",
            x.shape()
        )));
    }
    let batch = x.shape()[0];
    let channels = x.shape()[x.ndim() - 1];
    let positions = x.shape()[1..x.ndim() - 1].iter().product::<usize>();
    x.to_shape((batch, positions, channels))
        .map_err(|e| VisError::ShapeMismatch(e.to_string()))
}

/// Channel-weighted sum of the activation, shaped like its spatial axes.
pub(crate) fn weighted_channel_sum(
    activation: &ArrayD<f32>,
    act: &ArrayView3<'_, f32>,
    weights: &Array2<f32>,
) -> Result<ArrayD<f32>> {
    let (batch, positions, _) = act.dim();
    let mut cam = Array2::<f32>::zeros((batch, positions));
    for (b, mut row) in cam.axis_iter_mut(Axis(0)).enumerate() {
        row.assign(&act.index_axis(Axis(0), b).dot(&weights.row(b)));
    }
    let shape = &activation.shape()[..activation.ndim() - 1];
    Ok(cam
        .into_dyn()
        .to_shape(IxDyn(shape))
        .map_err(|e| VisError::ShapeMismatch(e.to_string()))?
        .into_owned())
}

/// The watched layer activation and its gradient.
pub(crate) fn watched(extraction: &Extraction) -> Result<(&ArrayD<f32>, &ArrayD<f32>)> {
    match (extraction.activations.first(), extraction.gradients.first()) {
        (Some(activation), Some(gradient)) if activation.shape() == gradient.shape() => {
            Ok((activation, gradient))
        }
        _ => Err(VisError::ShapeMismatch(
            "layer activation and gradient do not match".to_string(),
        )),
    }
}

/// Raw Grad-CAM map of one extraction.
fn gradcam_map(extraction: &Extraction) -> Result<ArrayD<f32>> {
    let (activation, gradient) = watched(extraction)?;
    let act = flatten_spatial(activation)?;
    let grad = flatten_spatial(gradient)?;
    let weights = grad
        .mean_axis(Axis(1))
        .ok_or_else(|| VisError::ShapeMismatch("layer has no spatial positions".to_string()))?;
    weighted_channel_sum(activation, &act.view(), &weights)
}
