//! Vanilla saliency and SmoothGrad.
//!
//! Based on "Deep Inside Convolutional Networks: Visualising Image
//! Classification Models and Saliency Maps" by Simonyan et al. (2013), and
//! "SmoothGrad: removing noise by adding noise" by Smilkov et al. (2017).

use std::ops::ControlFlow;

use attrib_core::{
    DifferentiableModel, GradientTarget, ModelModifier, OneOrMany, Result, Seed, SeedInputs,
    UnconnectedGradients,
};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::gradient::extract;
use crate::postprocess::{reduce_channels, standardize, ActivationModifier, ChannelReduction};
use crate::score::Scores;
use crate::smooth::Aggregation;
use crate::visualization::{smoother, ModelVisualization};

/// Configuration for [`Saliency`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyConfig {
    /// Number of noisy trials; 0 or 1 computes plain gradients.
    pub smooth_samples: usize,
    /// Noise standard deviation relative to each example's value range.
    pub smooth_noise: f32,
    /// How trial maps are combined.
    pub smooth_aggregation: Aggregation,
    /// Seed of the noise draws.
    pub noise_seed: Option<Seed>,
    /// Keep the channel axis instead of taking the max over channels.
    pub keepdims: bool,
    /// Applied to each trial's gradients before they are combined.
    pub gradient_modifier: Option<ActivationModifier>,
    /// Rescale each map to `[0, 1]`.
    pub standardize: bool,
    /// Run the model in training mode.
    pub training: bool,
    /// Gradient for inputs the scores do not reach.
    pub unconnected_gradients: UnconnectedGradients,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            smooth_samples: 1,
            smooth_noise: 0.20,
            smooth_aggregation: Aggregation::Mean,
            noise_seed: None,
            keepdims: false,
            gradient_modifier: Some(ActivationModifier::Abs),
            standardize: true,
            training: false,
            unconnected_gradients: UnconnectedGradients::Zero,
        }
    }
}

impl SaliencyConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable SmoothGrad with `samples` trials at relative noise `noise`.
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

    /// Keep the channel axis.
    #[must_use]
    pub fn with_keepdims(mut self, keepdims: bool) -> Self {
        self.keepdims = keepdims;
        self
    }

    /// Set the gradient modifier; `None` keeps signed gradients.
    #[must_use]
    pub fn with_gradient_modifier(mut self, modifier: Option<ActivationModifier>) -> Self {
        self.gradient_modifier = modifier;
        self
    }

    /// Enable or disable standardization.
    #[must_use]
    pub fn with_standardize(mut self, standardize: bool) -> Self {
        self.standardize = standardize;
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

/// Saliency maps: gradients of the scores with respect to the inputs.
///
/// # Example
///
/// ```rust,ignore
/// use attrib_explain::{Saliency, SaliencyConfig, Score};
///
/// let saliency = Saliency::new(model);
/// let map = saliency.compute(Score::categorical(0), image, &SaliencyConfig::default())?;
/// ```
#[derive(Debug)]
pub struct Saliency<'a, M> {
    vis: ModelVisualization<'a, M>,
}

impl<'a, M: DifferentiableModel> Saliency<'a, M> {
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

    /// Compute one saliency map per model input.
    ///
    /// A single map is returned when the model has one input and
    /// `seed_input` was not a list.
    pub fn compute(
        &self,
        score: impl Into<Scores>,
        seed_input: impl Into<SeedInputs>,
        config: &SaliencyConfig,
    ) -> Result<OneOrMany<ArrayD<f32>>> {
        self.compute_with_observer(score, seed_input, config, |_, _| ControlFlow::Continue(()))
    }

    /// Like [`Saliency::compute`], reporting smoothing progress to `observer`.
    pub fn compute_with_observer<O>(
        &self,
        score: impl Into<Scores>,
        seed_input: impl Into<SeedInputs>,
        config: &SaliencyConfig,
        observer: O,
    ) -> Result<OneOrMany<ArrayD<f32>>>
    where
        O: FnMut(usize, usize) -> ControlFlow<()>,
    {
        let scores = self.vis.prepare_scores(score.into())?;
        let (inputs, was_many) = self.vis.prepare_inputs(seed_input.into())?;
        let model = self.vis.model();
        let _span = tracing::debug_span!(
            "saliency",
            n_inputs = inputs.len(),
            samples = config.smooth_samples
        )
        .entered();

        let smooth = smoother(
            config.smooth_samples,
            config.smooth_noise,
            config.noise_seed,
            config.smooth_aggregation,
        );
        let grads = smooth.run_with_observer(
            &inputs,
            |noisy| {
                let mut grads = extract(
                    model,
                    noisy,
                    &scores,
                    GradientTarget::Inputs,
                    config.training,
                    config.unconnected_gradients,
                )?
                .gradients;
                if let Some(modifier) = &config.gradient_modifier {
                    grads.iter_mut().for_each(|g| modifier.apply(g));
                }
                Ok(grads)
            },
            observer,
        )?;

        let maps = grads
            .into_iter()
            .map(|g| {
                let g = if config.keepdims {
                    g
                } else {
                    reduce_channels(g, ChannelReduction::Max)
                };
                if config.standardize {
                    standardize(g)
                } else {
                    g
                }
            })
            .collect();
        Ok(OneOrMany::restore(maps, was_many))
    }
}
