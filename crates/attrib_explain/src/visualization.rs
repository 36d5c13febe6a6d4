//! Model ownership shared by the visualization entry points.

use std::ops::{Deref, DerefMut};

use attrib_core::{DifferentiableModel, ModelModifier, Result, Seed, SeedInputs, VisError};
use ndarray::ArrayD;

use crate::score::{resolve_scores, Score, Scores};
use crate::smooth::{Aggregation, SmoothGrad};

/// A model owned by a visualizer, or borrowed from the caller.
#[derive(Debug)]
pub enum ModelRef<'a, M> {
    /// A private copy; changes never reach the caller.
    Owned(M),
    /// The caller's model; modifier changes persist after the call.
    Borrowed(&'a mut M),
}

impl<M> ModelRef<'_, M> {
    /// Whether the visualizer owns its model.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl<M> Deref for ModelRef<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        match self {
            Self::Owned(model) => model,
            Self::Borrowed(model) => model,
        }
    }
}

impl<M> DerefMut for ModelRef<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        match self {
            Self::Owned(model) => model,
            Self::Borrowed(model) => model,
        }
    }
}

/// Holds the (possibly modified) model a visualizer explains.
#[derive(Debug)]
pub struct ModelVisualization<'a, M> {
    model: ModelRef<'a, M>,
}

impl<'a, M: DifferentiableModel> ModelVisualization<'a, M> {
    /// Take ownership of `model`.
    pub fn owned(model: M) -> Self {
        Self {
            model: ModelRef::Owned(model),
        }
    }

    /// Borrow `model` without modifying it.
    pub fn borrowed(model: &'a mut M) -> Self {
        Self {
            model: ModelRef::Borrowed(model),
        }
    }

    /// Apply `modifiers` in order before any attribution is computed.
    ///
    /// With `clone` set and at least one modifier, the modifiers run on a
    /// private copy. Otherwise they run on `model` itself and their effect
    /// stays visible to the caller after this visualizer is dropped.
    pub fn with_modifiers(
        model: &'a mut M,
        modifiers: &[&dyn ModelModifier<M>],
        clone: bool,
    ) -> Result<Self>
    where
        M: Clone,
    {
        let mut target = if clone && !modifiers.is_empty() {
            ModelRef::Owned(model.clone())
        } else {
            ModelRef::Borrowed(model)
        };
        for modifier in modifiers {
            tracing::debug!(
                modifier = modifier.name(),
                in_place = !target.is_owned(),
                "applying model modifier"
            );
            modifier.modify(&mut *target)?;
        }
        Ok(Self { model: target })
    }

    /// The model attribution is computed on.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Whether the model is a private copy.
    pub fn owns_model(&self) -> bool {
        self.model.is_owned()
    }

    /// Normalize and validate the seed inputs against the model.
    ///
    /// Returns the batched inputs and whether the caller used the list form.
    pub(crate) fn prepare_inputs(
        &self,
        seed_input: SeedInputs,
    ) -> Result<(Vec<ArrayD<f32>>, bool)> {
        let specs = self.model.inputs();
        let (inputs, was_many) = seed_input.normalize(specs.len(), "seed input")?;
        let inputs = inputs
            .into_iter()
            .zip(specs)
            .enumerate()
            .map(|(i, (x, spec))| spec.conform(i, x))
            .collect::<Result<Vec<_>>>()?;

        let batch = inputs.first().map_or(0, |x| x.shape()[0]);
        if let Some(bad) = inputs.iter().position(|x| x.shape()[0] != batch) {
            return Err(VisError::InvalidSeedInput {
                index: bad,
                expected: format!("batch size {batch}"),
                got: format!("batch size {}", inputs[bad].shape()[0]),
            });
        }
        Ok((inputs, was_many))
    }

    /// Validate the scores against the model outputs.
    pub(crate) fn prepare_scores(&self, scores: Scores) -> Result<Vec<Score>> {
        resolve_scores(scores, self.model.outputs().len())
    }
}

/// Build the smoothing driver for a call.
pub(crate) fn smoother(
    samples: usize,
    noise: f32,
    seed: Option<Seed>,
    aggregation: Aggregation,
) -> SmoothGrad {
    let smooth = SmoothGrad::new(samples, noise).with_aggregation(aggregation);
    match seed {
        Some(seed) => smooth.with_seed(seed),
        None => smooth,
    }
}
