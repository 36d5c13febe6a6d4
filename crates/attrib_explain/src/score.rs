//! Scores: reduce a model output to one objective value per example.
//!
//! Besides the values, every score reports the derivative of the summed
//! objective with respect to the output it consumed. That cotangent is what
//! the gradient tape backpropagates.

use std::fmt;
use std::sync::Arc;

use attrib_core::{OneOrMany, Result, VisError};
use ndarray::{Array1, ArrayD, ArrayViewD, Axis, IxDyn};

/// Objective values and their cotangent for one model output.
#[derive(Debug, Clone)]
pub struct Objective {
    /// One value per example.
    pub values: Array1<f32>,
    /// Derivative of `values.sum()` with respect to the output.
    pub cotangent: ArrayD<f32>,
}

/// Selects one output unit per example.
///
/// Outputs must have rank >= 2 with units on the last axis. Intermediate
/// axes, if any, are averaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoricalScore {
    indices: Vec<usize>,
}

impl CategoricalScore {
    /// Score the same unit for every example.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            indices: vec![index],
        }
    }

    /// Score one unit per example.
    #[must_use]
    pub fn per_example(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    /// The requested unit indices.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn evaluate(&self, output: ArrayViewD<'_, f32>) -> Result<Objective> {
        if output.ndim() < 2 {
            return Err(VisError::invalid(format!(
                "CategoricalScore needs an output of rank 2 or more, got shape {:?}",
                output.shape()
            )));
        }
        let batch = output.shape()[0];
        let units = output.shape()[output.ndim() - 1];
        let indices = broadcast_targets(&self.indices, batch, "CategoricalScore indices")?;
        if let Some(bad) = indices.iter().find(|&&i| i >= units) {
            return Err(VisError::invalid(format!(
                "CategoricalScore index {bad} is out of range for {units} units"
            )));
        }

        let unit_axis = Axis(output.ndim() - 2);
        let count = output.shape()[1..output.ndim() - 1].iter().product::<usize>() as f32;
        let mut values = Array1::zeros(batch);
        let mut cotangent = ArrayD::zeros(output.raw_dim());
        for (i, &index) in indices.iter().enumerate() {
            let example = output.index_axis(Axis(0), i);
            values[i] = example.index_axis(unit_axis, index).sum() / count;

            let mut grad = cotangent.index_axis_mut(Axis(0), i);
            grad.index_axis_mut(unit_axis, index).fill(1.0 / count);
        }
        Ok(Objective { values, cotangent })
    }
}

/// Scores a single-logit output, negated where the target is `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryScore {
    targets: Vec<bool>,
}

impl BinaryScore {
    /// Use the same target for every example.
    #[must_use]
    pub fn new(target: bool) -> Self {
        Self {
            targets: vec![target],
        }
    }

    /// Use one target per example.
    #[must_use]
    pub fn per_example(targets: Vec<bool>) -> Self {
        Self { targets }
    }

    fn evaluate(&self, output: ArrayViewD<'_, f32>) -> Result<Objective> {
        let single_unit = match output.ndim() {
            1 => true,
            2 => output.shape()[1] == 1,
            _ => false,
        };
        if !single_unit {
            return Err(VisError::invalid(format!(
                "BinaryScore needs an output of shape (batch,) or (batch, 1), got {:?}",
                output.shape()
            )));
        }
        let batch = output.shape()[0];
        let targets = broadcast_targets(&self.targets, batch, "BinaryScore targets")?;

        let mut values = Array1::zeros(batch);
        let mut cotangent = ArrayD::zeros(output.raw_dim());
        for (i, &target) in targets.iter().enumerate() {
            let sign = if target { 1.0 } else { -1.0 };
            values[i] = sign * output.index_axis(Axis(0), i).sum();
            cotangent.index_axis_mut(Axis(0), i).fill(sign);
        }
        Ok(Objective { values, cotangent })
    }
}

type ValueFn = dyn Fn(ArrayViewD<'_, f32>) -> Result<Array1<f32>> + Send + Sync;
type GradientFn = dyn Fn(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> + Send + Sync;

/// An arbitrary score function.
///
/// Without an analytic gradient, the cotangent is estimated by central
/// finite differences over the output elements. That costs two calls of
/// the value function per output element, each over the whole output, so
/// it grows quadratically with the output size and is only accurate to
/// the chosen step. Prefer [`CustomScore::with_gradient`] whenever the
/// derivative is known; the estimate is meant for small heads such as
/// class logits.
#[derive(Clone)]
pub struct CustomScore {
    name: String,
    value: Arc<ValueFn>,
    gradient: Option<Arc<GradientFn>>,
    step: f32,
}

impl CustomScore {
    /// Wrap a function returning one value per example.
    pub fn new<F>(name: impl Into<String>, value: F) -> Self
    where
        F: Fn(ArrayViewD<'_, f32>) -> Result<Array1<f32>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            value: Arc::new(value),
            gradient: None,
            step: 1e-3,
        }
    }

    /// Supply the derivative of the summed values with respect to the output.
    #[must_use]
    pub fn with_gradient<G>(mut self, gradient: G) -> Self
    where
        G: Fn(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> + Send + Sync + 'static,
    {
        self.gradient = Some(Arc::new(gradient));
        self
    }

    /// Relative step of the finite difference estimate.
    #[must_use]
    pub fn with_step(mut self, step: f32) -> Self {
        self.step = step;
        self
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, output: ArrayViewD<'_, f32>) -> Result<Objective> {
        let batch = output.shape().first().copied().unwrap_or(0);
        let values = (self.value)(output.view())?;
        if values.len() != batch {
            return Err(VisError::invalid(format!(
                "score `{}` returned {} values for a batch of {}",
                self.name,
                values.len(),
                batch
            )));
        }

        let cotangent = match &self.gradient {
            Some(gradient) => {
                let cotangent = gradient(output.view())?;
                if cotangent.shape() != output.shape() {
                    return Err(VisError::ShapeMismatch(format!(
                        "gradient of score `{}` has shape {:?}, output has {:?}",
                        self.name,
                        cotangent.shape(),
                        output.shape()
                    )));
                }
                cotangent
            }
            None => self.finite_difference(output)?,
        };
        Ok(Objective { values, cotangent })
    }

    fn finite_difference(&self, output: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        let shape = IxDyn(output.shape());
        let mut probe: Vec<f32> = output.iter().copied().collect();
        let mut cotangent = Vec::with_capacity(probe.len());

        let total = |data: &[f32]| -> Result<f64> {
            let view = ArrayViewD::from_shape(shape.clone(), data)
                .map_err(|e| VisError::ShapeMismatch(e.to_string()))?;
            Ok((self.value)(view)?.iter().map(|&v| f64::from(v)).sum())
        };

        for k in 0..probe.len() {
            let original = probe[k];
            let h = self.step * (1.0 + original.abs());
            probe[k] = original + h;
            let plus = total(&probe)?;
            probe[k] = original - h;
            let minus = total(&probe)?;
            probe[k] = original;
            cotangent.push(((plus - minus) / (2.0 * f64::from(h))) as f32);
        }
        ArrayD::from_shape_vec(shape, cotangent)
            .map_err(|e| VisError::ShapeMismatch(e.to_string()))
    }
}

impl fmt::Debug for CustomScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomScore")
            .field("name", &self.name)
            .field("analytic_gradient", &self.gradient.is_some())
            .field("step", &self.step)
            .finish()
    }
}

/// A rule reducing one model output to a scalar objective per example.
#[derive(Debug, Clone)]
pub enum Score {
    /// See [`CategoricalScore`].
    Categorical(CategoricalScore),
    /// See [`BinaryScore`].
    Binary(BinaryScore),
    /// Constant zero. Turns an output off while keeping one score per output.
    Inactive,
    /// See [`CustomScore`].
    Custom(CustomScore),
}

impl Score {
    /// Shorthand for a categorical score on one unit.
    #[must_use]
    pub fn categorical(index: usize) -> Self {
        Self::Categorical(CategoricalScore::new(index))
    }

    /// Shorthand for a binary score with one target.
    #[must_use]
    pub fn binary(target: bool) -> Self {
        Self::Binary(BinaryScore::new(target))
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Categorical(_) => "CategoricalScore",
            Self::Binary(_) => "BinaryScore",
            Self::Inactive => "InactiveScore",
            Self::Custom(score) => score.name(),
        }
    }

    /// Evaluate the score against one model output.
    pub fn evaluate(&self, output: ArrayViewD<'_, f32>) -> Result<Objective> {
        match self {
            Self::Categorical(score) => score.evaluate(output),
            Self::Binary(score) => score.evaluate(output),
            Self::Inactive => {
                let batch = output.shape().first().copied().unwrap_or(0);
                Ok(Objective {
                    values: Array1::zeros(batch),
                    cotangent: ArrayD::zeros(output.raw_dim()),
                })
            }
            Self::Custom(score) => score.evaluate(output),
        }
    }
}

impl From<CategoricalScore> for Score {
    fn from(score: CategoricalScore) -> Self {
        Self::Categorical(score)
    }
}

impl From<BinaryScore> for Score {
    fn from(score: BinaryScore) -> Self {
        Self::Binary(score)
    }
}

impl From<CustomScore> for Score {
    fn from(score: CustomScore) -> Self {
        Self::Custom(score)
    }
}

/// Score argument: one score, or one per model output.
pub type Scores = OneOrMany<Option<Score>>;

impl From<Score> for OneOrMany<Option<Score>> {
    fn from(score: Score) -> Self {
        Self::Single(Some(score))
    }
}

impl From<CategoricalScore> for OneOrMany<Option<Score>> {
    fn from(score: CategoricalScore) -> Self {
        Self::Single(Some(score.into()))
    }
}

impl From<BinaryScore> for OneOrMany<Option<Score>> {
    fn from(score: BinaryScore) -> Self {
        Self::Single(Some(score.into()))
    }
}

/// Validate scores against the model's output count.
///
/// A bare score is only accepted for a single-output model; a list must
/// have one score per output. Missing scores are rejected.
pub fn resolve_scores(scores: Scores, n_outputs: usize) -> Result<Vec<Score>> {
    let (scores, _) = scores.normalize(n_outputs, "score")?;
    Ok(scores)
}

fn broadcast_targets<T: Copy>(targets: &[T], batch: usize, what: &str) -> Result<Vec<T>> {
    match targets.len() {
        1 => Ok(vec![targets[0]; batch]),
        n if n == batch => Ok(targets.to_vec()),
        n => Err(VisError::invalid(format!(
            "{what} must have length 1 or the batch size {batch}, got {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Ix1};

    fn logits() -> ArrayD<f32> {
        array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn()
    }

    #[test]
    fn test_categorical_single_index() {
        let out = logits();
        let objective = Score::categorical(1).evaluate(out.view()).unwrap();
        assert_eq!(objective.values.to_vec(), vec![2.0, 5.0]);
        assert_eq!(
            objective.cotangent,
            array![[0.0f32, 1.0, 0.0], [0.0, 1.0, 0.0]].into_dyn()
        );
    }

    #[test]
    fn test_categorical_per_example() {
        let out = logits();
        let score = CategoricalScore::per_example(vec![0, 2]);
        let objective = Score::from(score).evaluate(out.view()).unwrap();
        assert_eq!(objective.values.to_vec(), vec![1.0, 6.0]);
    }

    #[test]
    fn test_categorical_averages_intermediate_axes() {
        let out = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![1.0f32, 10.0, 3.0, 20.0]).unwrap();
        let objective = Score::categorical(0).evaluate(out.view()).unwrap();
        assert_eq!(objective.values.to_vec(), vec![2.0]);
        assert_eq!(objective.cotangent[[0, 0, 0]], 0.5);
        assert_eq!(objective.cotangent[[0, 1, 1]], 0.0);
    }

    #[test]
    fn test_categorical_rejects_bad_arguments() {
        let out = logits();
        assert!(Score::categorical(3).evaluate(out.view()).is_err());
        let three = CategoricalScore::per_example(vec![0, 1, 2]);
        assert!(Score::from(three).evaluate(out.view()).is_err());
        let flat = ArrayD::<f32>::zeros(IxDyn(&[4]));
        assert!(Score::categorical(0).evaluate(flat.view()).is_err());
    }

    #[test]
    fn test_binary_negates_false_targets() {
        let out = array![[0.25f32], [0.75]].into_dyn();
        let score = BinaryScore::per_example(vec![true, false]);
        let objective = Score::from(score).evaluate(out.view()).unwrap();
        assert_eq!(objective.values.to_vec(), vec![0.25, -0.75]);
        assert_eq!(objective.cotangent, array![[1.0f32], [-1.0]].into_dyn());
    }

    #[test]
    fn test_binary_rejects_multi_unit_output() {
        let out = logits();
        assert!(Score::binary(true).evaluate(out.view()).is_err());
    }

    #[test]
    fn test_inactive_is_zero() {
        let out = logits();
        let objective = Score::Inactive.evaluate(out.view()).unwrap();
        assert_eq!(objective.values.to_vec(), vec![0.0, 0.0]);
        assert!(objective.cotangent.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_custom_score_finite_difference_matches_categorical() {
        let out = logits();
        let custom = CustomScore::new("second-unit", |output: ArrayViewD<'_, f32>| {
            Ok(output.index_axis(Axis(1), 1).iter().copied().collect())
        });
        let objective = Score::from(custom).evaluate(out.view()).unwrap();
        assert_eq!(objective.values.to_vec(), vec![2.0, 5.0]);
        for (got, expected) in objective
            .cotangent
            .iter()
            .zip(array![[0.0f32, 1.0, 0.0], [0.0, 1.0, 0.0]].iter())
        {
            assert!((got - expected).abs() < 1e-2, "{got} vs {expected}");
        }
    }

    #[test]
    fn test_custom_score_analytic_gradient_shape_checked() {
        let out = logits();
        let custom = CustomScore::new("sum", |output: ArrayViewD<'_, f32>| {
            output
                .sum_axis(Axis(1))
                .into_dimensionality::<Ix1>()
                .map_err(|e| VisError::ShapeMismatch(e.to_string()))
        })
        .with_gradient(|_| Ok(ArrayD::zeros(IxDyn(&[1]))));
        assert!(Score::from(custom).evaluate(out.view()).is_err());
    }

    #[test]
    fn test_custom_score_wrong_value_count() {
        let out = logits();
        let custom = CustomScore::new("scalar", |_| Ok(Array1::zeros(1)));
        assert!(Score::from(custom).evaluate(out.view()).is_err());
    }

    #[test]
    fn test_resolve_scores_cardinality() {
        assert!(resolve_scores(Score::categorical(0).into(), 1).is_ok());
        assert!(resolve_scores(vec![Score::categorical(0)].into(), 1).is_ok());
        assert!(resolve_scores(None::<Score>.into(), 1).is_err());
        assert!(resolve_scores(vec![None::<Score>].into(), 1).is_err());
        assert!(resolve_scores(Score::categorical(0).into(), 2).is_err());
        assert!(resolve_scores(vec![Score::categorical(0)].into(), 2).is_err());
        assert!(resolve_scores(vec![Some(Score::categorical(0)), None].into(), 2).is_err());
        assert!(resolve_scores(vec![Score::categorical(0), Score::Inactive].into(), 2).is_ok());
    }
}
