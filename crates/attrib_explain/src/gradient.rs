//! Gradient extraction engine.
//!
//! Records a forward pass, evaluates the scores against the model outputs
//! and backpropagates their cotangents to the watched tensors: the seed
//! inputs for saliency, or an intermediate activation exposed as an extra
//! output for class activation maps.

use attrib_core::{
    DType, DifferentiableModel, FloatArray, GradientTape, GradientTarget, Precision, Result,
    UnconnectedGradients, VisError,
};
use ndarray::{Array1, ArrayD, Axis, IxDyn};

use crate::score::Score;

/// Result of one extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Gradients of the summed objectives, one per watched tensor.
    pub gradients: Vec<ArrayD<f32>>,
    /// Watched activation for [`GradientTarget::Output`]; empty for inputs.
    pub activations: Vec<ArrayD<f32>>,
    /// Objective values, one array per scored output.
    pub score_values: Vec<Array1<f32>>,
}

/// Compute gradients of `scores` with respect to `target`.
///
/// `seed_inputs` must already be batched; each is checked against the
/// matching input spec, and unbatched tensors are rejected rather than
/// promoted. Scores are matched with the model outputs in order.
///
/// Under mixed precision, gradients and activations are cast to the
/// model's variable type before they are returned; nothing is computed on
/// them in the narrower compute type.
///
/// # Errors
///
/// Argument errors when the seed inputs or scores do not fit the model,
/// [`VisError::UnconnectedGradient`] for an unreachable target under
/// [`UnconnectedGradients::None`], and any error raised by the model.
pub fn extract<M: DifferentiableModel>(
    model: &M,
    seed_inputs: &[ArrayD<f32>],
    scores: &[Score],
    target: GradientTarget,
    training: bool,
    policy: UnconnectedGradients,
) -> Result<Extraction> {
    if seed_inputs.len() != model.inputs().len() {
        return Err(VisError::invalid(format!(
            "model has {} inputs, got {} seed inputs",
            model.inputs().len(),
            seed_inputs.len()
        )));
    }
    for (i, (x, spec)) in seed_inputs.iter().zip(model.inputs()).enumerate() {
        spec.check_batch(i, x)?;
    }
    let batch = seed_inputs.first().map_or(0, |x| x.len_of(Axis(0)));
    if let Some(bad) = seed_inputs.iter().position(|x| x.len_of(Axis(0)) != batch) {
        return Err(VisError::InvalidSeedInput {
            index: bad,
            expected: format!("batch size {batch}"),
            got: format!("batch size {}", seed_inputs[bad].len_of(Axis(0))),
        });
    }
    if scores.is_empty() || scores.len() > model.outputs().len() {
        return Err(VisError::invalid(format!(
            "expected between 1 and {} scores, got {}",
            model.outputs().len(),
            scores.len()
        )));
    }

    let precision = model.precision();
    let _span = tracing::debug_span!("extract", ?target, batch, training).entered();

    let tape = model.record(seed_inputs, training)?;
    let outputs = tape.outputs();
    if outputs.len() < scores.len() {
        return Err(VisError::ShapeMismatch(format!(
            "model produced {} outputs for {} scores",
            outputs.len(),
            scores.len()
        )));
    }

    let mut cotangents = Vec::with_capacity(scores.len());
    let mut score_values = Vec::with_capacity(scores.len());
    for (score, output) in scores.iter().zip(outputs) {
        let output = widen(output.clone(), &precision);
        let objective = score.evaluate(output.view())?;
        tracing::trace!(score = score.name(), values = ?objective.values, "evaluated score");
        cotangents.push(objective.cotangent);
        score_values.push(objective.values);
    }

    let (watched_shapes, activations) = match target {
        GradientTarget::Inputs => (
            seed_inputs.iter().map(|x| x.shape().to_vec()).collect::<Vec<_>>(),
            Vec::new(),
        ),
        GradientTarget::Output(k) => {
            let activation = outputs.get(k).ok_or_else(|| {
                VisError::invalid(format!(
                    "cannot watch output {k}: the model has {} outputs",
                    outputs.len()
                ))
            })?;
            let activation = widen(activation.clone(), &precision);
            (vec![activation.shape().to_vec()], vec![activation])
        }
    };

    let gradients = tape.gradient(&cotangents, target, policy)?;
    if gradients.len() != watched_shapes.len() {
        return Err(VisError::ShapeMismatch(format!(
            "expected {} gradients, the model returned {}",
            watched_shapes.len(),
            gradients.len()
        )));
    }

    let gradients = gradients
        .into_iter()
        .zip(watched_shapes)
        .enumerate()
        .map(|(i, (gradient, shape))| {
            let gradient = match (gradient, policy) {
                (Some(gradient), _) => widen(gradient, &precision),
                (None, UnconnectedGradients::Zero) => ArrayD::zeros(IxDyn(&shape)),
                (None, UnconnectedGradients::None) => {
                    return Err(VisError::UnconnectedGradient(format!(
                        "the scores do not depend on watched tensor {i}"
                    )))
                }
            };
            if gradient.shape() != shape.as_slice() {
                return Err(VisError::ShapeMismatch(format!(
                    "gradient {i} has shape {:?}, watched tensor has {:?}",
                    gradient.shape(),
                    shape
                )));
            }
            Ok(gradient)
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        n_gradients = gradients.len(),
        mixed_precision = precision.is_mixed(),
        "extracted gradients"
    );
    Ok(Extraction {
        gradients,
        activations,
        score_values,
    })
}

/// Cast to the variable type when mixed, then convert to `f32` for
/// arithmetic. An `f64` variable type is narrowed here.
fn widen(array: FloatArray, precision: &Precision) -> ArrayD<f32> {
    if precision.is_mixed() && precision.variable != DType::F64 {
        array.cast(precision.variable).into_f32()
    } else {
        array.into_f32()
    }
}
