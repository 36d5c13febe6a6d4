//! Analytic model used by the unit tests.
//!
//! Input `i` feeds a `scale_i` layer computing `scale * x`, then a
//! `dense_i` layer contracting the flattened activation with a fixed weight
//! matrix. Output `i` is `dense_i`, so every output depends on exactly one
//! input and gradients have closed forms.

use std::cell::Cell;

use attrib_core::{
    DifferentiableModel, FloatArray, GradientTape, GradientTarget, LayerId, LayerSpec, Precision,
    Result, TensorSpec, UnconnectedGradients, VisError,
};
use ndarray::{Array2, ArrayD, Ix2, IxDyn};

pub(crate) fn sample(shape: &[usize]) -> ArrayD<f32> {
    let n: usize = shape.iter().product();
    let data = (0..n).map(|k| ((k % 11) as f32 - 5.0) * 0.1).collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
}

fn weights(features: usize, units: usize, seed: usize) -> Array2<f32> {
    Array2::from_shape_fn((features, units), |(p, k)| {
        (((p * 3 + k * 5 + seed) % 7) as f32 - 3.0) * 0.25
    })
}

fn reshape(array: ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    Ok(array
        .to_shape(IxDyn(shape))
        .map_err(|e| VisError::ShapeMismatch(e.to_string()))?
        .into_owned())
}

fn flatten(x: &ArrayD<f32>) -> Result<Array2<f32>> {
    let batch = x.shape()[0];
    let features = x.len() / batch.max(1);
    Ok(x
        .to_shape((batch, features))
        .map_err(|e| VisError::ShapeMismatch(e.to_string()))?
        .into_owned())
}

#[derive(Debug, Clone)]
pub(crate) struct MockModel {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    weights: Vec<Array2<f32>>,
    units: usize,
    pub(crate) scale: f32,
    precision: Precision,
    tapped: Option<LayerId>,
    fail_forward: bool,
    pub(crate) last_training: Cell<Option<bool>>,
}

impl MockModel {
    pub(crate) fn single_io(shape: impl AsRef<[usize]>, units: usize) -> Self {
        Self::multi_io(&[shape], units)
    }

    pub(crate) fn multi_io<S: AsRef<[usize]>>(shapes: &[S], units: usize) -> Self {
        let inputs: Vec<TensorSpec> = shapes
            .iter()
            .enumerate()
            .map(|(i, s)| TensorSpec::new(format!("input_{i}"), s.as_ref()))
            .collect();
        let outputs = (0..inputs.len())
            .map(|i| TensorSpec::new(format!("output_{i}"), [units]))
            .collect();
        let weights = shapes
            .iter()
            .enumerate()
            .map(|(i, s)| weights(s.as_ref().iter().product(), units, i))
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            units,
            scale: 2.0,
            precision: Precision::full(),
            tapped: None,
            fail_forward: false,
            last_training: Cell::new(None),
        }
    }

    pub(crate) fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail_forward = true;
        self
    }

    /// Gradient of a categorical score on `class` with respect to `input`.
    pub(crate) fn expected_input_gradient(
        &self,
        input: usize,
        class: usize,
        batch: usize,
    ) -> ArrayD<f32> {
        let column = self.weights[input].column(class).mapv(|w| w * self.scale);
        let rows = Array2::from_shape_fn((batch, column.len()), |(_, p)| column[p]);
        let mut shape = vec![batch];
        shape.extend(self.input_dims(input));
        reshape(rows.into_dyn(), &shape).unwrap()
    }

    /// Gradient of a categorical score on `class` with respect to `scale_i`.
    pub(crate) fn expected_layer_gradient(
        &self,
        input: usize,
        class: usize,
        batch: usize,
    ) -> ArrayD<f32> {
        self.expected_input_gradient(input, class, batch)
            .mapv(|v| v / self.scale)
    }

    fn input_dims(&self, input: usize) -> Vec<usize> {
        self.inputs[input].shape.iter().map(|d| d.unwrap_or(0)).collect()
    }

    fn n_base(&self) -> usize {
        self.inputs.len()
    }
}

impl DifferentiableModel for MockModel {
    type Tape = MockTape;

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn layers(&self) -> Vec<LayerSpec> {
        let n = self.n_base();
        let scales = self
            .inputs
            .iter()
            .enumerate()
            .map(|(i, spec)| LayerSpec::new(LayerId(i), format!("scale_{i}"), spec.shape.clone()));
        let denses = (0..n)
            .map(|j| LayerSpec::new(LayerId(n + j), format!("dense_{j}"), vec![Some(self.units)]));
        scales.chain(denses).collect()
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn record(&self, inputs: &[ArrayD<f32>], training: bool) -> Result<MockTape> {
        self.last_training.set(Some(training));
        if self.fail_forward {
            return Err(VisError::Model("forward pass failed".to_string()));
        }
        let activations: Vec<ArrayD<f32>> =
            inputs.iter().map(|x| x.mapv(|v| v * self.scale)).collect();
        let mut outputs = Vec::with_capacity(self.n_base() + 1);
        let mut dense = Vec::with_capacity(self.n_base());
        for (act, w) in activations.iter().zip(&self.weights) {
            let out = flatten(act)?.dot(w).into_dyn();
            dense.push(out.clone());
            outputs.push(FloatArray::from_f32(out, self.precision.compute));
        }
        if let Some(LayerId(l)) = self.tapped {
            let extra = if l < self.n_base() {
                activations[l].clone()
            } else {
                dense[l - self.n_base()].clone()
            };
            outputs.push(FloatArray::from_f32(extra, self.precision.compute));
        }
        Ok(MockTape {
            outputs,
            model: self.clone(),
            batch: inputs.first().map_or(0, |x| x.shape()[0]),
        })
    }

    fn with_layer_output(&self, layer: LayerId) -> Result<Self> {
        if layer.0 >= 2 * self.n_base() {
            return Err(VisError::invalid(format!("no layer {layer:?}")));
        }
        let mut model = self.clone();
        model.tapped = Some(layer);
        model.outputs.push(TensorSpec::dynamic(
            "tapped",
            self.layers()[layer.0].output_shape.clone(),
        ));
        Ok(model)
    }
}

#[derive(Debug)]
pub(crate) struct MockTape {
    outputs: Vec<FloatArray>,
    model: MockModel,
    batch: usize,
}

impl MockTape {
    fn quantize(&self, array: ArrayD<f32>) -> FloatArray {
        FloatArray::from_f32(array, self.model.precision.compute)
    }

    fn unconnected(&self, shape: &[usize], policy: UnconnectedGradients) -> Option<FloatArray> {
        match policy {
            UnconnectedGradients::Zero => Some(self.quantize(ArrayD::zeros(IxDyn(shape)))),
            UnconnectedGradients::None => None,
        }
    }

    /// Gradient of the objective with respect to `scale_i`'s activation.
    fn activation_gradient(&self, i: usize, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let c = cotangent
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| VisError::ShapeMismatch(e.to_string()))?;
        let g = c.dot(&self.model.weights[i].t()).into_dyn();
        let mut shape = vec![self.batch];
        shape.extend(self.model.input_dims(i));
        reshape(g, &shape)
    }
}

impl GradientTape for MockTape {
    fn outputs(&self) -> &[FloatArray] {
        &self.outputs
    }

    fn gradient(
        self,
        cotangents: &[ArrayD<f32>],
        target: GradientTarget,
        policy: UnconnectedGradients,
    ) -> Result<Vec<Option<FloatArray>>> {
        let n = self.model.n_base();
        match target {
            GradientTarget::Inputs => (0..n)
                .map(|i| match cotangents.get(i) {
                    Some(c) => {
                        let g = self.activation_gradient(i, c)?.mapv(|v| v * self.model.scale);
                        Ok(Some(self.quantize(g)))
                    }
                    None => {
                        let mut shape = vec![self.batch];
                        shape.extend(self.model.input_dims(i));
                        Ok(self.unconnected(&shape, policy))
                    }
                })
                .collect(),
            GradientTarget::Output(k) if k < n => Ok(vec![match cotangents.get(k) {
                Some(c) => Some(self.quantize(c.clone())),
                None => self.unconnected(&[self.batch, self.model.units], policy),
            }]),
            GradientTarget::Output(k) if k == n => {
                let Some(LayerId(l)) = self.model.tapped else {
                    return Err(VisError::invalid("no tapped layer"));
                };
                let source = if l < n { l } else { l - n };
                let shape = self.outputs[n].shape().to_vec();
                Ok(vec![match cotangents.get(source) {
                    Some(c) if l < n => Some(self.quantize(self.activation_gradient(l, c)?)),
                    Some(c) => Some(self.quantize(c.clone())),
                    None => self.unconnected(&shape, policy),
                }])
            }
            GradientTarget::Output(k) => Err(VisError::invalid(format!("no output {k}"))),
        }
    }
}
