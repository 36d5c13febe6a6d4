//! Convolutional image classifiers with gradient access.
//!
//! [`ConvNet`] runs every input image through its own convolutional
//! branch, pools each branch globally and classifies the concatenated
//! features with one dense head per output:
//!
//! ```text
//! Input i (B, H, W, C)
//!       |
//!       +---> [Conv2d (same padding) + ReLU] x N   branch{i}/conv{j}
//!       |
//!       +---> [Global Average Pooling]             branch{i}/pool
//!                 |
//!                 +---> [Concat over branches]     features
//!                           |
//!                           +---> [Linear + activation] per output   head{k}
//! ```

use attrib_core::{
    DifferentiableModel, FloatArray, GradientTape, GradientTarget, LayerId, LayerSpec, Precision,
    TensorSpec, UnconnectedGradients, VisError,
};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};
use burn::tensor::backend::AutodiffBackend;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::convert::{
    channels_last, float_dtype, image_tensor_to_array, image_to_tensor, matrix_to_tensor,
    tensor_to_array, unconnected,
};
use crate::error::{ModelError, Result};

/// Activation applied to the logits of every head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputActivation {
    /// Class probabilities.
    #[default]
    Softmax,
    /// Independent per-class probabilities.
    Sigmoid,
    /// Raw logits.
    Linear,
}

impl OutputActivation {
    fn apply<B: Backend>(self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Softmax => softmax(logits, 1),
            Self::Sigmoid => sigmoid(logits),
            Self::Linear => logits,
        }
    }
}

/// Per-example shape of one image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    /// Image height.
    pub height: usize,
    /// Image width.
    pub width: usize,
    /// Number of channels.
    pub channels: usize,
}

impl ImageShape {
    /// Create an image shape.
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

/// Configuration for [`ConvNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNetConfig {
    /// Image inputs, one branch each.
    pub inputs: Vec<ImageShape>,
    /// Number of classes of each output head.
    pub n_classes: Vec<usize>,
    /// Filters of each convolution in a branch. Empty for a network
    /// without spatial layers.
    pub filters: Vec<usize>,
    /// Square kernel size; must be odd.
    pub kernel_size: usize,
    /// Activation of the output heads.
    pub output_activation: OutputActivation,
}

impl Default for ConvNetConfig {
    fn default() -> Self {
        Self {
            inputs: vec![ImageShape::new(8, 8, 3)],
            n_classes: vec![10],
            filters: vec![8, 16],
            kernel_size: 3,
            output_activation: OutputActivation::Softmax,
        }
    }
}

impl ConvNetConfig {
    /// Create a single-input, single-output config.
    pub fn new(height: usize, width: usize, channels: usize, n_classes: usize) -> Self {
        Self {
            inputs: vec![ImageShape::new(height, width, channels)],
            n_classes: vec![n_classes],
            ..Default::default()
        }
    }

    /// Add another image input.
    #[must_use]
    pub fn with_input(mut self, height: usize, width: usize, channels: usize) -> Self {
        self.inputs.push(ImageShape::new(height, width, channels));
        self
    }

    /// Add another output head.
    #[must_use]
    pub fn with_output(mut self, n_classes: usize) -> Self {
        self.n_classes.push(n_classes);
        self
    }

    /// Set the convolution filters of every branch.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<usize>) -> Self {
        self.filters = filters;
        self
    }

    /// Set the kernel size.
    #[must_use]
    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Set the output activation.
    #[must_use]
    pub fn with_output_activation(mut self, activation: OutputActivation) -> Self {
        self.output_activation = activation;
        self
    }

    /// Check the config describes a buildable network.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(ModelError::Config("at least one input is required".to_string()));
        }
        if self.n_classes.is_empty() {
            return Err(ModelError::Config("at least one output is required".to_string()));
        }
        if let Some(shape) = self
            .inputs
            .iter()
            .find(|s| s.height == 0 || s.width == 0 || s.channels == 0)
        {
            return Err(ModelError::Config(format!("empty input shape {shape:?}")));
        }
        if self.n_classes.contains(&0) || self.filters.contains(&0) {
            return Err(ModelError::Config(
                "class and filter counts must be positive".to_string(),
            ));
        }
        if self.kernel_size % 2 == 0 {
            return Err(ModelError::Config(format!(
                "kernel size must be odd for same padding, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }

    /// Initialize the network.
    pub fn init<B: AutodiffBackend>(&self, device: &B::Device) -> Result<ConvNet<B>> {
        ConvNet::new(self.clone(), device)
    }
}

/// Convolution stack of one input.
#[derive(Module, Debug)]
struct ConvBranch<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> ConvBranch<B> {
    fn new(channels: usize, filters: &[usize], kernel_size: usize, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(filters.len());
        let mut in_channels = channels;
        for &out_channels in filters {
            convs.push(
                Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device),
            );
            in_channels = out_channels;
        }
        Self { convs }
    }
}

/// Trainable parameters of a [`ConvNet`].
#[derive(Module, Debug)]
struct Network<B: Backend> {
    branches: Vec<ConvBranch<B>>,
    heads: Vec<Linear<B>>,
}

/// Activation captured for an extra output.
#[derive(Debug)]
enum Tapped<B: AutodiffBackend> {
    Spatial(Tensor<B, 4>),
    Flat(Tensor<B, 2>),
}

impl<B: AutodiffBackend> Tapped<B> {
    fn to_array(&self) -> Result<FloatArray> {
        match self {
            Self::Spatial(t) => image_tensor_to_array(t.clone()),
            Self::Flat(t) => tensor_to_array(t.clone()),
        }
    }

    fn shape(&self) -> Vec<usize> {
        match self {
            Self::Spatial(t) => channels_last(t.dims()),
            Self::Flat(t) => t.dims().to_vec(),
        }
    }

    fn gradient(&self, grads: Option<&B::Gradients>) -> Result<Option<FloatArray>> {
        match self {
            Self::Spatial(t) => grads
                .and_then(|g| t.grad(g))
                .map(image_tensor_to_array)
                .transpose(),
            Self::Flat(t) => grads
                .and_then(|g| t.grad(g))
                .map(tensor_to_array)
                .transpose(),
        }
    }
}

/// Split an activation into a leaf that collects its gradient and a value
/// that carries on through the graph.
///
/// The carried value equals the activation and still backpropagates into
/// the layers before it.
fn split_tap<B: AutodiffBackend, const D: usize>(x: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, D>) {
    let leaf = x.clone().detach().require_grad();
    let residual = x.clone() - x.detach();
    (leaf.clone() + residual, leaf)
}

/// Image classifier implementing [`DifferentiableModel`].
///
/// # Example
///
/// ```rust,ignore
/// use attrib_models::ConvNetConfig;
///
/// type B = burn_autodiff::Autodiff<burn_ndarray::NdArray>;
///
/// let model = ConvNetConfig::new(8, 8, 3, 10).init::<B>(&Default::default())?;
/// assert_eq!(model.layers().len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct ConvNet<B: AutodiffBackend> {
    network: Network<B>,
    config: ConvNetConfig,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    layers: Vec<LayerSpec>,
    tapped: Option<LayerId>,
    device: B::Device,
}

impl<B: AutodiffBackend> ConvNet<B> {
    /// Build a network from `config`.
    pub fn new(config: ConvNetConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let dtype = float_dtype::<B>();
        let branches = config
            .inputs
            .iter()
            .map(|shape| {
                ConvBranch::new(shape.channels, &config.filters, config.kernel_size, device)
            })
            .collect();
        let pooled = config.filters.last().copied();
        let features: usize = config
            .inputs
            .iter()
            .map(|shape| pooled.unwrap_or(shape.channels))
            .sum();
        let heads = config
            .n_classes
            .iter()
            .map(|&n| LinearConfig::new(features, n).init(device))
            .collect();

        let inputs = config
            .inputs
            .iter()
            .enumerate()
            .map(|(i, s)| {
                TensorSpec::new(format!("input{i}"), [s.height, s.width, s.channels])
                    .with_dtype(dtype)
            })
            .collect();
        let outputs = config
            .n_classes
            .iter()
            .enumerate()
            .map(|(k, &n)| TensorSpec::new(format!("head{k}"), [n]).with_dtype(dtype))
            .collect();

        let mut layers: Vec<LayerSpec> = Vec::new();
        let mut push = |name: String, shape: Vec<usize>| {
            let id = LayerId(layers.len());
            layers.push(LayerSpec::new(id, name, shape.into_iter().map(Some).collect()));
        };
        for (i, shape) in config.inputs.iter().enumerate() {
            for (j, &f) in config.filters.iter().enumerate() {
                push(format!("branch{i}/conv{j}"), vec![shape.height, shape.width, f]);
            }
            push(format!("branch{i}/pool"), vec![pooled.unwrap_or(shape.channels)]);
        }
        push("features".to_string(), vec![features]);
        for (k, &n) in config.n_classes.iter().enumerate() {
            push(format!("head{k}"), vec![n]);
        }

        tracing::debug!(
            inputs = config.inputs.len(),
            outputs = config.n_classes.len(),
            layers = layers.len(),
            "built ConvNet"
        );

        Ok(Self {
            network: Network { branches, heads },
            config,
            inputs,
            outputs,
            layers,
            tapped: None,
            device: device.clone(),
        })
    }

    /// The network configuration.
    pub fn config(&self) -> &ConvNetConfig {
        &self.config
    }

    /// Activation of the output heads.
    pub fn output_activation(&self) -> OutputActivation {
        self.config.output_activation
    }

    /// Replace the activation of the output heads.
    pub fn set_output_activation(&mut self, activation: OutputActivation) {
        self.config.output_activation = activation;
    }

    /// Layer whose activation is exposed as the last output, if any.
    pub fn tapped_layer(&self) -> Option<LayerId> {
        self.tapped
    }

    /// Run inference and return every output as single precision arrays.
    pub fn predict(&self, inputs: &[ArrayD<f32>]) -> attrib_core::Result<Vec<ArrayD<f32>>> {
        let tape = self.record(inputs, false)?;
        Ok(tape.outputs.into_iter().map(FloatArray::into_f32).collect())
    }

    fn forward(&self, images: Vec<Tensor<B, 4>>) -> (Vec<Tensor<B, 2>>, Option<Tapped<B>>) {
        let tap = self.tapped.map(|id| id.0);
        let mut layer = 0;
        let mut tapped = None;

        let mut pooled = Vec::with_capacity(images.len());
        for (branch, mut x) in self.network.branches.iter().zip(images) {
            for conv in &branch.convs {
                x = Relu::new().forward(conv.forward(x));
                if tap == Some(layer) {
                    let (through, leaf) = split_tap(x);
                    tapped = Some(Tapped::Spatial(leaf));
                    x = through;
                }
                layer += 1;
            }
            let [batch, channels, height, width] = x.dims();
            let mut p = x
                .reshape([batch, channels, height * width])
                .mean_dim(2)
                .reshape([batch, channels]);
            if tap == Some(layer) {
                let (through, leaf) = split_tap(p);
                tapped = Some(Tapped::Flat(leaf));
                p = through;
            }
            layer += 1;
            pooled.push(p);
        }

        let mut features = Tensor::cat(pooled, 1);
        if tap == Some(layer) {
            let (through, leaf) = split_tap(features);
            tapped = Some(Tapped::Flat(leaf));
            features = through;
        }
        layer += 1;

        let mut heads = Vec::with_capacity(self.network.heads.len());
        for head in &self.network.heads {
            let mut out = self
                .config
                .output_activation
                .apply(head.forward(features.clone()));
            if tap == Some(layer) {
                let (through, leaf) = split_tap(out);
                tapped = Some(Tapped::Flat(leaf));
                out = through;
            }
            layer += 1;
            heads.push(out);
        }
        (heads, tapped)
    }
}

/// Forward pass of a [`ConvNet`] recorded by burn's autodiff backend.
pub struct ConvNetTape<B: AutodiffBackend> {
    images: Vec<Tensor<B, 4>>,
    heads: Vec<Tensor<B, 2>>,
    tapped: Option<Tapped<B>>,
    outputs: Vec<FloatArray>,
    device: B::Device,
}

impl<B: AutodiffBackend> GradientTape for ConvNetTape<B> {
    fn outputs(&self) -> &[FloatArray] {
        &self.outputs
    }

    fn gradient(
        self,
        cotangents: &[ArrayD<f32>],
        target: GradientTarget,
        policy: UnconnectedGradients,
    ) -> attrib_core::Result<Vec<Option<FloatArray>>> {
        if cotangents.len() > self.heads.len() {
            return Err(VisError::invalid(format!(
                "{} cotangents for {} output heads",
                cotangents.len(),
                self.heads.len()
            )));
        }

        let mut objective: Option<Tensor<B, 1>> = None;
        for (k, (head, cotangent)) in self.heads.iter().zip(cotangents).enumerate() {
            if cotangent.shape() != head.dims().as_slice() {
                return Err(VisError::ShapeMismatch(format!(
                    "cotangent {k} has shape {:?}, head output is {:?}",
                    cotangent.shape(),
                    head.dims()
                )));
            }
            let weight = matrix_to_tensor::<B>(cotangent, &self.device)?;
            let term = (head.clone() * weight).sum();
            objective = Some(match objective {
                Some(total) => total + term,
                None => term,
            });
        }
        let grads = objective.map(|o| o.backward());
        let dtype = float_dtype::<B>();

        match target {
            GradientTarget::Inputs => self
                .images
                .iter()
                .map(|image| {
                    let grad = match grads.as_ref().and_then(|g| image.grad(g)) {
                        Some(grad) => image_tensor_to_array(grad).map(Some),
                        None => Ok(unconnected(&channels_last(image.dims()), dtype, policy)),
                    };
                    grad.map_err(VisError::from)
                })
                .collect(),
            GradientTarget::Output(k) if k < self.heads.len() => {
                // heads feed nothing else, so their gradient is the cotangent
                let grad = match cotangents.get(k) {
                    Some(c) => Some(FloatArray::from_f32(c.clone(), dtype)),
                    None => unconnected(&self.heads[k].dims(), dtype, policy),
                };
                Ok(vec![grad])
            }
            GradientTarget::Output(k) => match (&self.tapped, k == self.heads.len()) {
                (Some(tapped), true) => {
                    let grad = match tapped.gradient(grads.as_ref())? {
                        Some(grad) => Some(grad),
                        None => unconnected(&tapped.shape(), dtype, policy),
                    };
                    Ok(vec![grad])
                }
                _ => Err(VisError::invalid(format!(
                    "output {k} does not exist; the model has {} outputs",
                    self.outputs.len()
                ))),
            },
        }
    }
}

impl<B: AutodiffBackend> DifferentiableModel for ConvNet<B> {
    type Tape = ConvNetTape<B>;

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn layers(&self) -> Vec<LayerSpec> {
        self.layers.clone()
    }

    fn precision(&self) -> Precision {
        let dtype = float_dtype::<B>();
        Precision {
            compute: dtype,
            variable: dtype,
        }
    }

    fn record(&self, inputs: &[ArrayD<f32>], training: bool) -> attrib_core::Result<Self::Tape> {
        if inputs.len() != self.inputs.len() {
            return Err(VisError::invalid(format!(
                "{} inputs given to a network with {} inputs",
                inputs.len(),
                self.inputs.len()
            )));
        }
        // No layer behaves differently in training mode.
        tracing::trace!(
            inputs = inputs.len(),
            training,
            tapped = ?self.tapped,
            "recording forward pass"
        );

        let images = inputs
            .iter()
            .map(|x| image_to_tensor::<B>(x, &self.device).map(|t| t.require_grad()))
            .collect::<Result<Vec<_>>>()?;
        let (heads, tapped) = self.forward(images.clone());

        let mut outputs = heads
            .iter()
            .map(|h| tensor_to_array(h.clone()))
            .collect::<Result<Vec<_>>>()?;
        if let Some(tapped) = &tapped {
            outputs.push(tapped.to_array()?);
        }

        Ok(ConvNetTape {
            images,
            heads,
            tapped,
            outputs,
            device: self.device.clone(),
        })
    }

    fn with_layer_output(&self, layer: LayerId) -> attrib_core::Result<Self> {
        let spec = self
            .layers
            .iter()
            .find(|l| l.id == layer)
            .ok_or(ModelError::UnknownLayer(layer.0))?;

        let mut model = self.clone();
        model.outputs.truncate(self.config.n_classes.len());
        model.outputs.push(
            TensorSpec::dynamic(spec.name.clone(), spec.output_shape.clone())
                .with_dtype(float_dtype::<B>()),
        );
        model.tapped = Some(layer);
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use ndarray::{Axis, Dimension, IxDyn};

    type TestBackend = Autodiff<NdArray>;

    fn image(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(shape), |ix| {
            let k: usize = ix.as_array_view().iter().enumerate().map(|(i, v)| (i + 1) * v).sum();
            ((k % 7) as f32 - 3.0) * 0.2
        })
    }

    fn build(config: &ConvNetConfig) -> ConvNet<TestBackend> {
        config.init::<TestBackend>(&Default::default()).unwrap()
    }

    fn one_hot(batch: usize, classes: usize, class: usize) -> ArrayD<f32> {
        let mut c = ArrayD::zeros(IxDyn(&[batch, classes]));
        c.index_axis_mut(Axis(1), class).fill(1.0);
        c
    }

    #[test]
    fn test_config_default() {
        let config = ConvNetConfig::default();
        assert_eq!(config.inputs, vec![ImageShape::new(8, 8, 3)]);
        assert_eq!(config.filters, vec![8, 16]);
        assert_eq!(config.kernel_size, 3);
        assert_eq!(config.output_activation, OutputActivation::Softmax);
    }

    #[test]
    fn test_config_builder_and_serde() {
        let config = ConvNetConfig::new(8, 8, 3, 4)
            .with_input(10, 10, 1)
            .with_output(2)
            .with_filters(vec![4])
            .with_kernel_size(5)
            .with_output_activation(OutputActivation::Sigmoid);
        assert_eq!(config.inputs.len(), 2);
        assert_eq!(config.n_classes, vec![4, 2]);

        let json = serde_json::to_string(&config).unwrap();
        let back: ConvNetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validate() {
        assert!(ConvNetConfig::default().validate().is_ok());
        assert!(ConvNetConfig::default().with_kernel_size(4).validate().is_err());
        assert!(ConvNetConfig::new(0, 8, 3, 2).validate().is_err());
        assert!(ConvNetConfig::new(8, 8, 3, 0).validate().is_err());
        let no_inputs = ConvNetConfig {
            inputs: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(no_inputs.validate(), Err(ModelError::Config(_))));
    }

    #[test]
    fn test_layers() {
        let model = build(&ConvNetConfig::new(8, 8, 3, 5));
        let layers = model.layers();
        let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            ["branch0/conv0", "branch0/conv1", "branch0/pool", "features", "head0"]
        );
        assert!(layers[1].is_spatial());
        assert_eq!(layers[1].output_shape, vec![Some(8), Some(8), Some(16)]);
        assert!(!layers[2].is_spatial());
        assert!(layers.iter().enumerate().all(|(i, l)| l.id == LayerId(i)));
        assert_eq!(model.inputs()[0].shape, vec![Some(8), Some(8), Some(3)]);
        assert_eq!(model.precision(), Precision::full());
    }

    #[test]
    fn test_record_outputs_probabilities() {
        let model = build(&ConvNetConfig::new(8, 8, 3, 5));
        let tape = model.record(&[image(&[2, 8, 8, 3])], false).unwrap();
        assert_eq!(tape.outputs().len(), 1);
        let probs = tape.outputs()[0].clone().into_f32();
        assert_eq!(probs.shape(), &[2, 5]);
        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        // Without convolutions and activation the network is affine.
        let config = ConvNetConfig::new(4, 4, 2, 3)
            .with_filters(Vec::new())
            .with_output_activation(OutputActivation::Linear);
        let model = build(&config);
        let x = image(&[1, 4, 4, 2]);

        let tape = model.record(&[x.clone()], false).unwrap();
        let base = tape.outputs()[0].clone().into_f32();
        let grads = tape
            .gradient(&[one_hot(1, 3, 1)], GradientTarget::Inputs, UnconnectedGradients::Zero)
            .unwrap();
        let grad = grads[0].clone().unwrap().into_f32();
        assert_eq!(grad.shape(), &[1, 4, 4, 2]);

        let mut moved = x;
        moved[[0, 2, 1, 1]] += 0.5;
        let shifted = model.predict(&[moved]).unwrap().remove(0);
        let delta = shifted[[0, 1]] - base[[0, 1]];
        assert!((delta - 0.5 * grad[[0, 2, 1, 1]]).abs() < 1e-4);

        // Average pooling spreads the weight evenly over the positions.
        assert!((grad[[0, 0, 0, 1]] - grad[[0, 3, 2, 1]]).abs() < 1e-6);
    }

    #[test]
    fn test_layer_output_and_gradient() {
        let model = build(&ConvNetConfig::new(8, 8, 3, 5));
        let conv = model.layers()[1].id;
        let tapped = model.with_layer_output(conv).unwrap();
        assert_eq!(tapped.outputs().len(), 2);
        assert_eq!(tapped.tapped_layer(), Some(conv));
        assert!(model.tapped_layer().is_none());

        let tape = tapped.record(&[image(&[2, 8, 8, 3])], false).unwrap();
        assert_eq!(tape.outputs()[1].shape(), &[2, 8, 8, 16]);
        let grads = tape
            .gradient(&[one_hot(2, 5, 3)], GradientTarget::Output(1), UnconnectedGradients::None)
            .unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].as_ref().unwrap().shape(), &[2, 8, 8, 16]);
    }

    #[test]
    fn test_tap_keeps_input_gradients() {
        let model = build(&ConvNetConfig::new(6, 6, 2, 3).with_filters(vec![4]));
        let tapped = model.with_layer_output(LayerId(0)).unwrap();
        let x = image(&[1, 6, 6, 2]);
        let cotangent = [one_hot(1, 3, 0)];

        let plain = model
            .record(&[x.clone()], false)
            .unwrap()
            .gradient(&cotangent, GradientTarget::Inputs, UnconnectedGradients::Zero)
            .unwrap();
        let through = tapped
            .record(&[x], false)
            .unwrap()
            .gradient(&cotangent, GradientTarget::Inputs, UnconnectedGradients::Zero)
            .unwrap();
        let plain = plain[0].clone().unwrap().into_f32();
        let through = through[0].clone().unwrap().into_f32();
        assert!(plain
            .iter()
            .zip(through.iter())
            .all(|(a, b)| (a - b).abs() < 1e-6));
    }

    #[test]
    fn test_without_cotangents_gradients_are_unconnected() {
        let model = build(&ConvNetConfig::new(4, 4, 1, 2));
        let x = image(&[1, 4, 4, 1]);

        let zero = model
            .record(&[x.clone()], false)
            .unwrap()
            .gradient(&[], GradientTarget::Inputs, UnconnectedGradients::Zero)
            .unwrap();
        let zero = zero[0].clone().unwrap().into_f32();
        assert_eq!(zero.shape(), &[1, 4, 4, 1]);
        assert!(zero.iter().all(|&v| v == 0.0));

        let none = model
            .record(&[x], false)
            .unwrap()
            .gradient(&[], GradientTarget::Inputs, UnconnectedGradients::None)
            .unwrap();
        assert!(none[0].is_none());
    }

    #[test]
    fn test_multi_input_network() {
        let config = ConvNetConfig::new(8, 8, 3, 4)
            .with_input(10, 10, 3)
            .with_output(2)
            .with_filters(vec![4]);
        let model = build(&config);
        assert_eq!(model.inputs().len(), 2);
        assert_eq!(model.outputs().len(), 2);
        assert_eq!(model.layers().len(), 7);
        assert_eq!(model.layers()[3].output_shape, vec![Some(4)]);
        assert_eq!(model.layers()[4].output_shape, vec![Some(8)]);

        let tape = model
            .record(&[image(&[1, 8, 8, 3]), image(&[1, 10, 10, 3])], false)
            .unwrap();
        assert_eq!(tape.outputs()[1].shape(), &[1, 2]);
        let grads = tape
            .gradient(
                &[one_hot(1, 4, 0), one_hot(1, 2, 1)],
                GradientTarget::Inputs,
                UnconnectedGradients::Zero,
            )
            .unwrap();
        assert_eq!(grads[0].as_ref().unwrap().shape(), &[1, 8, 8, 3]);
        assert_eq!(grads[1].as_ref().unwrap().shape(), &[1, 10, 10, 3]);
    }

    #[test]
    fn test_errors() {
        let model = build(&ConvNetConfig::new(4, 4, 1, 2));
        assert!(matches!(
            model.with_layer_output(LayerId(99)),
            Err(VisError::Model(_))
        ));
        assert!(model.record(&[], false).is_err());

        let tape = model.record(&[image(&[1, 4, 4, 1])], false).unwrap();
        let err = tape
            .gradient(&[one_hot(1, 3, 0)], GradientTarget::Inputs, UnconnectedGradients::Zero)
            .err()
            .unwrap();
        assert!(matches!(err, VisError::ShapeMismatch(_)));
    }
}
