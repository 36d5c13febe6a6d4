//! Model modifiers for the reference networks.

use attrib_core::ModelModifier;
use burn::tensor::backend::AutodiffBackend;

use crate::convnet::{ConvNet, OutputActivation};

/// Replaces the output activation of every head with the identity.
///
/// Saturating activations such as softmax flatten the gradients of
/// confident predictions; attribution on the raw logits avoids that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceToLinear;

impl<B: AutodiffBackend> ModelModifier<ConvNet<B>> for ReplaceToLinear {
    fn modify(&self, model: &mut ConvNet<B>) -> attrib_core::Result<()> {
        tracing::debug!(
            previous = ?model.output_activation(),
            "replacing output activation with identity"
        );
        model.set_output_activation(OutputActivation::Linear);
        Ok(())
    }

    fn name(&self) -> &str {
        "ReplaceToLinear"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convnet::ConvNetConfig;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use ndarray::{ArrayD, Axis, IxDyn};

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_replaces_softmax_with_logits() {
        let mut model = ConvNetConfig::new(4, 4, 2, 3)
            .init::<TestBackend>(&Default::default())
            .unwrap();
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 4, 4, 2]), |ix| {
            (ix[1] as f32 - ix[2] as f32) * 0.3 + ix[3] as f32 * 0.1
        });
        let probs = model.predict(&[x.clone()]).unwrap().remove(0);

        ReplaceToLinear.modify(&mut model).unwrap();
        assert_eq!(model.output_activation(), OutputActivation::Linear);
        assert_eq!(
            ModelModifier::<ConvNet<TestBackend>>::name(&ReplaceToLinear),
            "ReplaceToLinear"
        );

        let logits = model.predict(&[x]).unwrap().remove(0);
        for (p, l) in probs.axis_iter(Axis(0)).zip(logits.axis_iter(Axis(0))) {
            let max = l.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let exp = l.mapv(|v| (v - max).exp());
            let softmax = &exp / exp.sum();
            assert!(p.iter().zip(softmax.iter()).all(|(a, b)| (a - b).abs() < 1e-5));
        }
    }
}
