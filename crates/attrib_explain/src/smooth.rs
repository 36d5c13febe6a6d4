//! Noise-averaged attribution (SmoothGrad and VarGrad).

use std::ops::ControlFlow;

use attrib_core::{Result, Seed, VisError};
use ndarray::{ArrayD, Axis, Zip};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// How trial maps are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Aggregation {
    /// Average of the trials (SmoothGrad).
    #[default]
    Mean,
    /// Population variance of the trials (VarGrad).
    Variance,
}

/// Running mean and variance of a sequence of map lists.
///
/// Uses Welford's update, so memory does not grow with the number of trials.
#[derive(Debug, Clone, Default)]
pub struct RunningMoments {
    count: usize,
    mean: Vec<ArrayD<f32>>,
    m2: Option<Vec<ArrayD<f32>>>,
}

impl RunningMoments {
    /// Create an accumulator; `track_variance` enables the second moment.
    #[must_use]
    pub fn new(track_variance: bool) -> Self {
        Self {
            count: 0,
            mean: Vec::new(),
            m2: track_variance.then(Vec::new),
        }
    }

    /// Number of folded samples.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Fold one sample into the moments.
    ///
    /// # Errors
    ///
    /// [`VisError::ShapeMismatch`] if the sample does not match the ones
    /// folded before.
    pub fn push(&mut self, sample: Vec<ArrayD<f32>>) -> Result<()> {
        if self.count == 0 {
            if let Some(m2) = &mut self.m2 {
                *m2 = sample.iter().map(|x| ArrayD::zeros(x.raw_dim())).collect();
            }
            self.mean = sample;
            self.count = 1;
            return Ok(());
        }

        if sample.len() != self.mean.len()
            || sample.iter().zip(&self.mean).any(|(x, m)| x.shape() != m.shape())
        {
            return Err(VisError::ShapeMismatch(
                "trial maps differ in shape from the first trial".to_string(),
            ));
        }

        self.count += 1;
        let n = self.count as f32;
        for (k, x) in sample.iter().enumerate() {
            match &mut self.m2 {
                Some(m2) => {
                    Zip::from(&mut self.mean[k])
                        .and(&mut m2[k])
                        .and(x)
                        .for_each(|mean, m2, &x| {
                            let delta = x - *mean;
                            *mean += delta / n;
                            *m2 += delta * (x - *mean);
                        });
                }
                None => {
                    Zip::from(&mut self.mean[k])
                        .and(x)
                        .for_each(|mean, &x| *mean += (x - *mean) / n);
                }
            }
        }
        Ok(())
    }

    /// Current mean.
    #[must_use]
    pub fn mean(&self) -> &[ArrayD<f32>] {
        &self.mean
    }

    /// Population variance, if tracked.
    #[must_use]
    pub fn variance(&self) -> Option<Vec<ArrayD<f32>>> {
        let n = self.count.max(1) as f32;
        self.m2
            .as_ref()
            .map(|m2| m2.iter().map(|m| m.mapv(|v| v / n)).collect())
    }

    /// Consume the accumulator and return the requested statistic.
    #[must_use]
    pub fn finish(self, aggregation: Aggregation) -> Vec<ArrayD<f32>> {
        match aggregation {
            Aggregation::Variance => self.variance().unwrap_or(self.mean),
            Aggregation::Mean => self.mean,
        }
    }
}

/// Smoothing driver.
///
/// Runs an attribution callback on noisy copies of the seed inputs and
/// combines the resulting maps.
///
/// # Example
///
/// ```rust
/// use attrib_core::Seed;
/// use attrib_explain::SmoothGrad;
/// use ndarray::{ArrayD, IxDyn};
///
/// let x = ArrayD::<f32>::ones(IxDyn(&[1, 4, 4, 3]));
/// let smooth = SmoothGrad::new(8, 0.2).with_seed(Seed::new(42));
/// let maps = smooth.run(&[x], |inputs| Ok(inputs.to_vec())).unwrap();
/// assert_eq!(maps[0].shape(), &[1, 4, 4, 3]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothGrad {
    /// Number of noisy trials; 0 or 1 disables smoothing.
    pub samples: usize,
    /// Noise standard deviation as a fraction of each example's value range.
    pub noise: f32,
    /// Seed of the noise draws; drawn from entropy when unset.
    pub seed: Option<Seed>,
    /// How trial maps are combined.
    pub aggregation: Aggregation,
}

impl SmoothGrad {
    /// Create a driver with `samples` trials at relative noise `noise`.
    #[must_use]
    pub fn new(samples: usize, noise: f32) -> Self {
        Self {
            samples,
            noise,
            seed: None,
            aggregation: Aggregation::Mean,
        }
    }

    /// Fix the noise seed.
    #[must_use]
    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the aggregation.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Run all trials.
    pub fn run<F>(&self, seed_inputs: &[ArrayD<f32>], compute: F) -> Result<Vec<ArrayD<f32>>>
    where
        F: FnMut(&[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>>,
    {
        self.run_with_observer(seed_inputs, compute, |_, _| ControlFlow::Continue(()))
    }

    /// Run trials, reporting `(completed, total)` after each one.
    ///
    /// Returning [`ControlFlow::Break`] from the observer stops the run; the
    /// result then combines the trials completed so far.
    pub fn run_with_observer<F, O>(
        &self,
        seed_inputs: &[ArrayD<f32>],
        mut compute: F,
        mut observer: O,
    ) -> Result<Vec<ArrayD<f32>>>
    where
        F: FnMut(&[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>>,
        O: FnMut(usize, usize) -> ControlFlow<()>,
    {
        if !self.noise.is_finite() || self.noise < 0.0 {
            return Err(VisError::invalid(format!(
                "smoothing noise must be a non-negative number, got {}",
                self.noise
            )));
        }
        if self.samples <= 1 {
            return compute(seed_inputs);
        }
        if self.noise == 0.0 {
            tracing::warn!(samples = self.samples, "smoothing with zero noise repeats one trial");
        }

        let seed = self.seed.unwrap_or_else(Seed::from_entropy);
        let _span = tracing::debug_span!("smooth", samples = self.samples, noise = self.noise)
            .entered();
        let mut moments = RunningMoments::new(self.aggregation == Aggregation::Variance);
        for trial in 0..self.samples {
            let noisy = perturb(seed_inputs, self.noise, seed.trial_rng(trial))?;
            moments.push(compute(&noisy)?)?;
            tracing::trace!(trial, "finished smoothing trial");
            if observer(trial + 1, self.samples).is_break() {
                tracing::debug!(completed = trial + 1, "smoothing stopped early");
                break;
            }
        }
        Ok(moments.finish(self.aggregation))
    }
}

/// Add Gaussian noise scaled by each example's value range.
fn perturb(
    seed_inputs: &[ArrayD<f32>],
    noise: f32,
    mut rng: ChaCha8Rng,
) -> Result<Vec<ArrayD<f32>>> {
    seed_inputs
        .iter()
        .map(|x| -> Result<ArrayD<f32>> {
            let mut noisy = x.clone();
            for mut example in noisy.axis_iter_mut(Axis(0)) {
                let (min, max) = example
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                let sigma = if max > min { noise * (max - min) } else { 0.0 };
                if sigma == 0.0 {
                    continue;
                }
                let normal =
                    Normal::new(0.0f32, sigma).map_err(|e| VisError::invalid(e.to_string()))?;
                example.mapv_inplace(|v| v + normal.sample(&mut rng));
            }
            Ok(noisy)
        })
        .collect()
}
