//! Seeds for the noise draws of smoothed attribution.
//!
//! A smoothing run makes `samples` noisy copies of the seed inputs. Each
//! trial draws its noise from its own ChaCha stream keyed by the trial
//! index, so trial `i` sees the same noise whether the run stops early,
//! runs to completion or is repeated with more samples.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Seed of the noise of one smoothing run.
///
/// # Example
///
/// ```rust
/// use attrib_core::Seed;
/// use rand::Rng;
///
/// let seed = Seed::new(7);
/// let a: f32 = seed.trial_rng(3).gen();
/// let b: f32 = seed.trial_rng(3).gen();
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(u64);

impl Seed {
    /// Fix the noise of a run.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// A fresh seed for runs whose noise the caller did not fix.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self(rand::random())
    }

    /// Generator for the noise of trial `trial`.
    #[must_use]
    pub fn trial_rng(&self, trial: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        rng.set_stream(trial as u64);
        rng
    }
}

impl From<u64> for Seed {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}
