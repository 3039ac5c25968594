//! Seeded weight and bias initializers.
//!
//! Every distribution is deterministic given a seed: the same
//! `(seed, distribution, parameters)` tuple reproduces the same value
//! stream, which keeps generated modules byte-stable across builds.

use crate::{ModelError, ModelResult};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

/// A statistical weight/bias generator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeightDistribution {
    /// Uniform over `±sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// Normal with `σ = sqrt(2 / (fan_in + fan_out))`.
    XavierNormal,
    /// Uniform over `±sqrt(3 / fan_in)`.
    LeCunUniform,
    /// Normal with `σ = sqrt(1 / fan_in)`.
    LeCunNormal,
    /// Uniform over a fixed range.
    Uniform {
        /// Lower bound (inclusive).
        low: f64,
        /// Upper bound (exclusive).
        high: f64,
    },
    /// Normal with fixed parameters.
    Gaussian {
        /// Distribution mean.
        mean: f64,
        /// Distribution standard deviation.
        std_dev: f64,
    },
    /// Every value the same constant.
    Constant(f64),
}

impl WeightDistribution {
    /// Whether this distribution may initialize an output layer.
    ///
    /// Xavier scaling reads the *next* layer's node count, which an
    /// output layer does not have.
    #[must_use]
    pub fn valid_for_output(&self) -> bool {
        !matches!(self, Self::XavierUniform | Self::XavierNormal)
    }

    /// Produce exactly `count` values.
    ///
    /// `fan_in` is the previous layer's node count and `fan_out` the
    /// next layer's; distributions that do not use them ignore both.
    pub fn generate(
        &self,
        count: usize,
        fan_in: usize,
        fan_out: usize,
        seed: u64,
    ) -> ModelResult<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = match *self {
            Self::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
                Self::sample_uniform(&mut rng, count, -bound, bound)?
            }
            Self::XavierNormal => {
                let sigma = (2.0 / (fan_in + fan_out) as f64).sqrt();
                Self::sample_normal(&mut rng, count, 0.0, sigma)?
            }
            Self::LeCunUniform => {
                let bound = (3.0 / fan_in as f64).sqrt();
                Self::sample_uniform(&mut rng, count, -bound, bound)?
            }
            Self::LeCunNormal => {
                let sigma = (1.0 / fan_in as f64).sqrt();
                Self::sample_normal(&mut rng, count, 0.0, sigma)?
            }
            Self::Uniform { low, high } => Self::sample_uniform(&mut rng, count, low, high)?,
            Self::Gaussian { mean, std_dev } => {
                Self::sample_normal(&mut rng, count, mean, std_dev)?
            }
            Self::Constant(v) => vec![v as f32; count],
        };
        Ok(values)
    }

    fn sample_uniform(
        rng: &mut StdRng,
        count: usize,
        low: f64,
        high: f64,
    ) -> ModelResult<Vec<f32>> {
        if !(low < high) {
            return Err(ModelError::config(format!(
                "uniform range [{low}, {high}) is empty"
            )));
        }
        let dist = Uniform::new(low, high);
        Ok((0..count).map(|_| rng.sample(dist) as f32).collect())
    }

    fn sample_normal(
        rng: &mut StdRng,
        count: usize,
        mean: f64,
        std_dev: f64,
    ) -> ModelResult<Vec<f32>> {
        let dist = Normal::new(mean, std_dev)
            .map_err(|e| ModelError::config(format!("invalid normal distribution: {e}")))?;
        Ok((0..count).map(|_| rng.sample(dist) as f32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_reproduces_stream() {
        let dist = WeightDistribution::XavierUniform;
        let a = dist.generate(1000, 4, 4, 42).unwrap();
        let b = dist.generate(1000, 4, 4, 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_differs_within_bound() {
        let dist = WeightDistribution::XavierUniform;
        let a = dist.generate(1000, 4, 4, 1).unwrap();
        let b = dist.generate(1000, 4, 4, 2).unwrap();
        assert_ne!(a, b);

        let bound = (6.0f64 / 8.0).sqrt() as f32;
        for v in a.iter().chain(b.iter()) {
            assert!(v.abs() <= bound, "{v} outside ±{bound}");
        }
    }

    #[test]
    fn test_exact_count() {
        let dist = WeightDistribution::Gaussian { mean: 0.0, std_dev: 1.0 };
        assert_eq!(dist.generate(17, 1, 1, 9).unwrap().len(), 17);
    }

    #[test]
    fn test_constant_fills() {
        let dist = WeightDistribution::Constant(0.5);
        let values = dist.generate(4, 1, 1, 0).unwrap();
        assert_eq!(values, vec![0.5; 4]);
    }

    #[test]
    fn test_lecun_uniform_bound() {
        let dist = WeightDistribution::LeCunUniform;
        let values = dist.generate(500, 12, 3, 7).unwrap();
        let bound = (3.0f64 / 12.0).sqrt() as f32;
        assert!(values.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_xavier_not_valid_for_output() {
        assert!(!WeightDistribution::XavierUniform.valid_for_output());
        assert!(!WeightDistribution::XavierNormal.valid_for_output());
        assert!(WeightDistribution::LeCunNormal.valid_for_output());
        assert!(WeightDistribution::Constant(0.0).valid_for_output());
    }

    #[test]
    fn test_empty_uniform_range_rejected() {
        let dist = WeightDistribution::Uniform { low: 1.0, high: 1.0 };
        assert!(dist.generate(1, 1, 1, 0).is_err());
    }
}
