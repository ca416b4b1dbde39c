//! Synthetic measurements for running without a serial link.
//!
//! Every parameter is drawn from an independent normal distribution centred on
//! the midpoint of its spec limits. Ranges are the magnitude of a zero-mean
//! normal draw.

use crate::{
    measurement::{Measurement, Parameter, Reading},
    quality::LimitTable,
};

/// Standard deviation of the simulated average for each parameter.
pub fn default_sigma(parameter: Parameter) -> f64 {
    match parameter {
        Parameter::P1 => 0.3,
        Parameter::P5U | Parameter::P5L => 0.5,
        Parameter::P3 => 0.8,
        Parameter::P4 => 0.1,
    }
}

/// Standard deviation of the zero-mean draw behind every simulated range.
pub const RANGE_SIGMA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Simulator {
    mean: [f64; 5],
    sigma: [f64; 5],
    range_sigma: f64,
}

impl Simulator {
    pub fn from_limits(limits: &LimitTable) -> Self {
        Self {
            mean: Parameter::ALL.map(|parameter| limits.get(parameter).midpoint()),
            sigma: Parameter::ALL.map(default_sigma),
            range_sigma: RANGE_SIGMA,
        }
    }

    pub fn mean(&self, parameter: Parameter) -> f64 {
        self.mean[parameter as usize]
    }

    pub fn sigma(&self, parameter: Parameter) -> f64 {
        self.sigma[parameter as usize]
    }

    pub fn set_sigma(&mut self, parameter: Parameter, sigma: f64) {
        self.sigma[parameter as usize] = sigma;
    }

    pub fn sample(&self, timestamp_ms: u64) -> Measurement {
        let reading = |parameter: Parameter| {
            Reading::new(
                normal(self.mean(parameter), self.sigma(parameter)),
                normal(0.0, self.range_sigma).abs(),
            )
        };
        Measurement {
            p1: reading(Parameter::P1),
            p5u: reading(Parameter::P5U),
            p5l: reading(Parameter::P5L),
            p3: reading(Parameter::P3),
            p4: reading(Parameter::P4),
            timestamp_ms,
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::from_limits(&LimitTable::default())
    }
}

/// Draws from N(mean, sigma) with the Box-Muller transform.
fn normal(mean: f64, sigma: f64) -> f64 {
    // Keep u1 away from zero so ln(u1) stays finite.
    let u1 = rand::random::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rand::random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + sigma * z
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centred_on_limit_midpoints() {
        let simulator = Simulator::default();
        assert!((simulator.mean(Parameter::P1) - 220.0).abs() < 1e-9);
        assert!((simulator.mean(Parameter::P5U) - 425.0).abs() < 1e-9);
        assert!((simulator.mean(Parameter::P5L) - 425.0).abs() < 1e-9);
        assert_eq!(simulator.mean(Parameter::P3), 645.0);
        assert_eq!(simulator.mean(Parameter::P4), 1.0);
        assert_eq!(simulator.sigma(Parameter::P3), 0.8);
    }

    #[test]
    fn sample_distribution() {
        let simulator = Simulator::default();
        let samples: Vec<Measurement> = (0..4000).map(|i| simulator.sample(i)).collect();

        let p1: Vec<f64> = samples.iter().map(|m| m.p1.avg).collect();
        let mean = p1.iter().sum::<f64>() / p1.len() as f64;
        let variance =
            p1.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (p1.len() - 1) as f64;
        assert!((mean - 220.0).abs() < 0.05, "mean {mean}");
        assert!((variance.sqrt() - 0.3).abs() < 0.03, "stddev {}", variance.sqrt());

        assert!(samples
            .iter()
            .all(|m| Parameter::ALL.iter().all(|&p| m.reading(p).range >= 0.0
                && m.reading(p).avg.is_finite())));
        assert_eq!(samples[17].timestamp_ms, 17);
    }

    #[test]
    fn zero_sigma_is_deterministic() {
        let mut simulator = Simulator::default();
        simulator.set_sigma(Parameter::P4, 0.0);
        assert_eq!(simulator.sample(0).p4.avg, 1.0);
    }
}
