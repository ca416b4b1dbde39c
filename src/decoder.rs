//! Turning raw grating registers into a [`Measurement`].
//!
//! There is no published register map for the grating heads, so the mapping
//! is a strategy. [`ScaledDecoder`] is the default: fixed register positions,
//! a fixed scale and ranges derived from the distance to nominal.

use crate::{
    measurement::{Measurement, Parameter, Reading},
    quality::LimitTable,
};

/// Decodes the registers read from the left and right grating of one channel.
pub trait RegisterDecoder: Send + Sync {
    fn decode(&self, left: &[u16], right: &[u16], timestamp_ms: u64) -> Measurement;
}

/// Default register mapping.
///
/// | register      | parameter |
/// |---------------|-----------|
/// | left\[0\]     | P1        |
/// | left\[1\]     | P5U       |
/// | right\[0\]    | P5L       |
/// | right\[1\]    | P3        |
///
/// P4 has no register and reads as its nominal value, as do P5U and P3 when
/// their register is missing. A range is `|avg - nominal| * range_fraction`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledDecoder {
    /// Raw counts per measured unit.
    pub scale: f64,
    pub range_fraction: f64,
    nominal: [f64; 5],
}

impl ScaledDecoder {
    pub const DEFAULT_SCALE: f64 = 100.0;
    pub const DEFAULT_RANGE_FRACTION: f64 = 0.1;

    /// Takes the nominal value of each parameter from the target values of `limits`.
    pub fn from_limits(limits: &LimitTable) -> Self {
        Self {
            scale: Self::DEFAULT_SCALE,
            range_fraction: Self::DEFAULT_RANGE_FRACTION,
            nominal: Parameter::ALL.map(|parameter| limits.get(parameter).target_value),
        }
    }

    pub fn nominal(&self, parameter: Parameter) -> f64 {
        self.nominal[parameter as usize]
    }

    fn reading(&self, parameter: Parameter, raw: Option<u16>) -> Reading {
        let nominal = self.nominal(parameter);
        let avg = raw.map_or(nominal, |raw| raw as f64 / self.scale);
        Reading::new(avg, (avg - nominal).abs() * self.range_fraction)
    }
}

impl Default for ScaledDecoder {
    fn default() -> Self {
        Self::from_limits(&LimitTable::default())
    }
}

impl RegisterDecoder for ScaledDecoder {
    fn decode(&self, left: &[u16], right: &[u16], timestamp_ms: u64) -> Measurement {
        Measurement {
            p1: self.reading(Parameter::P1, left.first().copied()),
            p5u: self.reading(Parameter::P5U, left.get(1).copied()),
            p5l: self.reading(Parameter::P5L, right.first().copied()),
            p3: self.reading(Parameter::P3, right.get(1).copied()),
            p4: self.reading(Parameter::P4, None),
            timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn default_mapping() {
        let decoder = ScaledDecoder::default();
        let measurement = decoder.decode(&[22000, 42600], &[42400, 64550], 7);
        assert!(close(measurement.p1.avg, 220.0));
        assert!(close(measurement.p1.range, 0.0));
        assert!(close(measurement.p5u.avg, 426.0));
        assert!(close(measurement.p5u.range, 0.1));
        assert!(close(measurement.p5l.avg, 424.0));
        assert!(close(measurement.p5l.range, 0.1));
        assert!(close(measurement.p3.avg, 645.5));
        assert!(close(measurement.p3.range, 0.05));
        assert!(close(measurement.p4.avg, 1.0));
        assert!(close(measurement.p4.range, 0.0));
        assert_eq!(measurement.timestamp_ms, 7);
    }

    #[test]
    fn missing_second_register_reads_nominal() {
        let measurement = ScaledDecoder::default().decode(&[22100], &[42500], 0);
        assert!(close(measurement.p1.avg, 221.0));
        assert!(close(measurement.p1.range, 0.1));
        assert!(close(measurement.p5u.avg, 425.0));
        assert!(close(measurement.p3.avg, 645.0));
    }
}
