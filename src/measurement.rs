//! Measurement samples produced once per channel and poll cycle.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// The five grating parameters tracked per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parameter {
    P1,
    P5U,
    P5L,
    P3,
    P4,
}

impl Parameter {
    pub const ALL: [Parameter; 5] = [
        Parameter::P1,
        Parameter::P5U,
        Parameter::P5L,
        Parameter::P3,
        Parameter::P4,
    ];

    /// Parameters checked against their spec limits on every sample, in check order.
    pub const ALARMED: [Parameter; 3] = [Parameter::P1, Parameter::P5U, Parameter::P5L];

    pub fn name(&self) -> &'static str {
        match self {
            Parameter::P1 => "P1",
            Parameter::P5U => "P5U",
            Parameter::P5L => "P5L",
            Parameter::P3 => "P3",
            Parameter::P4 => "P4",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown parameter '{0}'")]
pub struct UnknownParameter(pub String);

impl FromStr for Parameter {
    type Err = UnknownParameter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .into_iter()
            .find(|parameter| parameter.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownParameter(s.to_string()))
    }
}

/// Average and range of one parameter within a sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub avg: f64,
    pub range: f64,
}

impl Reading {
    pub fn new(avg: f64, range: f64) -> Self {
        Self { avg, range }
    }
}

/// One immutable sample of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    pub p1: Reading,
    pub p5u: Reading,
    pub p5l: Reading,
    pub p3: Reading,
    pub p4: Reading,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Measurement {
    pub fn reading(&self, parameter: Parameter) -> Reading {
        match parameter {
            Parameter::P1 => self.p1,
            Parameter::P5U => self.p5u,
            Parameter::P5L => self.p5l,
            Parameter::P3 => self.p3,
            Parameter::P4 => self.p4,
        }
    }

    pub fn avg(&self, parameter: Parameter) -> f64 {
        self.reading(parameter).avg
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.timestamp_ms)?;
        for parameter in Parameter::ALL {
            let reading = self.reading(parameter);
            write!(f, " {parameter}={:.3}/{:.3}", reading.avg, reading.range)?;
        }
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
