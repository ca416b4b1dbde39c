//! Process capability statistics (Cp/Cpk) against per-parameter spec limits.
//!
//! [`compute_statistics`] is a pure function over a slice of samples.
//! [`QualityEngine`] adds the limit table and a cache of the latest snapshot per
//! channel and parameter, from which text reports are generated.
//!
//! ```
//! use grating_qc_lib::{channel::Channel, measurement::Parameter, quality::{QualityEngine, QualityStatus}};
//!
//! let mut engine = QualityEngine::default();
//! let channel = Channel::try_from(1).unwrap();
//! let snapshot = engine.update_statistics(channel, Parameter::P1, &[219.9, 220.0, 220.1]);
//! assert_eq!(QualityStatus::from_cpk(snapshot.cpk), QualityStatus::Excellent);
//! assert!(engine.generate_report(channel).contains("Parameter: P1"));
//! ```

use crate::{channel::Channel, measurement::Parameter};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Specification limits and capability thresholds of one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpecLimits {
    pub lower_spec_limit: f64,
    pub upper_spec_limit: f64,
    pub target_value: f64,
    /// Below this Cpk the parameter is flagged as a warning.
    pub warning_cpk: f64,
    /// Below this Cpk the parameter is flagged as an alarm.
    pub alarm_cpk: f64,
}

impl SpecLimits {
    pub const DEFAULT_WARNING_CPK: f64 = 1.33;
    pub const DEFAULT_ALARM_CPK: f64 = 1.0;

    /// Limits of a parameter nobody configured; capability indices evaluate to 0.
    pub const UNCONFIGURED: SpecLimits = SpecLimits {
        lower_spec_limit: 0.0,
        upper_spec_limit: 0.0,
        target_value: 0.0,
        warning_cpk: Self::DEFAULT_WARNING_CPK,
        alarm_cpk: Self::DEFAULT_ALARM_CPK,
    };

    pub const fn new(lower_spec_limit: f64, upper_spec_limit: f64, target_value: f64) -> Self {
        Self {
            lower_spec_limit,
            upper_spec_limit,
            target_value,
            warning_cpk: Self::DEFAULT_WARNING_CPK,
            alarm_cpk: Self::DEFAULT_ALARM_CPK,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.upper_spec_limit != self.lower_spec_limit
    }

    pub fn midpoint(&self) -> f64 {
        (self.lower_spec_limit + self.upper_spec_limit) / 2.0
    }

    /// Inclusive on both limits.
    pub fn contains(&self, value: f64) -> bool {
        (self.lower_spec_limit..=self.upper_spec_limit).contains(&value)
    }

    pub fn capability_level(&self, cpk: f64) -> CapabilityLevel {
        if cpk >= self.warning_cpk {
            CapabilityLevel::Capable
        } else if cpk >= self.alarm_cpk {
            CapabilityLevel::Warning
        } else {
            CapabilityLevel::Alarm
        }
    }
}

/// Spec limits for every parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitTable {
    entries: BTreeMap<Parameter, SpecLimits>,
}

impl LimitTable {
    /// A table without any configured parameter.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Returns the limits of `parameter`, or [`SpecLimits::UNCONFIGURED`].
    pub fn get(&self, parameter: Parameter) -> SpecLimits {
        self.entries
            .get(&parameter)
            .copied()
            .unwrap_or(SpecLimits::UNCONFIGURED)
    }

    pub fn set(&mut self, parameter: Parameter, limits: SpecLimits) {
        self.entries.insert(parameter, limits);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Parameter, &SpecLimits)> {
        self.entries.iter().map(|(parameter, limits)| (*parameter, limits))
    }
}

impl Default for LimitTable {
    /// The production tolerances of the grating line.
    fn default() -> Self {
        let mut table = Self::empty();
        table.set(Parameter::P1, SpecLimits::new(219.10, 220.90, 220.0));
        table.set(Parameter::P5U, SpecLimits::new(423.90, 426.10, 425.0));
        table.set(Parameter::P5L, SpecLimits::new(423.90, 426.10, 425.0));
        table.set(Parameter::P3, SpecLimits::new(643.0, 647.0, 645.0));
        table.set(Parameter::P4, SpecLimits::new(0.5, 1.5, 1.0));
        table
    }
}

/// Descriptive statistics and capability indices of one data slice.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatisticsSnapshot {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
    pub cp: f64,
    pub cpk: f64,
    pub sample_count: usize,
}

/// Computes mean, sample standard deviation (n-1), extremes, Cp and Cpk.
///
/// Empty input yields a zeroed snapshot. Cp and Cpk are 0 when the standard
/// deviation is 0 or the limits are not configured.
pub fn compute_statistics(samples: &[f64], limits: &SpecLimits) -> StatisticsSnapshot {
    if samples.is_empty() {
        return StatisticsSnapshot::default();
    }

    let count = samples.len();
    let mean = samples.iter().sum::<f64>() / count as f64;
    let stddev = if count > 1 {
        let squares = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
        (squares / (count - 1) as f64).sqrt()
    } else {
        0.0
    };
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let (cp, cpk) = if stddev > 0.0 && limits.is_configured() {
        let usl = limits.upper_spec_limit;
        let lsl = limits.lower_spec_limit;
        let cpu = (usl - mean) / (3.0 * stddev);
        let cpl = (mean - lsl) / (3.0 * stddev);
        ((usl - lsl) / (6.0 * stddev), cpu.min(cpl))
    } else {
        (0.0, 0.0)
    };

    StatisticsSnapshot {
        mean,
        stddev,
        min,
        max,
        range: max - min,
        cp,
        cpk,
        sample_count: count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityStatus {
    Excellent,
    Good,
    Acceptable,
    NeedsImprovement,
}

impl QualityStatus {
    /// Bands are inclusive on their lower bound.
    pub fn from_cpk(cpk: f64) -> Self {
        if cpk >= 1.67 {
            QualityStatus::Excellent
        } else if cpk >= 1.33 {
            QualityStatus::Good
        } else if cpk >= 1.0 {
            QualityStatus::Acceptable
        } else {
            QualityStatus::NeedsImprovement
        }
    }
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityStatus::Excellent => "Excellent",
            QualityStatus::Good => "Good",
            QualityStatus::Acceptable => "Acceptable",
            QualityStatus::NeedsImprovement => "Needs improvement",
        })
    }
}

/// Capability of a parameter relative to its own warning/alarm Cpk thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapabilityLevel {
    Capable,
    Warning,
    Alarm,
}

impl fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CapabilityLevel::Capable => "capable",
            CapabilityLevel::Warning => "warning",
            CapabilityLevel::Alarm => "alarm",
        })
    }
}

/// Limit table plus the latest statistics of every channel and parameter.
#[derive(Debug, Clone, Default)]
pub struct QualityEngine {
    limits: LimitTable,
    // Per channel, in order of first insertion.
    statistics: BTreeMap<Channel, Vec<(Parameter, StatisticsSnapshot)>>,
}

impl QualityEngine {
    pub fn new(limits: LimitTable) -> Self {
        Self {
            limits,
            statistics: BTreeMap::new(),
        }
    }

    pub fn set_limits(&mut self, parameter: Parameter, limits: SpecLimits) {
        self.limits.set(parameter, limits);
    }

    pub fn limits(&self, parameter: Parameter) -> SpecLimits {
        self.limits.get(parameter)
    }

    pub fn limit_table(&self) -> &LimitTable {
        &self.limits
    }

    pub fn compute_statistics(&self, samples: &[f64], parameter: Parameter) -> StatisticsSnapshot {
        compute_statistics(samples, &self.limits(parameter))
    }

    pub fn is_within_limits(&self, value: f64, parameter: Parameter) -> bool {
        self.limits(parameter).contains(value)
    }

    pub fn capability_level(&self, parameter: Parameter, cpk: f64) -> CapabilityLevel {
        self.limits(parameter).capability_level(cpk)
    }

    /// Recomputes and replaces the cached snapshot of `channel`/`parameter`.
    pub fn update_statistics(
        &mut self,
        channel: Channel,
        parameter: Parameter,
        samples: &[f64],
    ) -> StatisticsSnapshot {
        let snapshot = self.compute_statistics(samples, parameter);
        let entries = self.statistics.entry(channel).or_default();
        match entries.iter_mut().find(|(cached, _)| *cached == parameter) {
            Some((_, cached)) => *cached = snapshot,
            None => entries.push((parameter, snapshot)),
        }
        snapshot
    }

    pub fn statistics(&self, channel: Channel, parameter: Parameter) -> Option<StatisticsSnapshot> {
        self.statistics
            .get(&channel)?
            .iter()
            .find(|(cached, _)| *cached == parameter)
            .map(|(_, snapshot)| *snapshot)
    }

    /// Human readable dump of every cached snapshot of `channel`.
    ///
    /// A channel without statistics yields an empty string.
    pub fn generate_report(&self, channel: Channel) -> String {
        let Some(entries) = self.statistics.get(&channel) else {
            return String::new();
        };

        let mut report = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(report, "Channel {channel} quality report");
        let _ = writeln!(report, "========================");
        for (parameter, stats) in entries {
            let _ = write!(
                report,
                "\nParameter: {parameter}\n  \
                 Samples: {}\n  \
                 Mean: {:.3}\n  \
                 Std dev: {:.3}\n  \
                 Min: {:.3}\n  \
                 Max: {:.3}\n  \
                 Range: {:.3}\n  \
                 Cpk: {:.3}\n  \
                 Cp: {:.3}\n  \
                 Status: {}\n",
                stats.sample_count,
                stats.mean,
                stats.stddev,
                stats.min,
                stats.max,
                stats.range,
                stats.cpk,
                stats.cp,
                QualityStatus::from_cpk(stats.cpk)
            );
        }
        report
    }
}
