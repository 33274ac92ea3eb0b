//! Raw-to-engineering-unit scale transforms.
//!
//! A [`ScaleTransform`] is a pure function. It is stored as segment metadata
//! next to the raw samples and applied when data is read or displayed, so a
//! calibration fix only ever touches metadata.

use serde::{Deserialize, Serialize};

/// Tagged scale variant, serialized as `{"type": "linear", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScaleTransform {
    /// `gain * raw + offset`
    Linear { gain: f64, offset: f64 },
    /// `c0 + c1*raw + c2*raw^2 + ...`
    Polynomial { coefficients: Vec<f64> },
    /// Piecewise-linear lookup over `(raw, scaled)` pairs sorted by raw value.
    /// Inputs outside the table are clamped to the first/last scaled value.
    Table { breakpoints: Vec<(f64, f64)> },
}

impl Default for ScaleTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl ScaleTransform {
    /// `Linear { gain: 1, offset: 0 }`
    pub const fn identity() -> Self {
        Self::Linear {
            gain: 1.0,
            offset: 0.0,
        }
    }

    /// Apply the transform to one raw sample.
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            Self::Linear { gain, offset } => gain * raw + offset,
            Self::Polynomial { coefficients } => coefficients
                .iter()
                .rev()
                .fold(0.0, |acc, c| acc * raw + c),
            Self::Table { breakpoints } => interpolate(breakpoints, raw),
        }
    }

    /// Apply the transform to a slice of raw samples.
    pub fn apply_all(&self, raw: &[f64]) -> Vec<f64> {
        raw.iter().map(|&x| self.apply(x)).collect()
    }

    /// Check the parameters. Returns a human readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Linear { gain, offset } => {
                if !gain.is_finite() || !offset.is_finite() {
                    return Err("linear gain and offset must be finite".into());
                }
            }
            Self::Polynomial { coefficients } => {
                if coefficients.is_empty() {
                    return Err("polynomial needs at least one coefficient".into());
                }
                if coefficients.iter().any(|c| !c.is_finite()) {
                    return Err("polynomial coefficients must be finite".into());
                }
            }
            Self::Table { breakpoints } => {
                if breakpoints.is_empty() {
                    return Err("table needs at least one breakpoint".into());
                }
                if breakpoints
                    .iter()
                    .any(|(raw, scaled)| !raw.is_finite() || !scaled.is_finite())
                {
                    return Err("table breakpoints must be finite".into());
                }
                if breakpoints.windows(2).any(|w| w[0].0 >= w[1].0) {
                    return Err("table raw values must be strictly increasing".into());
                }
            }
        }
        Ok(())
    }
}

fn interpolate(breakpoints: &[(f64, f64)], raw: f64) -> f64 {
    let (Some(first), Some(last)) = (breakpoints.first(), breakpoints.last()) else {
        return raw;
    };
    if raw <= first.0 {
        return first.1;
    }
    if raw >= last.0 {
        return last.1;
    }
    // first index whose raw value is > raw; always in 1..len here
    let upper = breakpoints.partition_point(|(x, _)| *x <= raw);
    let (x0, y0) = breakpoints[upper - 1];
    let (x1, y1) = breakpoints[upper];
    y0 + (raw - x0) * (y1 - y0) / (x1 - x0)
}
