//! Weighted-choice sampling for `value:weight,...` specifications.
//!
//! The echo server's `status` and `delay` knobs share this parser: a spec
//! like `200:3,500:1` picks 200 three quarters of the time, and
//! `100ms:30,1s:1` does the same for sleep durations. A bare value with no
//! weight counts as weight 1.

use crate::error::ConfigError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WeightedChoice<T> {
    entries: Vec<(T, f64)>,
    total: f64,
}

impl<T: Clone> WeightedChoice<T> {
    /// Parses `spec` with a caller supplied value parser, so status codes
    /// and durations share the weighting logic.
    pub fn parse(
        spec: &str,
        parse_value: impl Fn(&str) -> Option<T>,
    ) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        let mut total = 0.0;
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(ConfigError::InvalidDistribution(spec.to_string()));
            }
            let (raw_value, weight) = match part.rsplit_once(':') {
                Some((v, w)) => {
                    let weight: f64 = w
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidDistribution(part.to_string()))?;
                    (v.trim(), weight)
                }
                None => (part, 1.0),
            };
            if !weight.is_finite() || weight <= 0.0 {
                return Err(ConfigError::InvalidDistribution(part.to_string()));
            }
            let value = parse_value(raw_value)
                .ok_or_else(|| ConfigError::InvalidDistribution(part.to_string()))?;
            total += weight;
            entries.push((value, weight));
        }
        Ok(Self { entries, total })
    }

    /// Draws one value with probability weight/total.
    pub fn pick<R: Rng>(&self, rng: &mut R) -> T {
        if self.entries.len() == 1 {
            return self.entries[0].0.clone();
        }
        let mut roll = rng.gen_range(0.0..self.total);
        for (value, weight) in &self.entries {
            if roll < *weight {
                return value.clone();
            }
            roll -= weight;
        }
        self.entries
            .last()
            .expect("parse rejects empty specs")
            .0
            .clone()
    }
}

/// `status` knob: HTTP status codes in 100..600.
pub fn parse_status_distribution(spec: &str) -> Result<WeightedChoice<u16>, ConfigError> {
    WeightedChoice::parse(spec, |s| {
        s.parse::<u16>().ok().filter(|c| (100..600).contains(c))
    })
}

/// `delay` knob: humantime durations (`150ms`, `1s`) or bare seconds
/// (`0.5`).
pub fn parse_delay_distribution(spec: &str) -> Result<WeightedChoice<Duration>, ConfigError> {
    WeightedChoice::parse(spec, |s| {
        humantime::parse_duration(s)
            .ok()
            .or_else(|| s.parse::<f64>().ok().filter(|v| *v >= 0.0).map(Duration::from_secs_f64))
    })
}
