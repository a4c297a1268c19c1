//! Streaming latency histogram with a fixed log-linear bucket schedule.
//!
//! The schedule is part of the JSON output contract: 23 linear buckets of
//! one resolution each, 76 log-scale buckets growing by 10^0.2 per bucket,
//! and a final overflow bucket. Per-worker histograms are merged after a
//! run, so recording stays lock-free on the hot path.

use crate::error::ConfigError;
use lazy_static::lazy_static;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const NUM_BUCKETS: usize = 100;
const LINEAR_BUCKETS: usize = 23;

// 10^(k/5) for k = 0..=4. The full table is derived from these with IEEE
// multiplications only, which keeps the schedule bit-identical across
// platforms (powf is not exactly specified, * is).
const FIFTH_DECADE_STEPS: [f64; 5] = [
    1.0,
    1.584_893_192_461_113_6,
    2.511_886_431_509_580_6,
    3.981_071_705_534_972_2,
    6.309_573_444_801_933,
];

lazy_static! {
    /// Upper bounds of buckets 0..=99, in resolution units.
    static ref BUCKET_BOUNDS: [f64; NUM_BUCKETS] = bucket_bounds();
}

fn bucket_bounds() -> [f64; NUM_BUCKETS] {
    let mut bounds = [0.0; NUM_BUCKETS];
    for (i, b) in bounds.iter_mut().enumerate().take(LINEAR_BUCKETS) {
        *b = (i + 1) as f64;
    }
    for (i, b) in bounds
        .iter_mut()
        .enumerate()
        .take(NUM_BUCKETS - 1)
        .skip(LINEAR_BUCKETS)
    {
        let k = i + 1 - LINEAR_BUCKETS;
        let scale = 10f64.powi((k / 5) as i32) * FIFTH_DECADE_STEPS[k % 5];
        *b = (LINEAR_BUCKETS as f64 * scale).round();
    }
    bounds[NUM_BUCKETS - 1] = f64::INFINITY;
    bounds
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsError {
    #[error("sample is not a number")]
    InvalidSample,

    #[error("histogram bucket schedules differ")]
    ScheduleMismatch,
}

/// Fixed-memory sample distribution. `offset` shifts the origin of the
/// bucket schedule and `resolution` is the width of the linear buckets,
/// both in the unit of the recorded values (seconds for latencies, bytes
/// for sizes).
#[derive(Debug, Clone)]
pub struct Histogram {
    offset: f64,
    resolution: f64,
    counts: Box<[u64; NUM_BUCKETS]>,
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    pub fn new(offset: f64, resolution: f64) -> Self {
        Self {
            offset,
            resolution,
            counts: Box::new([0; NUM_BUCKETS]),
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Adds one sample in O(1). Values below `offset` land in the first
    /// bucket, values past the last bound in the overflow bucket.
    pub fn record(&mut self, value: f64) -> Result<(), StatsError> {
        if value.is_nan() {
            return Err(StatsError::InvalidSample);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        let scaled = (value - self.offset) / self.resolution;
        let idx = BUCKET_BOUNDS.partition_point(|&b| b <= scaled);
        self.counts[idx] += 1;
        Ok(())
    }

    /// Elapsed-time convenience for the runner hot path; durations are
    /// always finite.
    pub fn record_duration(&mut self, elapsed: Duration) {
        let _ = self.record(elapsed.as_secs_f64());
    }

    /// Adds all of `other`'s samples. Only histograms sharing a schedule
    /// can merge; the operation is commutative and order independent.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), StatsError> {
        if self.offset != other.offset || self.resolution != other.resolution {
            return Err(StatsError::ScheduleMismatch);
        }
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let avg = self.sum / n;
        // Floor at zero to absorb floating point rounding.
        (self.sum_sq / n - avg * avg).max(0.0).sqrt()
    }

    fn value_at(&self, units: f64) -> f64 {
        self.offset + self.resolution * units
    }

    fn lower_bound(&self, idx: usize) -> f64 {
        if idx == 0 {
            self.offset
        } else {
            self.value_at(BUCKET_BOUNDS[idx - 1])
        }
    }

    /// Quantile by cumulative bucket walk with linear interpolation inside
    /// the containing bucket. The first occupied bucket is bounded below by
    /// `min` and the last occupied one above by `max`, so p=100 is exactly
    /// the maximum and results are monotonic in p.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if p >= 100.0 {
            return self.max;
        }
        let first = self
            .counts
            .iter()
            .position(|&c| c != 0)
            .unwrap_or(NUM_BUCKETS - 1);
        let last = self.counts.iter().rposition(|&c| c != 0).unwrap_or(0);
        let rank = p / 100.0 * self.count as f64;
        let mut cumulative = 0u64;
        for i in first..=last {
            let c = self.counts[i];
            if c == 0 {
                continue;
            }
            let prev = cumulative as f64;
            cumulative += c;
            if (cumulative as f64) < rank {
                continue;
            }
            let lower = if i == first {
                self.min
            } else {
                self.lower_bound(i)
            };
            let upper = if i == last {
                self.max
            } else {
                self.value_at(BUCKET_BOUNDS[i])
            };
            let frac = ((rank - prev) / c as f64).clamp(0.0, 1.0);
            return (lower + frac * (upper - lower)).clamp(self.min, self.max);
        }
        self.max
    }

    /// Renders the distribution with the given percentile list. The list is
    /// an input, not histogram state, so one histogram can be exported at
    /// several resolutions of interest.
    pub fn export(&self, percentiles: &[f64]) -> DistributionReport {
        let rows = percentiles
            .iter()
            .map(|&p| PercentileRow {
                percentile: p,
                value: self.percentile(p),
            })
            .collect();
        if self.count == 0 {
            return DistributionReport {
                count: 0,
                min: 0.0,
                max: 0.0,
                sum: 0.0,
                avg: 0.0,
                std_dev: 0.0,
                data: Vec::new(),
                percentiles: rows,
            };
        }
        let first = self.counts.iter().position(|&c| c != 0).unwrap_or(0);
        let last = self.counts.iter().rposition(|&c| c != 0).unwrap_or(0);
        let mut data = Vec::new();
        let mut cumulative = 0u64;
        for i in first..=last {
            let c = self.counts[i];
            if c == 0 {
                continue;
            }
            cumulative += c;
            data.push(BucketRow {
                start: if i == first {
                    self.min
                } else {
                    self.lower_bound(i)
                },
                end: if i == last {
                    self.max
                } else {
                    self.value_at(BUCKET_BOUNDS[i])
                },
                percent: 100.0 * cumulative as f64 / self.count as f64,
                count: c,
            });
        }
        DistributionReport {
            count: self.count,
            min: self.min,
            max: self.max,
            sum: self.sum,
            avg: self.avg(),
            std_dev: self.std_dev(),
            data,
            percentiles: rows,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DistributionReport {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
    pub std_dev: f64,
    pub data: Vec<BucketRow>,
    pub percentiles: Vec<PercentileRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketRow {
    pub start: f64,
    pub end: f64,
    /// Cumulative percentage of samples at the end of this bucket.
    pub percent: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PercentileRow {
    pub percentile: f64,
    pub value: f64,
}

/// Parses a comma separated percentile list such as `"50,75,90,99,99.9"`.
/// Returns the values sorted ascending and deduplicated.
pub fn parse_percentiles(spec: &str) -> Result<Vec<f64>, ConfigError> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let p: f64 = part
            .parse()
            .map_err(|_| ConfigError::InvalidPercentile(part.to_string()))?;
        if !(p > 0.0 && p <= 100.0) {
            return Err(ConfigError::InvalidPercentile(part.to_string()));
        }
        out.push(p);
    }
    out.sort_by(|a, b| a.partial_cmp(b).expect("percentiles are not NaN"));
    out.dedup();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_monotonic_and_anchored() {
        assert_eq!(BUCKET_BOUNDS[0], 1.0);
        assert_eq!(BUCKET_BOUNDS[LINEAR_BUCKETS - 1], LINEAR_BUCKETS as f64);
        for w in BUCKET_BOUNDS.windows(2) {
            assert!(w[0] < w[1], "{} !< {}", w[0], w[1]);
        }
        assert!(BUCKET_BOUNDS[NUM_BUCKETS - 1].is_infinite());
        // One full decade past the linear region multiplies by 10.
        assert_eq!(BUCKET_BOUNDS[LINEAR_BUCKETS + 4], 230.0);
    }

    #[test]
    fn records_into_expected_buckets() {
        let mut h = Histogram::new(0.0, 0.001);
        for v in [0.001, 0.002, 0.003, 0.004, 1.0] {
            h.record(v).unwrap();
        }
        assert_eq!(h.count(), 5);
        assert_eq!(h.min(), 0.001);
        assert_eq!(h.max(), 1.0);
        let p50 = h.percentile(50.0);
        assert!(
            (p50 - 0.003).abs() <= 0.001,
            "p50 {p50} not within one bucket of 0.003"
        );
        assert_eq!(h.percentile(100.0), 1.0);
    }

    #[test]
    fn rejects_nan_samples() {
        let mut h = Histogram::new(0.0, 0.001);
        assert_eq!(h.record(f64::NAN), Err(StatsError::InvalidSample));
        assert_eq!(h.count(), 0);
        // Negative values are fine and land in the first bucket.
        h.record(-0.5).unwrap();
        assert_eq!(h.count(), 1);
        assert_eq!(h.min(), -0.5);
    }

    #[test]
    fn merge_combines_and_commutes() {
        let mut a = Histogram::new(0.0, 1.0);
        let mut b = Histogram::new(0.0, 1.0);
        for v in [1.0, 2.0, 3.0] {
            a.record(v).unwrap();
        }
        for v in [4.0, 5.0, 6.0] {
            b.record(v).unwrap();
        }
        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab.count(), 6);
        assert_eq!(ab.percentile(100.0), 6.0);
        assert!((ab.avg() - 3.5).abs() < 1e-9);

        let ps = [50.0, 90.0, 99.0, 100.0];
        let left = ab.export(&ps);
        let right = ba.export(&ps);
        assert_eq!(left.count, right.count);
        for (l, r) in left.percentiles.iter().zip(right.percentiles.iter()) {
            assert_eq!(l.value, r.value);
        }
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let mut a = Histogram::new(0.0, 0.001);
        for v in [0.01, 0.02, 0.05] {
            a.record(v).unwrap();
        }
        let before = a.export(&[50.0, 99.0]);
        a.merge(&Histogram::new(0.0, 0.001)).unwrap();
        let after = a.export(&[50.0, 99.0]);
        assert_eq!(before.count, after.count);
        assert_eq!(before.min, after.min);
        assert_eq!(before.max, after.max);
        for (b, a) in before.percentiles.iter().zip(after.percentiles.iter()) {
            assert_eq!(b.value, a.value);
        }
    }

    #[test]
    fn merge_rejects_schedule_mismatch() {
        let mut a = Histogram::new(0.0, 0.001);
        let b = Histogram::new(0.0, 0.01);
        assert_eq!(a.merge(&b), Err(StatsError::ScheduleMismatch));
        let c = Histogram::new(0.5, 0.001);
        assert_eq!(a.merge(&c), Err(StatsError::ScheduleMismatch));
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut h = Histogram::new(0.0, 0.001);
        for i in 0..1000 {
            h.record(i as f64 * 0.0003).unwrap();
        }
        let ps: Vec<f64> = (1..=100).map(|p| p as f64).collect();
        let report = h.export(&ps);
        for w in report.percentiles.windows(2) {
            assert!(
                w[0].value <= w[1].value,
                "p{} = {} > p{} = {}",
                w[0].percentile,
                w[0].value,
                w[1].percentile,
                w[1].value
            );
        }
        assert_eq!(report.percentiles.last().unwrap().value, h.max());
    }

    #[test]
    fn export_clamps_extreme_buckets() {
        let mut h = Histogram::new(0.0, 0.001);
        h.record(0.0123).unwrap();
        h.record(0.0456).unwrap();
        let report = h.export(&[50.0]);
        assert_eq!(report.data.first().unwrap().start, 0.0123);
        assert_eq!(report.data.last().unwrap().end, 0.0456);
        assert_eq!(report.data.last().unwrap().percent, 100.0);
        let total: u64 = report.data.iter().map(|b| b.count).sum();
        assert_eq!(total, report.count);
    }

    #[test]
    fn std_dev_matches_direct_computation() {
        let mut h = Histogram::new(0.0, 0.001);
        let values = [0.1, 0.2, 0.3, 0.4];
        for v in values {
            h.record(v).unwrap();
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        assert!((h.std_dev() - var.sqrt()).abs() < 1e-9);
        assert!((h.avg() - mean).abs() < 1e-9);
    }

    #[test]
    fn parse_percentiles_accepts_and_sorts() {
        let ps = parse_percentiles("99, 50,75,90,99.9").unwrap();
        assert_eq!(ps, vec![50.0, 75.0, 90.0, 99.0, 99.9]);
        let ps = parse_percentiles("50,50,100").unwrap();
        assert_eq!(ps, vec![50.0, 100.0]);
    }

    #[test]
    fn parse_percentiles_rejects_out_of_range() {
        assert!(parse_percentiles("0").is_err());
        assert!(parse_percentiles("-5").is_err());
        assert!(parse_percentiles("101").is_err());
        assert!(parse_percentiles("50,abc").is_err());
        assert!(parse_percentiles("").is_err());
        assert!(parse_percentiles("NaN").is_err());
    }

    #[test]
    fn report_serializes_with_contract_keys() {
        let mut h = Histogram::new(0.0, 0.001);
        h.record(0.002).unwrap();
        let json = serde_json::to_value(h.export(&[50.0])).unwrap();
        for key in ["Count", "Min", "Max", "Sum", "Avg", "StdDev", "Data", "Percentiles"] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert!(json["Data"][0].get("Start").is_some());
        assert!(json["Percentiles"][0].get("Percentile").is_some());
    }
}
