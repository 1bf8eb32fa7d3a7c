//! Rainfall series construction.
//!
//! Series are tables of rain rates in metres per second indexed by elapsed
//! seconds, one column per rainfall location.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RainfallError {
    #[error("rainfall window {start} .. {end} contains no samples")]
    EmptyWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("rainfall window starts at {start}, before the dataset start {dataset_start}")]
    BeforeDataset {
        start: DateTime<Utc>,
        dataset_start: DateTime<Utc>,
    },
    #[error("rainfall frequency must be positive, got {0}s")]
    InvalidFrequency(i64),
    #[error("rainfall location {location} has {found} samples, expected {expected}")]
    Truncated {
        location: usize,
        expected: usize,
        found: usize,
    },
    #[error("no rainfall locations intersect the domain")]
    NoLocations,
}

/// Unit of the depths stored in a rainfall dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthUnit {
    #[default]
    #[serde(alias = "mm")]
    Millimetres,
    #[serde(alias = "m")]
    Metres,
}

impl DepthUnit {
    /// Factor converting this unit to metres.
    pub fn to_metres(self) -> f64 {
        match self {
            DepthUnit::Millimetres => 0.001,
            DepthUnit::Metres => 1.0,
        }
    }
}

/// Inclusive, 1-based slice of a dataset's sample arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleWindow {
    pub first: i64,
    pub last: i64,
}

impl SampleWindow {
    pub fn rows(&self) -> usize {
        (self.last - self.first + 1).max(0) as usize
    }
}

/// Map a timestamp window onto dataset sample indices.
///
/// Sample `n` (1-based) covers `dataset_start + (n - 1) * frequency`. The
/// window's end sample is excluded, so an aligned window yields
/// `(end - start) / frequency` rows. Non-aligned timestamps truncate.
pub fn sample_window(
    dataset_start: DateTime<Utc>,
    frequency_secs: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<SampleWindow, RainfallError> {
    if frequency_secs <= 0 {
        return Err(RainfallError::InvalidFrequency(frequency_secs));
    }
    if start < dataset_start {
        return Err(RainfallError::BeforeDataset {
            start,
            dataset_start,
        });
    }

    let offset = |ts: DateTime<Utc>| (ts - dataset_start).num_seconds() / frequency_secs + 1;
    let window = SampleWindow {
        first: offset(start),
        last: offset(end) - 1,
    };
    if window.last < window.first {
        return Err(RainfallError::EmptyWindow { start, end });
    }
    Ok(window)
}

/// Rain rates (m/s) per location over elapsed time.
#[derive(Debug, Clone, PartialEq)]
pub struct RainfallSeries {
    elapsed: Vec<f64>,
    /// `rates[row][location]`
    rates: Vec<Vec<f64>>,
}

impl RainfallSeries {
    /// Synthetic single-location event of `total_mm` over `duration_secs`.
    ///
    /// The rate holds for `[0, duration]` and drops to zero one second later.
    pub fn uniform(total_mm: f64, duration_secs: u32) -> Self {
        let d = f64::from(duration_secs);
        let rate = if duration_secs == 0 {
            0.0
        } else {
            total_mm / 1000.0 / d
        };
        Self {
            elapsed: vec![0.0, d, d + 1.0, d + 2.0],
            rates: vec![vec![rate], vec![rate], vec![0.0], vec![0.0]],
        }
    }

    /// Build from per-location sample arrays covering `window`.
    ///
    /// Each value is a depth per sampling interval in `unit`.
    pub fn from_locations(
        columns: &[Vec<f64>],
        window: SampleWindow,
        frequency_secs: i64,
        unit: DepthUnit,
    ) -> Result<Self, RainfallError> {
        if frequency_secs <= 0 {
            return Err(RainfallError::InvalidFrequency(frequency_secs));
        }
        if columns.is_empty() {
            return Err(RainfallError::NoLocations);
        }

        let rows = window.rows();
        for (location, column) in columns.iter().enumerate() {
            if column.len() < rows {
                return Err(RainfallError::Truncated {
                    location,
                    expected: rows,
                    found: column.len(),
                });
            }
        }

        let scale = unit.to_metres() / frequency_secs as f64;
        let elapsed = (0..rows)
            .map(|row| (row as i64 * frequency_secs) as f64)
            .collect();
        let rates = (0..rows)
            .map(|row| columns.iter().map(|col| col[row] * scale).collect())
            .collect();

        Ok(Self { elapsed, rates })
    }

    pub fn rows(&self) -> usize {
        self.elapsed.len()
    }

    pub fn locations(&self) -> usize {
        self.rates.first().map_or(0, Vec::len)
    }

    pub fn elapsed(&self) -> &[f64] {
        &self.elapsed
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rates.get(index).map(Vec::as_slice)
    }
}

#[cfg(test)]
impl RainfallSeries {
    /// Rate at `t` seconds for a location, linearly interpolated between
    /// control points and held constant outside them.
    fn rate_at(&self, t: f64, location: usize) -> f64 {
        let rate = |row: usize| {
            self.rates
                .get(row)
                .and_then(|r| r.get(location))
                .copied()
                .unwrap_or(0.0)
        };

        let n = self.elapsed.len();
        if n == 0 {
            return 0.0;
        }
        if t <= self.elapsed[0] {
            return rate(0);
        }
        for i in 1..n {
            let (t0, t1) = (self.elapsed[i - 1], self.elapsed[i]);
            if t <= t1 {
                if t1 == t0 {
                    return rate(i);
                }
                let w = (t - t0) / (t1 - t0);
                return rate(i - 1) * (1.0 - w) + rate(i) * w;
            }
        }
        rate(n - 1)
    }

    /// Depth in metres accumulated at a location over `[0, secs]`.
    fn depth_over(&self, location: usize, secs: f64) -> f64 {
        let mut depth = 0.0;
        let mut prev = 0.0;
        let mut points: Vec<f64> = self
            .elapsed
            .iter()
            .copied()
            .filter(|t| *t > 0.0 && *t < secs)
            .collect();
        points.push(secs);

        for t in points {
            let mean = (self.rate_at(prev, location) + self.rate_at(t, location)) / 2.0;
            depth += mean * (t - prev);
            prev = t;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_uniform_rates() {
        let series = RainfallSeries::uniform(100.0, 500);
        assert_eq!(series.elapsed(), &[0.0, 500.0, 501.0, 502.0]);
        assert!((series.rate_at(0.0, 0) - 0.0002).abs() < 1e-12);
        assert!((series.rate_at(250.0, 0) - 0.0002).abs() < 1e-12);
        assert_eq!(series.rate_at(501.0, 0), 0.0);
        assert_eq!(series.rate_at(502.0, 0), 0.0);
    }

    #[test]
    fn test_uniform_depth_matches_total() {
        let series = RainfallSeries::uniform(100.0, 500);
        assert!((series.depth_over(0, 500.0) - 0.1).abs() < 1e-9);

        let series = RainfallSeries::uniform(37.5, 1800);
        assert!((series.depth_over(0, 1800.0) - 0.0375).abs() < 1e-9);
    }

    #[test]
    fn test_aligned_window() {
        let window = sample_window(at(0), 3600, at(2), at(5)).unwrap();
        assert_eq!(window, SampleWindow { first: 3, last: 5 });
        assert_eq!(window.rows(), 3);
    }

    #[test]
    fn test_unaligned_window_truncates() {
        let start = at(0) + chrono::Duration::minutes(30);
        let end = at(3) + chrono::Duration::minutes(30);
        let window = sample_window(at(0), 3600, start, end).unwrap();
        assert_eq!(window, SampleWindow { first: 1, last: 3 });
    }

    #[test]
    fn test_window_errors() {
        assert!(matches!(
            sample_window(at(1), 3600, at(0), at(2)),
            Err(RainfallError::BeforeDataset { .. })
        ));
        assert!(matches!(
            sample_window(at(0), 3600, at(2), at(2)),
            Err(RainfallError::EmptyWindow { .. })
        ));
        assert!(matches!(
            sample_window(at(0), 0, at(1), at(2)),
            Err(RainfallError::InvalidFrequency(0))
        ));
    }

    #[test]
    fn test_from_locations() {
        let window = SampleWindow { first: 1, last: 2 };
        let columns = vec![vec![3.6, 7.2], vec![0.0, 36.0]];
        let series =
            RainfallSeries::from_locations(&columns, window, 3600, DepthUnit::Millimetres).unwrap();

        assert_eq!(series.rows(), 2);
        assert_eq!(series.locations(), 2);
        assert_eq!(series.elapsed(), &[0.0, 3600.0]);
        let row = series.row(1).unwrap();
        assert!((row[0] - 2e-6).abs() < 1e-15);
        assert!((row[1] - 1e-5).abs() < 1e-15);
    }

    #[test]
    fn test_from_locations_rejects_short_column() {
        let window = SampleWindow { first: 1, last: 3 };
        let columns = vec![vec![1.0, 2.0, 3.0], vec![1.0]];
        assert_eq!(
            RainfallSeries::from_locations(&columns, window, 60, DepthUnit::Metres),
            Err(RainfallError::Truncated {
                location: 1,
                expected: 3,
                found: 1
            })
        );
        assert_eq!(
            RainfallSeries::from_locations(&[], window, 60, DepthUnit::Metres),
            Err(RainfallError::NoLocations)
        );
    }

    #[test]
    fn test_depth_unit_names() {
        let unit: DepthUnit = serde_json::from_str("\"mm\"").unwrap();
        assert_eq!(unit, DepthUnit::Millimetres);
        let unit: DepthUnit = serde_json::from_str("\"metres\"").unwrap();
        assert_eq!(unit, DepthUnit::Metres);
    }
}
