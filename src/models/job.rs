//! Job configuration model.
//!
//! A job configuration is the unit of work: one stored row per simulation
//! request. Everything except `run_start`/`run_end` is fixed once persisted.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default output interval in seconds.
pub const DEFAULT_OUTPUT_FREQUENCY: u32 = 600;

/// Default Manning's friction coefficient.
pub const DEFAULT_FRICTION: f64 = 0.03;

/// Errors raised when a configuration cannot describe a runnable job.
#[derive(Debug, Error, PartialEq)]
pub enum JobConfigError {
    #[error("no rainfall specified: set rain_total + rain_duration or rain_table + rain_start + rain_end")]
    MissingRainfall,
    #[error("both uniform and time-series rainfall specified")]
    ContradictoryRainfall,
    #[error("incomplete rainfall specification: missing {0}")]
    IncompleteRainfall(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether `name` is exactly one ordinary path component, so joining it
/// onto a directory can never address that directory or its parent.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Reference to a domain boundary polygon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    pub table: String,
    pub id: i32,
}

impl Default for DomainRef {
    fn default() -> Self {
        Self {
            table: "domain".to_string(),
            id: 1,
        }
    }
}

/// Resolved rainfall mode of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum RainfallSpec {
    /// Uniform synthetic event: total depth in millimetres over a duration.
    Uniform { total_mm: f64, duration_secs: u32 },
    /// Window over a stored time-varying rainfall dataset.
    Series {
        table: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// A stored simulation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "generate_job_id")]
    pub run_id: String,
    #[serde(default)]
    pub run_name: String,
    /// Simulated period in seconds.
    pub run_duration: u32,
    /// Interval between surface map outputs in seconds.
    #[serde(default = "default_output_frequency")]
    pub output_frequency: u32,
    #[serde(default)]
    pub srid: Option<i32>,
    /// Terrain resampling resolution (map units per cell).
    #[serde(default)]
    pub resolution: Option<f64>,
    #[serde(default)]
    pub domain: DomainRef,
    #[serde(default = "default_dem_table")]
    pub dem_table: String,

    #[serde(default)]
    pub rain_table: Option<String>,
    #[serde(default)]
    pub rain_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rain_end: Option<DateTime<Utc>>,
    /// Total rainfall depth in millimetres.
    #[serde(default)]
    pub rain_total: Option<f64>,
    /// Rainfall duration in seconds.
    #[serde(default)]
    pub rain_duration: Option<u32>,

    #[serde(default = "default_friction")]
    pub friction: f64,
    #[serde(default)]
    pub green_areas_table: Option<String>,
    #[serde(default)]
    pub buildings_table: Option<String>,

    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub version_number: Option<String>,

    #[serde(default)]
    pub run_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_end: Option<DateTime<Utc>>,
}

/// Generate a fresh job identifier.
pub fn generate_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_output_frequency() -> u32 {
    DEFAULT_OUTPUT_FREQUENCY
}

fn default_dem_table() -> String {
    "dem".to_string()
}

fn default_friction() -> f64 {
    DEFAULT_FRICTION
}

impl JobConfig {
    /// Create a configuration with defaults and no rainfall.
    pub fn new(run_duration: u32) -> Self {
        Self {
            run_id: generate_job_id(),
            run_name: String::new(),
            run_duration,
            output_frequency: DEFAULT_OUTPUT_FREQUENCY,
            srid: None,
            resolution: None,
            domain: DomainRef::default(),
            dem_table: default_dem_table(),
            rain_table: None,
            rain_start: None,
            rain_end: None,
            rain_total: None,
            rain_duration: None,
            friction: DEFAULT_FRICTION,
            green_areas_table: None,
            buildings_table: None,
            upload_url: None,
            hostname: None,
            version_number: None,
            run_start: None,
            run_end: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = name.into();
        self
    }

    pub fn with_uniform_rain(mut self, total_mm: f64, duration_secs: u32) -> Self {
        self.rain_total = Some(total_mm);
        self.rain_duration = Some(duration_secs);
        self
    }

    pub fn with_rain_series(
        mut self,
        table: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        self.rain_table = Some(table.into());
        self.rain_start = Some(start);
        self.rain_end = Some(end);
        self
    }

    /// Resolve the rainfall mode.
    ///
    /// Exactly one of the two modes must be fully specified; fields of the
    /// other mode must be absent.
    pub fn rainfall(&self) -> Result<RainfallSpec, JobConfigError> {
        let uniform_any = self.rain_total.is_some() || self.rain_duration.is_some();
        let series_any =
            self.rain_table.is_some() || self.rain_start.is_some() || self.rain_end.is_some();

        match (uniform_any, series_any) {
            (true, true) => Err(JobConfigError::ContradictoryRainfall),
            (false, false) => Err(JobConfigError::MissingRainfall),
            (true, false) => {
                let total_mm = self
                    .rain_total
                    .ok_or(JobConfigError::IncompleteRainfall("rain_total"))?;
                let duration_secs = self
                    .rain_duration
                    .ok_or(JobConfigError::IncompleteRainfall("rain_duration"))?;
                if duration_secs == 0 {
                    return Err(JobConfigError::Invalid(
                        "rain_duration must be positive".to_string(),
                    ));
                }
                if !total_mm.is_finite() || total_mm < 0.0 {
                    return Err(JobConfigError::Invalid(format!(
                        "rain_total must be a non-negative depth, got {}",
                        total_mm
                    )));
                }
                Ok(RainfallSpec::Uniform {
                    total_mm,
                    duration_secs,
                })
            }
            (false, true) => {
                let table = self
                    .rain_table
                    .clone()
                    .ok_or(JobConfigError::IncompleteRainfall("rain_table"))?;
                let start = self
                    .rain_start
                    .ok_or(JobConfigError::IncompleteRainfall("rain_start"))?;
                let end = self
                    .rain_end
                    .ok_or(JobConfigError::IncompleteRainfall("rain_end"))?;
                if end <= start {
                    return Err(JobConfigError::Invalid(format!(
                        "rain_end ({}) must be after rain_start ({})",
                        end, start
                    )));
                }
                Ok(RainfallSpec::Series { table, start, end })
            }
        }
    }

    /// Check everything needed before a job is accepted for storage.
    pub fn validate(&self) -> Result<(), JobConfigError> {
        if self.run_id.trim().is_empty() {
            return Err(JobConfigError::Invalid("run_id is empty".to_string()));
        }
        let slug = self.slug();
        if !is_plain_file_name(&slug) {
            return Err(JobConfigError::Invalid(format!(
                "run name and id give an unusable directory name {:?}",
                slug
            )));
        }
        if self.run_duration == 0 {
            return Err(JobConfigError::Invalid(
                "run_duration must be positive".to_string(),
            ));
        }
        if self.output_frequency == 0 {
            return Err(JobConfigError::Invalid(
                "output_frequency must be positive".to_string(),
            ));
        }
        self.rainfall().map(|_| ())
    }

    /// File-system safe `{name}-{id}` stem shared by the working directory
    /// and the output artifacts. Falls back to the bare id for unnamed jobs.
    pub fn slug(&self) -> String {
        let raw = if self.run_name.is_empty() {
            self.run_id.clone()
        } else {
            format!("{}-{}", self.run_name, self.run_id)
        };
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Flat metadata used to tag output artifacts.
    ///
    /// Scalar fields keep their JSON value; nested fields are stringified.
    pub fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        use serde_json::Value;

        let fields = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => return BTreeMap::new(),
        };

        fields
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                    scalar => scalar,
                };
                (key, value)
            })
            .collect()
    }
}
