//! Data models for citycatpg.

mod job;

pub use job::{
    generate_job_id, is_plain_file_name, DomainRef, JobConfig, JobConfigError, RainfallSpec, DEFAULT_FRICTION,
    DEFAULT_OUTPUT_FREQUENCY,
};
