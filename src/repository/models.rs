//! Database record types.

use diesel::sql_types::{Double, Integer, Nullable, Text};
use diesel::QueryableByName;

use super::parse_datetime_opt;
use crate::models::{DomainRef, JobConfig};

/// Raw row of the job configuration table.
///
/// Timestamps are stored as RFC 3339 text on both backends.
#[derive(Debug, QueryableByName)]
pub struct JobConfigRecord {
    #[diesel(sql_type = Text)]
    pub run_id: String,
    #[diesel(sql_type = Text)]
    pub run_name: String,
    #[diesel(sql_type = Integer)]
    pub run_duration: i32,
    #[diesel(sql_type = Integer)]
    pub output_frequency: i32,
    #[diesel(sql_type = Nullable<Integer>)]
    pub srid: Option<i32>,
    #[diesel(sql_type = Nullable<Double>)]
    pub resolution: Option<f64>,
    #[diesel(sql_type = Text)]
    pub domain_table: String,
    #[diesel(sql_type = Integer)]
    pub domain_id: i32,
    #[diesel(sql_type = Text)]
    pub dem_table: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub rain_table: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub rain_start: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub rain_end: Option<String>,
    #[diesel(sql_type = Nullable<Double>)]
    pub rain_total: Option<f64>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub rain_duration: Option<i32>,
    #[diesel(sql_type = Double)]
    pub friction: f64,
    #[diesel(sql_type = Nullable<Text>)]
    pub green_areas_table: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub buildings_table: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub upload_url: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub hostname: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub version_number: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub run_start: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub run_end: Option<String>,
}

fn non_negative(field: &str, value: i32) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("{} is negative: {}", field, value))
}

/// Convert a database record to a domain model.
impl TryFrom<JobConfigRecord> for JobConfig {
    type Error = String;

    fn try_from(record: JobConfigRecord) -> Result<Self, Self::Error> {
        Ok(JobConfig {
            run_duration: non_negative("run_duration", record.run_duration)?,
            output_frequency: non_negative("output_frequency", record.output_frequency)?,
            rain_duration: record
                .rain_duration
                .map(|d| non_negative("rain_duration", d))
                .transpose()?,
            run_id: record.run_id,
            run_name: record.run_name,
            srid: record.srid,
            resolution: record.resolution,
            domain: DomainRef {
                table: record.domain_table,
                id: record.domain_id,
            },
            dem_table: record.dem_table,
            rain_table: record.rain_table,
            rain_start: parse_datetime_opt(record.rain_start),
            rain_end: parse_datetime_opt(record.rain_end),
            rain_total: record.rain_total,
            friction: record.friction,
            green_areas_table: record.green_areas_table,
            buildings_table: record.buildings_table,
            upload_url: record.upload_url,
            hostname: record.hostname,
            version_number: record.version_number,
            run_start: parse_datetime_opt(record.run_start),
            run_end: parse_datetime_opt(record.run_end),
        })
    }
}
