//! Diesel-based job configuration repository.
//!
//! One table per deployment (name configurable). Rows are only ever
//! inserted; the sole in-place writes are the run start/end stamps, each
//! guarded so it lands exactly once.

use chrono::{DateTime, Utc};
use diesel::sql_types::{Double, Integer, Nullable, Text};
use diesel_async::RunQueryDsl;
use sea_query::{Alias, ColumnDef, Expr, Query, Table};
use tracing::debug;

use super::models::JobConfigRecord;
use super::pool::{build_ddl, build_sql, DbPool, StoreError};
use super::sea_tables::JobColumn;
use super::util::validate_identifier;
use crate::models::JobConfig;
use crate::with_conn;

/// Default configuration table name.
pub const DEFAULT_RUN_TABLE: &str = "runs";

fn to_i32(field: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("{} out of range: {}", field, value)))
}

/// Repository for stored job configurations.
#[derive(Clone)]
pub struct JobConfigRepository {
    pool: DbPool,
    table: String,
}

impl JobConfigRepository {
    /// Create a repository over `table`.
    pub fn new(pool: DbPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the configuration table if it does not exist.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        let sql = {
            let stmt = Table::create()
                .table(Alias::new(&self.table))
                .if_not_exists()
                .col(ColumnDef::new(JobColumn::RunId).text().not_null().primary_key())
                .col(ColumnDef::new(JobColumn::RunName).text().not_null())
                .col(ColumnDef::new(JobColumn::RunDuration).integer().not_null())
                .col(ColumnDef::new(JobColumn::OutputFrequency).integer().not_null())
                .col(ColumnDef::new(JobColumn::Srid).integer())
                .col(ColumnDef::new(JobColumn::Resolution).double())
                .col(ColumnDef::new(JobColumn::DomainTable).text().not_null())
                .col(ColumnDef::new(JobColumn::DomainId).integer().not_null())
                .col(ColumnDef::new(JobColumn::DemTable).text().not_null())
                .col(ColumnDef::new(JobColumn::RainTable).text())
                .col(ColumnDef::new(JobColumn::RainStart).text())
                .col(ColumnDef::new(JobColumn::RainEnd).text())
                .col(ColumnDef::new(JobColumn::RainTotal).double())
                .col(ColumnDef::new(JobColumn::RainDuration).integer())
                .col(ColumnDef::new(JobColumn::Friction).double().not_null())
                .col(ColumnDef::new(JobColumn::GreenAreasTable).text())
                .col(ColumnDef::new(JobColumn::BuildingsTable).text())
                .col(ColumnDef::new(JobColumn::UploadUrl).text())
                .col(ColumnDef::new(JobColumn::Hostname).text())
                .col(ColumnDef::new(JobColumn::VersionNumber).text())
                .col(ColumnDef::new(JobColumn::RunStart).text())
                .col(ColumnDef::new(JobColumn::RunEnd).text())
                .to_owned();
            build_ddl(&self.pool, &stmt)
        };
        with_conn!(self.pool, conn, {
            diesel::sql_query(&sql).execute(&mut conn).await?;
            Ok(())
        })
    }

    /// Store a new configuration, creating the table if needed.
    ///
    /// There is no update path: adding an id twice fails.
    pub async fn add(&self, config: &JobConfig) -> Result<(), StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        self.ensure_table().await?;

        let run_duration = to_i32("run_duration", config.run_duration)?;
        let output_frequency = to_i32("output_frequency", config.output_frequency)?;
        let rain_duration = config
            .rain_duration
            .map(|d| to_i32("rain_duration", d))
            .transpose()?;
        let rain_start = config.rain_start.map(|dt| dt.to_rfc3339());
        let rain_end = config.rain_end.map(|dt| dt.to_rfc3339());
        let run_start = config.run_start.map(|dt| dt.to_rfc3339());
        let run_end = config.run_end.map(|dt| dt.to_rfc3339());

        let sql = {
            let stmt = Query::insert()
                .into_table(Alias::new(&self.table))
                .columns(JobColumn::ALL)
                .values_panic([
                    config.run_id.clone().into(),
                    config.run_name.clone().into(),
                    run_duration.into(),
                    output_frequency.into(),
                    config.srid.into(),
                    config.resolution.into(),
                    config.domain.table.clone().into(),
                    config.domain.id.into(),
                    config.dem_table.clone().into(),
                    config.rain_table.clone().into(),
                    rain_start.clone().into(),
                    rain_end.clone().into(),
                    config.rain_total.into(),
                    rain_duration.into(),
                    config.friction.into(),
                    config.green_areas_table.clone().into(),
                    config.buildings_table.clone().into(),
                    config.upload_url.clone().into(),
                    config.hostname.clone().into(),
                    config.version_number.clone().into(),
                    run_start.clone().into(),
                    run_end.clone().into(),
                ])
                .to_owned();
            build_sql(&self.pool, &stmt)
        };

        with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(&config.run_id)
                .bind::<Text, _>(&config.run_name)
                .bind::<Integer, _>(run_duration)
                .bind::<Integer, _>(output_frequency)
                .bind::<Nullable<Integer>, _>(config.srid)
                .bind::<Nullable<Double>, _>(config.resolution)
                .bind::<Text, _>(&config.domain.table)
                .bind::<Integer, _>(config.domain.id)
                .bind::<Text, _>(&config.dem_table)
                .bind::<Nullable<Text>, _>(config.rain_table.as_deref())
                .bind::<Nullable<Text>, _>(rain_start.as_deref())
                .bind::<Nullable<Text>, _>(rain_end.as_deref())
                .bind::<Nullable<Double>, _>(config.rain_total)
                .bind::<Nullable<Integer>, _>(rain_duration)
                .bind::<Double, _>(config.friction)
                .bind::<Nullable<Text>, _>(config.green_areas_table.as_deref())
                .bind::<Nullable<Text>, _>(config.buildings_table.as_deref())
                .bind::<Nullable<Text>, _>(config.upload_url.as_deref())
                .bind::<Nullable<Text>, _>(config.hostname.as_deref())
                .bind::<Nullable<Text>, _>(config.version_number.as_deref())
                .bind::<Nullable<Text>, _>(run_start.as_deref())
                .bind::<Nullable<Text>, _>(run_end.as_deref())
                .execute(&mut conn)
                .await?
        });

        debug!(job_id = %config.run_id, table = %self.table, "Stored job configuration");
        Ok(())
    }

    /// Load a configuration by id.
    pub async fn fetch(&self, job_id: &str) -> Result<JobConfig, StoreError> {
        let sql = {
            let stmt = Query::select()
                .columns(JobColumn::ALL)
                .from(Alias::new(&self.table))
                .and_where(Expr::col(JobColumn::RunId).eq(job_id))
                .to_owned();
            build_sql(&self.pool, &stmt)
        };

        let record: Option<JobConfigRecord> = with_conn!(self.pool, conn, {
            match diesel::sql_query(&sql)
                .bind::<Text, _>(job_id)
                .get_result::<JobConfigRecord>(&mut conn)
                .await
            {
                Ok(record) => Some(record),
                Err(diesel::result::Error::NotFound) => None,
                Err(e) if is_missing_table(&e) => None,
                Err(e) => return Err(e.into()),
            }
        });

        let record = record.ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        JobConfig::try_from(record).map_err(StoreError::InvalidRecord)
    }

    /// Stamp the solver invocation time. Returns false if already stamped.
    pub async fn mark_started(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.stamp_once(JobColumn::RunStart, job_id, at).await
    }

    /// Stamp the completion time. Returns false if already stamped.
    pub async fn mark_finished(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.stamp_once(JobColumn::RunEnd, job_id, at).await
    }

    async fn stamp_once(
        &self,
        column: JobColumn,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let stamp = at.to_rfc3339();
        let sql = {
            let stmt = Query::update()
                .table(Alias::new(&self.table))
                .value(column, stamp.clone())
                .and_where(Expr::col(JobColumn::RunId).eq(job_id))
                .and_where(Expr::col(column).is_null())
                .to_owned();
            build_sql(&self.pool, &stmt)
        };

        let rows = with_conn!(self.pool, conn, {
            diesel::sql_query(&sql)
                .bind::<Text, _>(&stamp)
                .bind::<Text, _>(job_id)
                .execute(&mut conn)
                .await?
        });
        Ok(rows > 0)
    }
}

fn is_missing_table(e: &diesel::result::Error) -> bool {
    let message = e.to_string();
    message.contains("no such table") || message.contains("does not exist")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn setup_repo(dir: &tempfile::TempDir) -> JobConfigRepository {
        let pool = DbPool::sqlite_from_path(&dir.path().join("jobs.db"));
        JobConfigRepository::new(pool, DEFAULT_RUN_TABLE).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_fetch_uniform() {
        let dir = tempdir().unwrap();
        let repo = setup_repo(&dir);

        let mut config = JobConfig::new(120)
            .with_name("test")
            .with_uniform_rain(100.0, 120);
        config.output_frequency = 60;
        config.domain.id = 500;
        config.buildings_table = Some("buildings".to_string());
        repo.add(&config).await.unwrap();

        let fetched = repo.fetch(&config.run_id).await.unwrap();
        assert_eq!(fetched, config);
    }

    #[tokio::test]
    async fn test_add_and_fetch_series() {
        let dir = tempdir().unwrap();
        let repo = setup_repo(&dir);

        let config = JobConfig::new(500).with_rain_series(
            "rain",
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2000, 1, 2, 0, 0, 0).unwrap(),
        );
        repo.add(&config).await.unwrap();

        let fetched = repo.fetch(&config.run_id).await.unwrap();
        assert_eq!(fetched.rain_start, config.rain_start);
        assert_eq!(fetched.rain_end, config.rain_end);
        assert_eq!(fetched.rain_table.as_deref(), Some("rain"));
    }

    #[tokio::test]
    async fn test_store_calls_run_on_spawned_tasks() {
        let dir = tempdir().unwrap();
        let repo = setup_repo(&dir);
        let config = JobConfig::new(60).with_uniform_rain(10.0, 60);
        let id = config.run_id.clone();

        let worker = repo.clone();
        tokio::spawn(async move {
            worker.add(&config).await?;
            worker.mark_started(&config.run_id, Utc::now()).await?;
            worker.fetch(&config.run_id).await
        })
        .await
        .unwrap()
        .unwrap();

        assert!(repo.fetch(&id).await.unwrap().run_start.is_some());
    }

    #[tokio::test]
    async fn test_fetch_unknown_is_not_found() {
        let dir = tempdir().unwrap();
        let repo = setup_repo(&dir);

        // Table does not exist yet
        assert!(matches!(
            repo.fetch("missing").await,
            Err(StoreError::NotFound(_))
        ));

        repo.ensure_table().await.unwrap();
        assert!(matches!(
            repo.fetch("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_and_invalid() {
        let dir = tempdir().unwrap();
        let repo = setup_repo(&dir);

        let config = JobConfig::new(60).with_uniform_rain(10.0, 60);
        repo.add(&config).await.unwrap();
        assert!(repo.add(&config).await.is_err());

        let invalid = JobConfig::new(60);
        assert!(matches!(
            repo.add(&invalid).await,
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_timestamps_written_once() {
        let dir = tempdir().unwrap();
        let repo = setup_repo(&dir);

        let config = JobConfig::new(60).with_uniform_rain(10.0, 60);
        repo.add(&config).await.unwrap();

        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();

        assert!(repo.mark_started(&config.run_id, first).await.unwrap());
        assert!(!repo.mark_started(&config.run_id, second).await.unwrap());
        assert!(repo.mark_finished(&config.run_id, second).await.unwrap());

        let fetched = repo.fetch(&config.run_id).await.unwrap();
        assert_eq!(fetched.run_start, Some(first));
        assert_eq!(fetched.run_end, Some(second));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let pool = DbPool::sqlite_from_path(std::path::Path::new("unused.db"));
        assert!(matches!(
            JobConfigRepository::new(pool, "runs; drop"),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }
}
