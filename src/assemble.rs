//! Simulation input assembly.
//!
//! Turns a job configuration into a [`SimulationInput`] by querying the
//! spatial store. Every referenced layer is checked before any bulk query
//! runs, so a typo in a table name fails as a configuration error.

use std::sync::Arc;

use tracing::{debug, info};

use crate::models::{JobConfig, RainfallSpec};
use crate::pipeline::PipelineError;
use crate::rainfall::{sample_window, DepthUnit, RainfallSeries};
use crate::spatial::{Polygon, SpatialStore, Terrain};

/// Everything the solver needs for one job.
#[derive(Debug, Clone)]
pub struct SimulationInput {
    pub terrain: Terrain,
    pub rainfall: RainfallSeries,
    /// One zone per rainfall location when the series has several.
    pub rain_zones: Vec<Polygon>,
    pub duration_secs: u32,
    pub output_frequency: u32,
    pub friction: f64,
    pub boundary: Option<Polygon>,
    pub buildings: Option<Vec<Polygon>>,
    pub green_areas: Option<Vec<Polygon>>,
}

impl SimulationInput {
    /// Spatial reference of the terrain.
    pub fn srid(&self) -> i32 {
        self.terrain.srid
    }
}

/// Builds simulation inputs from the spatial store.
#[derive(Clone)]
pub struct InputAssembler {
    store: Arc<dyn SpatialStore>,
    rainfall_unit: DepthUnit,
}

impl InputAssembler {
    pub fn new(store: Arc<dyn SpatialStore>, rainfall_unit: DepthUnit) -> Self {
        Self {
            store,
            rainfall_unit,
        }
    }

    async fn require_table(&self, table: &str, role: &str) -> Result<(), PipelineError> {
        if self.store.table_exists(table).await? {
            Ok(())
        } else {
            Err(PipelineError::Configuration(format!(
                "{} table {} does not exist",
                role, table
            )))
        }
    }

    async fn optional_layer(
        &self,
        table: Option<&str>,
        role: &str,
        config: &JobConfig,
    ) -> Result<Option<Vec<Polygon>>, PipelineError> {
        match table {
            Some(table) => {
                self.require_table(table, role).await?;
                let polygons = self.store.polygons(table, &config.domain).await?;
                debug!(job_id = %config.run_id, count = polygons.len(), "Loaded {} polygons", role);
                Ok(Some(polygons))
            }
            None => Ok(None),
        }
    }

    async fn rainfall(
        &self,
        config: &JobConfig,
        spec: RainfallSpec,
    ) -> Result<(RainfallSeries, Vec<Polygon>), PipelineError> {
        match spec {
            RainfallSpec::Uniform {
                total_mm,
                duration_secs,
            } => Ok((RainfallSeries::uniform(total_mm, duration_secs), Vec::new())),
            RainfallSpec::Series { table, start, end } => {
                self.require_table(&table, "rainfall").await?;
                let dataset = self.store.rain_dataset(&table).await?;
                let window = sample_window(dataset.start, dataset.frequency_secs, start, end)?;

                let locations = self
                    .store
                    .rain_series(&table, &config.domain, window)
                    .await?;
                let columns: Vec<Vec<f64>> =
                    locations.iter().map(|l| l.values.clone()).collect();
                let series = RainfallSeries::from_locations(
                    &columns,
                    window,
                    dataset.frequency_secs,
                    self.rainfall_unit,
                )?;

                let zones = if locations.len() > 1 {
                    let zones = self.store.rain_zones(&table, &config.domain).await?;
                    if zones.len() != locations.len() {
                        return Err(PipelineError::Configuration(format!(
                            "rainfall table {} has {} series but {} zones",
                            table,
                            locations.len(),
                            zones.len()
                        )));
                    }
                    zones
                } else {
                    Vec::new()
                };

                Ok((series, zones))
            }
        }
    }

    /// Build the input bundle for `config`.
    pub async fn assemble(&self, config: &JobConfig) -> Result<SimulationInput, PipelineError> {
        let spec = config.rainfall()?;

        self.require_table(&config.domain.table, "domain").await?;
        self.require_table(&config.dem_table, "terrain").await?;

        let mut terrain = self
            .store
            .terrain(&config.domain, &config.dem_table, config.resolution)
            .await?;
        if terrain.srid <= 0 {
            terrain.srid = config.srid.unwrap_or(0);
        }
        let boundary = self.store.domain_boundary(&config.domain).await?;

        let buildings = self
            .optional_layer(config.buildings_table.as_deref(), "buildings", config)
            .await?;
        let green_areas = self
            .optional_layer(config.green_areas_table.as_deref(), "green areas", config)
            .await?;

        let (rainfall, rain_zones) = self.rainfall(config, spec).await?;

        info!(
            job_id = %config.run_id,
            stage = "assemble",
            ncols = terrain.grid.ncols,
            nrows = terrain.grid.nrows,
            rain_rows = rainfall.rows(),
            rain_locations = rainfall.locations(),
            "Assembled simulation inputs"
        );

        Ok(SimulationInput {
            terrain,
            rainfall,
            rain_zones,
            duration_secs: config.run_duration,
            output_frequency: config.output_frequency,
            friction: config.friction,
            boundary: Some(boundary),
            buildings,
            green_areas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::AsciiGrid;
    use crate::spatial::{LocationSeries, MemorySpatialStore, RainDataset};
    use chrono::{TimeZone, Utc};

    fn square(id: i64, x: f64, y: f64, size: f64) -> Polygon {
        Polygon {
            id,
            exterior: vec![(x, y), (x + size, y), (x + size, y + size), (x, y + size)],
        }
    }

    fn store() -> MemorySpatialStore {
        let terrain = Terrain {
            grid: AsciiGrid::filled(4, 3, 0.0, 0.0, 5.0, 1.0),
            srid: 27700,
        };
        MemorySpatialStore::new(terrain, square(1, 0.0, 0.0, 15.0))
    }

    fn rain_store() -> MemorySpatialStore {
        let dataset = RainDataset {
            start: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            frequency_secs: 3600,
        };
        let series = vec![
            LocationSeries {
                gid: 1,
                values: vec![1.0, 2.0, 3.0, 4.0],
            },
            LocationSeries {
                gid: 2,
                values: vec![5.0, 6.0, 7.0, 8.0],
            },
        ];
        let zones = vec![square(1, 0.0, 0.0, 10.0), square(2, 10.0, 0.0, 10.0)];
        store().with_rain("rain", dataset, series, zones)
    }

    #[tokio::test]
    async fn test_uniform_assembly() {
        let assembler = InputAssembler::new(Arc::new(store()), DepthUnit::Millimetres);
        let config = JobConfig::new(3600).with_uniform_rain(100.0, 500);

        let input = assembler.assemble(&config).await.unwrap();
        assert_eq!(input.srid(), 27700);
        assert_eq!(input.rainfall.rows(), 4);
        assert!(input.rain_zones.is_empty());
        assert!(input.buildings.is_none());
        assert_eq!(input.duration_secs, 3600);
    }

    #[tokio::test]
    async fn test_series_assembly() {
        let assembler = InputAssembler::new(Arc::new(rain_store()), DepthUnit::Millimetres);
        let config = JobConfig::new(3600).with_rain_series(
            "rain",
            Utc.with_ymd_and_hms(2000, 1, 1, 1, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2000, 1, 1, 3, 0, 0).unwrap(),
        );

        let input = assembler.assemble(&config).await.unwrap();
        assert_eq!(input.rainfall.rows(), 2);
        assert_eq!(input.rainfall.locations(), 2);
        assert_eq!(input.rainfall.elapsed(), &[0.0, 3600.0]);
        let first = input.rainfall.row(0).unwrap();
        assert!((first[0] - 2.0 * 0.001 / 3600.0).abs() < 1e-15);
        assert!((first[1] - 6.0 * 0.001 / 3600.0).abs() < 1e-15);
        assert_eq!(input.rain_zones.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_layer_is_configuration_error() {
        let assembler = InputAssembler::new(Arc::new(store()), DepthUnit::Millimetres);
        let mut config = JobConfig::new(3600).with_uniform_rain(10.0, 60);
        config.buildings_table = Some("buildings".to_string());

        assert!(matches!(
            assembler.assemble(&config).await,
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_rainfall_errors_are_configuration_errors() {
        let assembler = InputAssembler::new(Arc::new(rain_store()), DepthUnit::Millimetres);

        let neither = JobConfig::new(3600);
        assert!(matches!(
            assembler.assemble(&neither).await,
            Err(PipelineError::Configuration(_))
        ));

        let t = Utc.with_ymd_and_hms(2000, 1, 1, 1, 0, 0).unwrap();
        let mut empty = JobConfig::new(3600).with_rain_series("rain", t, t);
        empty.rain_end = Some(t + chrono::Duration::minutes(30));
        assert!(matches!(
            assembler.assemble(&empty).await,
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_outage_is_retryable() {
        let store = store();
        store.fail_next(1);
        let assembler = InputAssembler::new(Arc::new(store), DepthUnit::Millimetres);
        let config = JobConfig::new(3600).with_uniform_rain(10.0, 60);

        let err = assembler.assemble(&config).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(assembler.assemble(&config).await.is_ok());
    }
}
