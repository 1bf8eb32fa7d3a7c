//! In-memory spatial store.
//!
//! Holds one terrain grid plus named polygon and rainfall layers. Used to
//! drive the pipeline without PostGIS.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::{LocationSeries, Polygon, RainDataset, SpatialError, SpatialStore, Terrain};
use crate::models::DomainRef;
use crate::rainfall::SampleWindow;

struct RainLayer {
    dataset: RainDataset,
    series: Vec<LocationSeries>,
    zones: Vec<Polygon>,
}

pub struct MemorySpatialStore {
    terrain: Terrain,
    boundary: Polygon,
    tables: HashSet<String>,
    layers: HashMap<String, Vec<Polygon>>,
    rain: HashMap<String, RainLayer>,
    outages: AtomicU32,
}

impl MemorySpatialStore {
    /// Store with `domain` and `dem` tables holding the given data.
    pub fn new(terrain: Terrain, boundary: Polygon) -> Self {
        let tables = ["domain", "dem"].iter().map(|t| t.to_string()).collect();
        Self {
            terrain,
            boundary,
            tables,
            layers: HashMap::new(),
            rain: HashMap::new(),
            outages: AtomicU32::new(0),
        }
    }

    pub fn with_layer(mut self, table: &str, polygons: Vec<Polygon>) -> Self {
        self.tables.insert(table.to_string());
        self.layers.insert(table.to_string(), polygons);
        self
    }

    pub fn with_rain(
        mut self,
        table: &str,
        dataset: RainDataset,
        series: Vec<LocationSeries>,
        zones: Vec<Polygon>,
    ) -> Self {
        self.tables.insert(table.to_string());
        self.rain.insert(
            table.to_string(),
            RainLayer {
                dataset,
                series,
                zones,
            },
        );
        self
    }

    /// Make the next `count` queries fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    fn check_outage(&self) -> Result<(), SpatialError> {
        let tripped = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(SpatialError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn rain_layer(&self, table: &str) -> Result<&RainLayer, SpatialError> {
        self.rain
            .get(table)
            .ok_or_else(|| SpatialError::NotFound(format!("rainfall table {}", table)))
    }
}

#[async_trait]
impl SpatialStore for MemorySpatialStore {
    async fn terrain(
        &self,
        _domain: &DomainRef,
        _dem_table: &str,
        _resolution: Option<f64>,
    ) -> Result<Terrain, SpatialError> {
        self.check_outage()?;
        Ok(self.terrain.clone())
    }

    async fn domain_boundary(&self, _domain: &DomainRef) -> Result<Polygon, SpatialError> {
        self.check_outage()?;
        Ok(self.boundary.clone())
    }

    async fn polygons(
        &self,
        table: &str,
        _domain: &DomainRef,
    ) -> Result<Vec<Polygon>, SpatialError> {
        self.check_outage()?;
        self.layers
            .get(table)
            .cloned()
            .ok_or_else(|| SpatialError::NotFound(format!("layer {}", table)))
    }

    async fn rain_dataset(&self, table: &str) -> Result<RainDataset, SpatialError> {
        self.check_outage()?;
        Ok(self.rain_layer(table)?.dataset)
    }

    async fn rain_series(
        &self,
        table: &str,
        _domain: &DomainRef,
        window: SampleWindow,
    ) -> Result<Vec<LocationSeries>, SpatialError> {
        self.check_outage()?;
        // 1-based inclusive bounds, clipped like an SQL array slice
        let from = (window.first.max(1) - 1) as usize;
        let to = window.last.max(0) as usize;
        Ok(self
            .rain_layer(table)?
            .series
            .iter()
            .map(|s| LocationSeries {
                gid: s.gid,
                values: s
                    .values
                    .iter()
                    .copied()
                    .skip(from)
                    .take(to.saturating_sub(from))
                    .collect(),
            })
            .collect())
    }

    async fn rain_zones(
        &self,
        table: &str,
        _domain: &DomainRef,
    ) -> Result<Vec<Polygon>, SpatialError> {
        self.check_outage()?;
        Ok(self.rain_layer(table)?.zones.clone())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, SpatialError> {
        self.check_outage()?;
        Ok(self.tables.contains(table))
    }
}
