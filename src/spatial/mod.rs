//! Spatial/temporal data store interface.
//!
//! The pipeline only needs a handful of queries: terrain clipped to a domain,
//! polygon layers intersecting it, and windows over stored rainfall series.
//! [`SpatialStore`] is the seam; [`PostgisStore`] is the production backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::grid::{AsciiGrid, GridError};
use crate::models::DomainRef;
use crate::rainfall::SampleWindow;
use crate::repository::StoreError;

mod memory;
#[cfg(feature = "postgres")]
mod postgis;

pub use memory::MemorySpatialStore;
#[cfg(feature = "postgres")]
pub use postgis::PostgisStore;

#[derive(Debug, Error)]
pub enum SpatialError {
    /// A referenced table or feature does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("spatial store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid terrain grid: {0}")]
    Grid(#[from] GridError),
}

impl From<StoreError> for SpatialError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => SpatialError::Unavailable(msg),
            StoreError::NotFound(msg) => SpatialError::NotFound(msg),
            StoreError::InvalidIdentifier(name) => {
                SpatialError::Query(format!("invalid identifier: {}", name))
            }
            other => SpatialError::Query(other.to_string()),
        }
    }
}

impl From<diesel::result::Error> for SpatialError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::from(e).into()
    }
}

/// Terrain raster clipped to a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Terrain {
    pub grid: AsciiGrid,
    pub srid: i32,
}

/// Exterior ring of a polygon, without the closing vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub id: i64,
    pub exterior: Vec<(f64, f64)>,
}

/// Temporal layout of a stored rainfall dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RainDataset {
    pub start: DateTime<Utc>,
    pub frequency_secs: i64,
}

/// Sample slice for one rainfall location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSeries {
    pub gid: i64,
    pub values: Vec<f64>,
}

#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Terrain from `dem_table` clipped to the domain polygon, optionally
    /// resampled to `resolution` map units per cell.
    async fn terrain(
        &self,
        domain: &DomainRef,
        dem_table: &str,
        resolution: Option<f64>,
    ) -> Result<Terrain, SpatialError>;

    /// Domain boundary polygon.
    async fn domain_boundary(&self, domain: &DomainRef) -> Result<Polygon, SpatialError>;

    /// Polygons in `table` intersecting the domain.
    async fn polygons(&self, table: &str, domain: &DomainRef)
        -> Result<Vec<Polygon>, SpatialError>;

    /// Start and sampling frequency of a rainfall dataset.
    async fn rain_dataset(&self, table: &str) -> Result<RainDataset, SpatialError>;

    /// Windowed samples for each location intersecting the domain,
    /// ordered by location id.
    async fn rain_series(
        &self,
        table: &str,
        domain: &DomainRef,
        window: SampleWindow,
    ) -> Result<Vec<LocationSeries>, SpatialError>;

    /// Zone polygons of the rainfall locations, same order as
    /// [`SpatialStore::rain_series`].
    async fn rain_zones(&self, table: &str, domain: &DomainRef)
        -> Result<Vec<Polygon>, SpatialError>;

    async fn table_exists(&self, table: &str) -> Result<bool, SpatialError>;
}
