//! PostGIS-backed spatial store.
//!
//! Table names come from job configurations and are validated and quoted
//! before interpolation; every other value is bound.
//!
//! Expected layout:
//! - domain and polygon layers: `gid` integer key, `geom` geometry
//! - terrain: `rast` raster tiles
//! - rainfall: `gid`, `geom` (location zone), `value` float array with one
//!   sample per interval, plus `{table}_metadata (start timestamp,
//!   frequency interval)`

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::sql_types::{Array, BigInt, Binary, Bool, Double, Integer, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;
use tracing::{debug, warn};

use super::{LocationSeries, Polygon, RainDataset, SpatialError, SpatialStore, Terrain};
use crate::grid::AsciiGrid;
use crate::models::DomainRef;
use crate::rainfall::SampleWindow;
use crate::repository::pool::PgPool;
use crate::repository::quote_identifier;

#[derive(QueryableByName)]
struct TerrainRow {
    #[diesel(sql_type = Nullable<Binary>)]
    grid: Option<Vec<u8>>,
    #[diesel(sql_type = Nullable<Integer>)]
    srid: Option<i32>,
}

#[derive(QueryableByName)]
struct VertexRow {
    #[diesel(sql_type = BigInt)]
    gid: i64,
    #[diesel(sql_type = BigInt)]
    part: i64,
    #[diesel(sql_type = Double)]
    x: f64,
    #[diesel(sql_type = Double)]
    y: f64,
}

#[derive(QueryableByName)]
struct DatasetRow {
    #[diesel(sql_type = BigInt)]
    start_epoch: i64,
    #[diesel(sql_type = BigInt)]
    frequency_secs: i64,
}

#[derive(QueryableByName)]
struct SeriesRow {
    #[diesel(sql_type = BigInt)]
    gid: i64,
    #[diesel(sql_type = Nullable<Array<Nullable<Double>>>)]
    samples: Option<Vec<Option<f64>>>,
}

/// A missing sample is a data error, not dry weather.
fn decode_samples(gid: i64, samples: Option<Vec<Option<f64>>>) -> Result<Vec<f64>, SpatialError> {
    let samples =
        samples.ok_or_else(|| SpatialError::Query(format!("rainfall series for gid {} is NULL", gid)))?;
    samples
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| {
                SpatialError::Query(format!("rainfall sample {} for gid {} is NULL", i, gid))
            })
        })
        .collect()
}

#[derive(QueryableByName)]
struct ExistsRow {
    #[diesel(sql_type = Bool)]
    present: bool,
}

/// Group ordered vertex rows into polygons, dropping each ring's closing
/// vertex.
fn collect_polygons(rows: Vec<VertexRow>) -> Vec<Polygon> {
    let mut rings: BTreeMap<(i64, i64), Vec<(f64, f64)>> = BTreeMap::new();
    for row in rows {
        rings.entry((row.gid, row.part)).or_default().push((row.x, row.y));
    }

    rings
        .into_iter()
        .filter_map(|((gid, _), mut exterior)| {
            if exterior.len() > 1 && <[_]>::first(&exterior) == <[_]>::last(&exterior) {
                exterior.pop();
            }
            (exterior.len() >= 3).then_some(Polygon { id: gid, exterior })
        })
        .collect()
}

/// Spatial store over a PostgreSQL database with PostGIS.
#[derive(Clone)]
pub struct PostgisStore {
    pool: PgPool,
}

impl PostgisStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn vertices(
        &self,
        table: &str,
        domain: &DomainRef,
        only_domain_feature: bool,
    ) -> Result<Vec<Polygon>, SpatialError> {
        let layer = quote_identifier(table)?;
        let domain_table = quote_identifier(&domain.table)?;

        let filter = if only_domain_feature {
            "t.gid = d.gid"
        } else {
            "ST_Intersects(t.geom, d.geom)"
        };
        let sql = format!(
            "SELECT t.gid::int8 AS gid, \
                    COALESCE(part.path[1], 1)::int8 AS part, \
                    ST_X(pt.geom) AS x, ST_Y(pt.geom) AS y \
             FROM {layer} t \
             JOIN {domain_table} d ON d.gid = $1 AND {filter} \
             CROSS JOIN LATERAL ST_Dump(t.geom) AS part \
             CROSS JOIN LATERAL ST_DumpPoints(ST_ExteriorRing(part.geom)) AS pt \
             ORDER BY t.gid, part.path[1], pt.path[1]"
        );

        let mut conn = self.pool.get().await?;
        let rows: Vec<VertexRow> = diesel::sql_query(&sql)
            .bind::<Integer, _>(domain.id)
            .load(&mut conn)
            .await?;
        Ok(collect_polygons(rows))
    }
}

#[async_trait]
impl SpatialStore for PostgisStore {
    async fn terrain(
        &self,
        domain: &DomainRef,
        dem_table: &str,
        resolution: Option<f64>,
    ) -> Result<Terrain, SpatialError> {
        let dem = quote_identifier(dem_table)?;
        let domain_table = quote_identifier(&domain.table)?;

        let clipped = "ST_Union(ST_Clip(r.rast, d.geom))";
        let raster = match resolution {
            Some(_) => format!("ST_Rescale({clipped}, $2::float8, -($2::float8))"),
            None => clipped.to_string(),
        };
        let sql = format!(
            "SELECT ST_AsGDALRaster({raster}, 'AAIGrid') AS grid, \
                    MAX(ST_SRID(r.rast)) AS srid \
             FROM {dem} r, {domain_table} d \
             WHERE d.gid = $1 AND ST_Intersects(r.rast, d.geom)"
        );

        let mut conn = self.pool.get().await?;
        if let Err(e) = diesel::sql_query("SET postgis.gdal_enabled_drivers TO 'AAIGrid'")
            .execute(&mut conn)
            .await
        {
            warn!("Could not enable GDAL AAIGrid driver: {}", e);
        }

        let query = diesel::sql_query(&sql).bind::<Integer, _>(domain.id);
        let row: TerrainRow = match resolution {
            Some(res) => query.bind::<Double, _>(res).get_result(&mut conn).await?,
            None => query.get_result(&mut conn).await?,
        };

        let bytes = row.grid.ok_or_else(|| {
            SpatialError::NotFound(format!(
                "no terrain in {} intersects {} {}",
                dem_table, domain.table, domain.id
            ))
        })?;
        let grid = AsciiGrid::from_bytes(&bytes)?;
        let srid = row.srid.unwrap_or(0);
        debug!(
            ncols = grid.ncols,
            nrows = grid.nrows,
            srid,
            "Loaded terrain from {}",
            dem_table
        );
        Ok(Terrain { grid, srid })
    }

    async fn domain_boundary(&self, domain: &DomainRef) -> Result<Polygon, SpatialError> {
        self.vertices(&domain.table, domain, true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SpatialError::NotFound(format!("domain {} {}", domain.table, domain.id))
            })
    }

    async fn polygons(
        &self,
        table: &str,
        domain: &DomainRef,
    ) -> Result<Vec<Polygon>, SpatialError> {
        self.vertices(table, domain, false).await
    }

    async fn rain_dataset(&self, table: &str) -> Result<RainDataset, SpatialError> {
        let metadata = quote_identifier(&format!("{}_metadata", table))?;
        let sql = format!(
            "SELECT EXTRACT(EPOCH FROM start)::int8 AS start_epoch, \
                    EXTRACT(EPOCH FROM frequency)::int8 AS frequency_secs \
             FROM {metadata} LIMIT 1"
        );

        let mut conn = self.pool.get().await?;
        let row: DatasetRow = match diesel::sql_query(&sql).get_result(&mut conn).await {
            Ok(row) => row,
            Err(diesel::result::Error::NotFound) => {
                return Err(SpatialError::NotFound(format!("{}_metadata is empty", table)))
            }
            Err(e) => return Err(e.into()),
        };

        let start = DateTime::<Utc>::from_timestamp(row.start_epoch, 0).ok_or_else(|| {
            SpatialError::Query(format!("dataset start out of range: {}", row.start_epoch))
        })?;
        Ok(RainDataset {
            start,
            frequency_secs: row.frequency_secs,
        })
    }

    async fn rain_series(
        &self,
        table: &str,
        domain: &DomainRef,
        window: SampleWindow,
    ) -> Result<Vec<LocationSeries>, SpatialError> {
        let rain = quote_identifier(table)?;
        let domain_table = quote_identifier(&domain.table)?;
        let bound = |v: i64| {
            i32::try_from(v)
                .map_err(|_| SpatialError::Query(format!("sample index out of range: {}", v)))
        };
        let (first, last) = (bound(window.first)?, bound(window.last)?);

        let sql = format!(
            "SELECT r.gid::int8 AS gid, r.value[$2:$3]::float8[] AS samples \
             FROM {rain} r, {domain_table} d \
             WHERE d.gid = $1 AND ST_Intersects(r.geom, d.geom) \
             ORDER BY r.gid"
        );

        let mut conn = self.pool.get().await?;
        let rows: Vec<SeriesRow> = diesel::sql_query(&sql)
            .bind::<Integer, _>(domain.id)
            .bind::<Integer, _>(first)
            .bind::<Integer, _>(last)
            .load(&mut conn)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LocationSeries {
                    gid: row.gid,
                    values: decode_samples(row.gid, row.samples)?,
                })
            })
            .collect()
    }

    async fn rain_zones(
        &self,
        table: &str,
        domain: &DomainRef,
    ) -> Result<Vec<Polygon>, SpatialError> {
        self.vertices(table, domain, false).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, SpatialError> {
        crate::repository::util::validate_identifier(table)?;
        let mut conn = self.pool.get().await?;
        let row: ExistsRow = diesel::sql_query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind::<Text, _>(table)
            .get_result(&mut conn)
            .await?;
        Ok(row.present)
    }
}
