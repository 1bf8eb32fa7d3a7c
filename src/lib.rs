//! citycatpg - queue-driven CityCAT flood simulation runner.
//!
//! Consumes job identifiers from a durable queue, resolves the stored job
//! configuration, assembles solver inputs from PostGIS, runs the external
//! solver and packages its output.

pub mod assemble;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod grid;
pub mod models;
pub mod pipeline;
pub mod rainfall;
pub mod repository;
pub mod shutdown;
pub mod solver;
pub mod spatial;
