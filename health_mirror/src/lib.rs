//! Per-owner mirror of device health data: batch ingestion, derived facts,
//! and precomputed hourly/daily rollups.

#![deny(missing_docs)]

pub mod batch;
pub mod bucket;
pub mod config;
pub mod db;
pub mod derived;
pub mod mirror;
pub mod models;
pub mod pipeline;
pub mod rollup;
pub mod schema;
pub mod tz;
