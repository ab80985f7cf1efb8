//! Interval aggregation and multi-resolution rollups for transaction
//! performance data.

pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod export;
pub mod gauge;
pub mod interval;
pub mod migrate;
pub mod rollup;
pub mod store;
