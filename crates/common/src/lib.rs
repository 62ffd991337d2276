//! Shared types, configuration, and infrastructure clients for the Beacon
//! notification pipeline.

pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod redis_pool;
pub mod types;
