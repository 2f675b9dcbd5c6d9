// Common library for the durable job scheduler: data model, schedule
// evaluation, job store, executor and the dispatch engine.

pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod models;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;
