//! Infrastructure layer: queue, locks, apply engine, executor and watchdog,
//! each with an in-memory backend and a Postgres backend.

pub mod apply;
pub mod catalog;
pub mod config;
pub mod db;
pub mod jobs;
pub mod locks;
pub mod workers;
