// Backup pipeline orchestration: descriptors, queue, triggers, routing, storage bindings

pub mod config;
pub mod descriptor;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod router;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod substrate;
pub mod telemetry;
