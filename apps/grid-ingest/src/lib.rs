pub mod anomaly;
pub mod cli;
pub mod config;
pub mod coverage;
pub mod error;
pub mod history;
pub mod ingest;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod upstream;
