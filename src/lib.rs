//! Collects public proxy subscriptions, normalizes and deduplicates their
//! nodes, probes every node under a global time budget and writes the raw
//! and the reachable lists.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod sieve;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineConfig, PipelineState, RunReport, Summary};
