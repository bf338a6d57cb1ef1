//! Node collection and validation stages.
//!
//! Each stage is usable on its own; [`crate::pipeline::Pipeline`] wires them
//! together for a single run.

pub mod dedup;
pub mod fetch;
pub mod node;
pub mod parser;
pub mod probe;
pub mod validator;
pub mod writer;

pub use dedup::{dedup, Deduplicated};
pub use fetch::{fetch_all, resolve_sources, HttpFetcher, SourceFetcher};
pub use node::{Handshake, Node, NodeStatus, Protocol, Transport};
pub use parser::{parse_blob, parse_descriptor, Descriptors};
pub use probe::{HandshakeProber, ProbeOutcome, Prober};
pub use validator::{Validated, ValidationStats, ValidatorConfig, ValidatorPool};
pub use writer::{OutputConfig, ResultWriter};
