use std::path::PathBuf;

/// Run-level failures. Per-node outcomes (skipped lines, unreachable nodes,
/// probe errors) are counted in the summary and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no sources configured")]
    NoSources,

    #[error("all {attempted} sources failed to fetch")]
    AllSourcesFailed { attempted: usize },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
