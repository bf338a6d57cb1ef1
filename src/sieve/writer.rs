//! Raw and filtered list output.
//!
//! Both lists are written atomically: the content goes to `<file>.tmp` next
//! to the target, is synced, then renamed over the target. A reader never
//! sees a half-written list.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use tokio::io::AsyncWriteExt;

use super::node::{Node, NodeStatus};
use crate::error::PipelineError;

pub const DEFAULT_OUTPUT_DIR: &str = "v2ray";
pub const DEFAULT_RAW_FILE: &str = "v2ray_raw.txt";
pub const DEFAULT_FILTERED_FILE: &str = "v2ray.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub raw_file: String,
    pub filtered_file: String,
    /// Also write a `<file>.b64` companion with the base64 of each list.
    pub write_base64: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            raw_file: DEFAULT_RAW_FILE.into(),
            filtered_file: DEFAULT_FILTERED_FILE.into(),
            write_base64: false,
        }
    }
}

impl OutputConfig {
    pub fn raw_path(&self) -> PathBuf {
        self.dir.join(&self.raw_file)
    }

    pub fn filtered_path(&self) -> PathBuf {
        self.dir.join(&self.filtered_file)
    }
}

pub struct ResultWriter {
    config: OutputConfig,
}

impl ResultWriter {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Write every node's `raw` form in the given order.
    pub async fn write_raw(&self, nodes: &[Node]) -> Result<PathBuf, PipelineError> {
        let content = render_lines(nodes.iter());
        let path = self.config.raw_path();
        self.persist(&path, &content).await?;
        tracing::info!("wrote {} nodes to {}", nodes.len(), path.display());
        Ok(path)
    }

    /// Write reachable nodes only, fastest first.
    pub async fn write_filtered(&self, nodes: &[Node]) -> Result<PathBuf, PipelineError> {
        let ordered = order_filtered(nodes);
        let content = render_lines(ordered.iter().copied());
        let path = self.config.filtered_path();
        self.persist(&path, &content).await?;
        tracing::info!("wrote {} reachable nodes to {}", ordered.len(), path.display());
        Ok(path)
    }

    async fn persist(&self, path: &Path, content: &str) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.config.dir)
            .await
            .map_err(|source| PipelineError::Write {
                path: self.config.dir.clone(),
                source,
            })?;

        write_atomic(path, content.as_bytes()).await?;

        if self.config.write_base64 {
            let encoded = base64::engine::general_purpose::STANDARD.encode(content);
            write_atomic(&sibling(path, "b64"), encoded.as_bytes()).await?;
        }
        Ok(())
    }
}

/// Reachable nodes by ascending latency, ties broken by fingerprint.
pub fn order_filtered(nodes: &[Node]) -> Vec<&Node> {
    let mut reachable: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.status() == NodeStatus::Reachable)
        .collect();
    reachable.sort_by(|a, b| {
        a.latency()
            .cmp(&b.latency())
            .then_with(|| a.fingerprint().cmp(b.fingerprint()))
    });
    reachable
}

fn render_lines<'a>(nodes: impl Iterator<Item = &'a Node>) -> String {
    let mut out = String::new();
    for node in nodes {
        out.push_str(node.raw());
        out.push('\n');
    }
    out
}

/// `name.txt` -> `name.txt.<suffix>`, in the same directory.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let tmp = sibling(path, "tmp");
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(source) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        tracing::warn!("failed to write {}: {source}", path.display());
        return Err(PipelineError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
