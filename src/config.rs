//! TOML configuration.
//!
//! Loaded from `~/.proxy-sieve/config.toml` unless a path is given. Every
//! field has a default, so an absent default file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::pipeline::PipelineConfig;
use crate::sieve::validator::{ValidatorConfig, DEFAULT_GRACE};
use crate::sieve::writer::{
    OutputConfig, DEFAULT_FILTERED_FILE, DEFAULT_OUTPUT_DIR, DEFAULT_RAW_FILE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Subscription locations fetched on every run.
    pub sources: Vec<String>,
    /// Location whose body lists further sources, one per line.
    pub aggregate_source: Option<String>,
    /// Maximum probes in flight.
    pub concurrency: usize,
    /// Global run budget. Validation stops when it runs out.
    pub time_budget_minutes: u64,
    pub probe_timeout_secs: u64,
    /// Reachable nodes slower than this are dropped. 0 disables the limit.
    pub max_latency_ms: u64,
    pub fetch_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub output_dir: String,
    pub raw_file: String,
    pub filtered_file: String,
    pub write_base64: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            aggregate_source: None,
            concurrency: 100,
            time_budget_minutes: 10,
            probe_timeout_secs: 5,
            max_latency_ms: 1000,
            fetch_timeout_secs: 10,
            fetch_concurrency: 16,
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            raw_file: DEFAULT_RAW_FILE.into(),
            filtered_file: DEFAULT_FILTERED_FILE.into(),
            write_base64: false,
        }
    }
}

impl Config {
    /// Default config path: `~/.proxy-sieve/config.toml`.
    pub fn default_path() -> PathBuf {
        let base = directories::BaseDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        base.join(".proxy-sieve").join("config.toml")
    }

    /// Load an explicit config file. A missing file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Load the default config file, falling back to defaults when absent.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        if self.time_budget_minutes == 0 {
            return Err(PipelineError::Config(
                "time_budget_minutes must be at least 1".into(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "probe_timeout_secs must be at least 1".into(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "fetch_timeout_secs must be at least 1".into(),
            ));
        }
        if self.raw_file.trim().is_empty() || self.filtered_file.trim().is_empty() {
            return Err(PipelineError::Config("output file names must not be empty".into()));
        }
        if self.raw_file == self.filtered_file {
            return Err(PipelineError::Config(
                "raw_file and filtered_file must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.output_dir).into_owned())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sources: self.sources.clone(),
            aggregate_source: self.aggregate_source.clone(),
            time_budget: Duration::from_secs(self.time_budget_minutes.saturating_mul(60)),
            fetch_concurrency: self.fetch_concurrency.max(1),
            validator: ValidatorConfig {
                concurrency: self.concurrency,
                probe_timeout: Duration::from_secs(self.probe_timeout_secs),
                max_latency: (self.max_latency_ms > 0)
                    .then(|| Duration::from_millis(self.max_latency_ms)),
                grace: DEFAULT_GRACE,
            },
            output: OutputConfig {
                dir: self.output_dir(),
                raw_file: self.raw_file.clone(),
                filtered_file: self.filtered_file.clone(),
                write_base64: self.write_base64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.concurrency, 100);
        assert_eq!(config.time_budget_minutes, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fields_override_defaults() {
        let config = Config::parse(
            r#"
sources = ["https://a.example.com/sub", "https://b.example.com/sub"]
aggregate_source = "https://agg.example.com/list"
concurrency = 8
time_budget_minutes = 2
max_latency_ms = 0
output_dir = "out"
write_base64 = true
"#,
        )
        .unwrap();

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.fetch_concurrency, 16);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.time_budget, Duration::from_secs(120));
        assert_eq!(pipeline.validator.max_latency, None);
        assert_eq!(pipeline.output.dir, PathBuf::from("out"));
        assert!(pipeline.output.write_base64);
        assert_eq!(
            pipeline.aggregate_source.as_deref(),
            Some("https://agg.example.com/list")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("concurency = 4").is_err());
    }

    #[test]
    fn zero_concurrency_or_budget_is_invalid() {
        let config = Config {
            concurrency: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let config = Config {
            time_budget_minutes: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn same_raw_and_filtered_file_is_invalid() {
        let config = Config {
            filtered_file: DEFAULT_RAW_FILE.into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file_and_reports_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "concurrency = 3\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().concurrency, 3);

        let err = Config::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn tilde_in_output_dir_is_expanded() {
        if std::env::var_os("HOME").is_none() {
            return;
        }
        let config = Config {
            output_dir: "~/lists".into(),
            ..Config::default()
        };
        let dir = config.output_dir();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("lists"));
    }
}
