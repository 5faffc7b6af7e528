use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::service::ServiceOptions;

/// Default number of admissions buffered before a flush
const DEFAULT_BATCH_SIZE: u64 = 100;
/// Default maximum age of unflushed admissions (5 minutes)
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 300;
/// Default duplicate cutoff: cosine distance strictly below this is a duplicate
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;
/// Default snapshot file name under the base path
const DEFAULT_SNAPSHOT_FILE: &str = "snapshot.bin";
/// Default embedding model
const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Configuration for the embedding provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "local" (fastembed in-process) or "remote" (HTTP endpoint)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model name (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Endpoint URL, required when provider is "remote"
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Name of the env var holding the bearer token for a remote endpoint
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Timeout for model download / remote requests in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            endpoint: None,
            api_key_env: None,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}

fn default_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Duplicate iff cosine distance < threshold. Range [0, 2].
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            snapshot_file: DEFAULT_SNAPSHOT_FILE.to_string(),
            embedding: EmbeddingConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_batch_size() -> u64 {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval_secs() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_snapshot_file() -> String {
    DEFAULT_SNAPSHOT_FILE.to_string()
}

impl Config {
    /// Load from `config.yaml` under the base path, creating defaults if
    /// it does not exist. Base path comes from `NEARDUP_BASE_PATH`,
    /// falling back to `~/.local/share/neardup`.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&Self::resolve_base_path()?)
    }

    pub fn load_with(base_path: &PathBuf) -> anyhow::Result<Self> {
        use anyhow::Context;

        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join("config.yaml");
        if !config_path.exists() {
            std::fs::write(&config_path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self =
            serde_yml::from_str(&config_str).context("config.yaml is malformed")?;

        config.base_path = base_path.clone();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = self.base_path.join("config.yaml");
        std::fs::write(&config_path, serde_yml::to_string(self)?)?;
        Ok(())
    }

    fn resolve_base_path() -> anyhow::Result<PathBuf> {
        if let Ok(path) = std::env::var("NEARDUP_BASE_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = homedir::my_home()
            .ok()
            .flatten()
            .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
        Ok(home.join(".local/share/neardup"))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.flush_interval_secs == 0 {
            anyhow::bail!("flush_interval_secs must be greater than 0");
        }
        // cosine distance lives in [0, 2]
        if !(0.0..=2.0).contains(&self.similarity_threshold) {
            anyhow::bail!(
                "similarity_threshold must be between 0.0 and 2.0, got {}",
                self.similarity_threshold
            );
        }
        if self.snapshot_file.is_empty() {
            anyhow::bail!("snapshot_file must not be empty");
        }

        match self.embedding.provider.as_str() {
            "local" => {}
            "remote" => {
                if self.embedding.endpoint.is_none() {
                    anyhow::bail!("embedding.endpoint is required when provider is 'remote'");
                }
            }
            other => anyhow::bail!(
                "embedding.provider must be 'local' or 'remote', got '{}'",
                other
            ),
        }

        if self.embedding.download_timeout_secs == 0 {
            anyhow::bail!("embedding.download_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.base_path.join(&self.snapshot_file)
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            similarity_threshold: self.similarity_threshold,
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(&dir.path().to_path_buf()).unwrap();

        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval_secs, 300);
        assert_eq!(config.similarity_threshold, 0.5);
        assert!(dir.path().join("config.yaml").exists());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "batch_size: 7\n").unwrap();

        let config = Config::load_with(&dir.path().to_path_buf()).unwrap();
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.flush_interval_secs, 300);
        assert_eq!(config.embedding.provider, "local");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "batch_size: 0\n").unwrap();

        assert!(Config::load_with(&dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "similarity_threshold: 2.5\n").unwrap();

        assert!(Config::load_with(&dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_remote_provider_requires_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "embedding:\n  provider: remote\n",
        )
        .unwrap();

        assert!(Config::load_with(&dir.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_snapshot_path_is_under_base() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(&dir.path().to_path_buf()).unwrap();
        assert_eq!(config.snapshot_path(), dir.path().join("snapshot.bin"));
    }
}
