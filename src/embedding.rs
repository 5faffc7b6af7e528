//! Embedding providers: text in, fixed-dimension vector out.
//!
//! Two implementations are provided:
//! - `LocalEmbedder` runs a fastembed model in-process
//! - `RemoteEmbedder` calls an HTTP embedding endpoint
//!
//! Both establish their dimension at construction time by probing, so the
//! rest of the system can treat the dimension as invariant.

use fastembed::{InitOptions, TextEmbedding};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum input length for embedding (characters, not tokens)
const MAX_INPUT_LENGTH: usize = 512;

/// Ellipsis suffix when input is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// An opaque text -> vector function.
///
/// `embed` may fail transiently (`Unavailable`); callers must not mutate any
/// state when it does. The dimension reported here is fixed for the lifetime
/// of the provider.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;

    /// SHA256 hash of the model name, stored in snapshot headers so that a
    /// snapshot produced by one model is never queried with another.
    fn model_id(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.model_name().as_bytes());
        hasher.finalize().into()
    }
}

/// Prepare text for embedding.
///
/// Returns `None` if the text is empty after trimming. Long input is
/// truncated to `MAX_INPUT_LENGTH` at a char boundary with an ellipsis.
pub fn preprocess_text(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    // gate and truncation both count chars, so multibyte input is treated
    // the same as ASCII
    if text.chars().count() <= MAX_INPUT_LENGTH {
        return Some(text.to_string());
    }

    let max_chars = MAX_INPUT_LENGTH - TRUNCATION_SUFFIX.chars().count();
    let truncated: String = text.chars().take(max_chars).collect();
    Some(format!("{}{}", truncated, TRUNCATION_SUFFIX))
}

/// In-process embedding via fastembed.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct LocalEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl LocalEmbedder {
    /// Create a local embedder with the given model name.
    ///
    /// The model is downloaded on first use if not cached; models live in
    /// the `models/` subdirectory of `cache_dir`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let _timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl EmbeddingProvider for LocalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::Unavailable(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Unavailable("No embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[derive(Debug, Deserialize)]
struct RemoteEmbedResponse {
    embedding: Vec<f32>,
}

/// Embedding via a remote HTTP endpoint.
///
/// POSTs `{"model": ..., "input": ...}` to the endpoint and expects
/// `{"embedding": [...]}` back. The bearer token is read from the
/// environment at construction.
pub struct RemoteEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model_name: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl RemoteEmbedder {
    pub fn new(
        endpoint: &str,
        model_name: &str,
        api_key_env: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let api_key = match api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                EmbeddingError::InitFailed(format!("credentials env var {} is not set", var))
            })?),
            None => None,
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(30)))
            .build()
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let mut embedder = Self {
            client,
            endpoint: endpoint.to_string(),
            model_name: model_name.to_string(),
            api_key,
            dimensions: 0,
        };

        // Probe once so the dimension is fixed before the index sees it.
        let probe = embedder.request("dimension probe")?;
        if probe.is_empty() {
            return Err(EmbeddingError::InitFailed(
                "endpoint returned an empty embedding".to_string(),
            ));
        }
        embedder.dimensions = probe.len();

        Ok(embedder)
    }

    fn request(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model_name,
            "input": text,
        }));

        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let body: RemoteEmbedResponse = resp
            .json()
            .map_err(|e| EmbeddingError::Unavailable(format!("malformed response: {}", e)))?;

        Ok(body.embedding)
    }
}

impl EmbeddingProvider for RemoteEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.request(text)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Build a provider from configuration.
pub fn from_config(
    cfg: &crate::config::EmbeddingConfig,
    cache_dir: PathBuf,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let timeout = Duration::from_secs(cfg.download_timeout_secs);

    match cfg.provider.as_str() {
        "local" => Ok(Arc::new(LocalEmbedder::new(
            &cfg.model,
            cache_dir,
            Some(timeout),
        )?)),
        "remote" => {
            let endpoint = cfg.endpoint.as_deref().ok_or_else(|| {
                EmbeddingError::InitFailed("remote provider requires an endpoint".to_string())
            })?;
            Ok(Arc::new(RemoteEmbedder::new(
                endpoint,
                &cfg.model,
                cfg.api_key_env.as_deref(),
                Some(timeout),
            )?))
        }
        other => Err(EmbeddingError::InitFailed(format!(
            "unknown provider '{}'",
            other
        ))),
    }
}

#[cfg(test)]
pub mod stub {
    //! Deterministic in-memory provider for tests. Distinct texts map to
    //! orthogonal one-hot vectors, identical texts to identical vectors.

    use super::{EmbeddingError, EmbeddingProvider};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    pub struct StubEmbedder {
        dimensions: usize,
        fixed: HashMap<String, Vec<f32>>,
        assigned: Mutex<HashMap<String, usize>>,
        fail: AtomicBool,
    }

    impl StubEmbedder {
        pub fn new(dimensions: usize) -> Self {
            Self {
                dimensions,
                fixed: HashMap::new(),
                assigned: Mutex::new(HashMap::new()),
                fail: AtomicBool::new(false),
            }
        }

        /// Pin specific texts to specific vectors (e.g. for boundary tests).
        pub fn with_fixed(dimensions: usize, fixed: HashMap<String, Vec<f32>>) -> Self {
            Self {
                dimensions,
                fixed,
                assigned: Mutex::new(HashMap::new()),
                fail: AtomicBool::new(false),
            }
        }

        /// Make subsequent embed() calls fail, simulating a provider outage.
        pub fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }
    }

    impl EmbeddingProvider for StubEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Unavailable("stub outage".to_string()));
            }

            if let Some(vector) = self.fixed.get(text) {
                return Ok(vector.clone());
            }

            let mut assigned = self.assigned.lock().unwrap();
            let next = assigned.len();
            let axis = *assigned.entry(text.to_string()).or_insert(next);
            assert!(axis < self.dimensions, "stub embedder ran out of axes");

            let mut vector = vec![0.0; self.dimensions];
            vector[axis] = 1.0;
            Ok(vector)
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }
}
