use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::EmbeddingError;

/// Embedding dimension for bge-small-en-v1.5.
pub const DIMENSIONS: usize = 384;

/// Turns text into a fixed-length vector.
///
/// Calls are blocking; async callers run them on the blocking pool.
pub trait Embedder: Send + Sync {
    /// Length of every vector returned by [`Embedder::embed`].
    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Wraps the fastembed TextEmbedding model (bge-small-en-v1.5, 384 dims).
/// Model is downloaded and cached on first use (~33MB, one-time).
///
/// The inner `TextEmbedding` session is protected by a `Mutex` so that
/// concurrent calls from search queries and pipeline workers are
/// serialized, preventing heap corruption in the ONNX Runtime C++ layer.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedder {
    /// Initialize the embedding model. Downloads on first run, cached afterwards.
    /// `show_progress` controls whether download progress is printed to stdout,
    /// so keep it off when stdout carries protocol messages.
    pub fn new(cache_dir: &Path, show_progress: bool) -> Result<Self, EmbeddingError> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(show_progress),
        )
        .map_err(|e| EmbeddingError::Model(e.to_string()))?;
        Ok(Self { model: Mutex::new(model) })
    }
}

impl Embedder for FastEmbedder {
    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::Model(format!("model lock poisoned: {e}")))?;
        let mut results = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::Model(e.to_string()))?;
        if results.is_empty() {
            return Err(EmbeddingError::Model("model returned no embedding".to_string()));
        }
        Ok(normalize(results.remove(0)))
    }
}

/// Run one blocking embedding call on the blocking pool, bounded by `timeout`.
/// A call that times out keeps running in the background but its result is dropped.
pub async fn embed_with_timeout(
    embedder: Arc<dyn Embedder>,
    text: String,
    timeout: Duration,
) -> Result<Vec<f32>, EmbeddingError> {
    let task = tokio::task::spawn_blocking(move || embedder.embed(&text));
    match tokio::time::timeout(timeout, task).await {
        Err(_) => Err(EmbeddingError::Timeout(timeout)),
        Ok(Err(join)) => Err(EmbeddingError::Worker(join.to_string())),
        Ok(Ok(result)) => result,
    }
}

/// L2-normalize a vector so cosine similarity == dot product.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Cosine similarity. Zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= 1e-10 || norm_b <= 1e-10 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
