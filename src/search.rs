use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::SearchConfig;
use crate::embeddings::{embed_with_timeout, Embedder};
use crate::error::{SearchError, StorageError};
use crate::store::VectorStore;
use crate::types::{IndexStatus, SearchResult};

/// Results returned by [`SearchService::similar`] when no limit is given.
pub const DEFAULT_SIMILAR_LIMIT: usize = 5;

/// Answers queries against whatever the store has committed, independent of
/// any running indexing cycle.
pub struct SearchService {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
    default_limit: usize,
    max_limit: usize,
}

impl SearchService {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        embed_timeout: Duration,
        config: &SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            embed_timeout,
            default_limit: config.default_limit,
            max_limit: config.max_limit.max(1),
        }
    }

    /// Top matches for `text`, best first. `limit` falls back to the
    /// configured default and is capped at the configured maximum.
    pub async fn search(
        &self,
        text: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let query = text.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let limit = limit.unwrap_or(self.default_limit).min(self.max_limit);

        let embedder = Arc::clone(&self.embedder);
        let embedding = embed_with_timeout(embedder, query.to_string(), self.embed_timeout).await?;

        let results = self.rank(embedding, limit, None).await?;
        debug!(limit, hits = results.len(), "search answered");
        Ok(results)
    }

    /// Notes closest to the stored note `id`, which is itself left out.
    /// An unknown or trashed `id` has no neighbours.
    pub async fn similar(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let limit = limit.unwrap_or(DEFAULT_SIMILAR_LIMIT).min(self.max_limit);
        let store = Arc::clone(&self.store);
        let lookup = id.to_string();
        let source = tokio::task::spawn_blocking(move || store.get(&lookup))
            .await
            .map_err(join_error)??;

        let Some(source) = source.filter(|note| !note.trashed) else {
            debug!(id, "similar: note not indexed");
            return Ok(Vec::new());
        };
        let results = self.rank(source.embedding, limit, Some(source.id)).await?;
        debug!(id, limit, hits = results.len(), "similar answered");
        Ok(results)
    }

    async fn rank(
        &self,
        embedding: Vec<f32>,
        limit: usize,
        exclude: Option<String>,
    ) -> Result<Vec<SearchResult>, StorageError> {
        let store = Arc::clone(&self.store);
        let hits = tokio::task::spawn_blocking(move || {
            store.search_excluding(&embedding, limit, exclude.as_deref())
        })
        .await
        .map_err(join_error)??;

        Ok(hits
            .into_iter()
            .map(|hit| SearchResult::from_scored(hit.note, hit.score))
            .collect())
    }

    pub fn status(&self) -> Result<IndexStatus, StorageError> {
        let last_completed_at = self.store.last_completed_at()?;
        Ok(IndexStatus {
            has_completed_index: last_completed_at.is_some(),
            indexed_notes: self.store.count()?,
            last_completed_at,
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Io(std::io::Error::other(e.to_string()))
}
