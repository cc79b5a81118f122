//! Embeds the notes the change tracker flagged and writes them to the store.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, SetupProgress};
use crate::config::IndexingConfig;
use crate::embeddings::{embed_with_timeout, Embedder};
use crate::store::VectorStore;
use crate::tracker::content_hash;
use crate::types::{CycleStats, IndexedNote, NoteRecord, ProcessingProgress, Stage, StatusType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub stats: CycleStats,
    pub processing: ProcessingProgress,
    /// Stopped between batches before all notes were processed.
    pub cancelled: bool,
}

pub struct EmbeddingPipeline {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    bus: EventBus,
    batch_size: usize,
    workers: usize,
    embed_timeout: Duration,
}

impl EmbeddingPipeline {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        bus: EventBus,
        config: &IndexingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            bus,
            batch_size: config.batch_size.max(1),
            workers: config.workers.max(1),
            embed_timeout: config.embed_timeout(),
        }
    }

    /// Embed and store `notes` batch by batch.
    ///
    /// Embeddings inside a batch run concurrently on up to `workers` blocking
    /// threads; results are stored and reported one at a time from this task,
    /// so `processed_notes` grows by exactly one per published event.
    /// Failed notes are counted in `stats.errors` and still advance the count.
    /// `on_progress` is called right before each progress event is published.
    pub async fn run<F>(
        &self,
        notes: Vec<NoteRecord>,
        mut stats: CycleStats,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> PipelineOutcome
    where
        F: FnMut(&ProcessingProgress, &CycleStats),
    {
        let mut progress = ProcessingProgress {
            current_note: None,
            processed_notes: 0,
            total_notes: notes.len(),
        };

        for (batch_no, batch) in notes.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(
                    processed = progress.processed_notes,
                    total = progress.total_notes,
                    "embedding pipeline cancelled"
                );
                return PipelineOutcome {
                    stats,
                    processing: progress,
                    cancelled: true,
                };
            }
            debug!(batch = batch_no, size = batch.len(), "embedding batch");

            let mut results = stream::iter(batch.iter().cloned())
                .map(|record| {
                    let embedder = Arc::clone(&self.embedder);
                    let timeout = self.embed_timeout;
                    async move {
                        let embedding =
                            embed_with_timeout(embedder, record.embedding_text(), timeout).await;
                        (record, embedding)
                    }
                })
                .buffer_unordered(self.workers);

            while let Some((record, embedding)) = results.next().await {
                let stored = match embedding {
                    Ok(embedding) => self.store_note(&record, embedding).await,
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = stored {
                    warn!(id = %record.id, "Failed to index note: {e}");
                    stats.errors += 1;
                }

                progress.processed_notes += 1;
                progress.current_note = Some(record.title);
                on_progress(&progress, &stats);
                self.bus.publish(Event::SetupProgress(SetupProgress {
                    stage: Stage::Processing,
                    status_type: StatusType::ProcessingNotes,
                    processing: Some(progress.clone()),
                    stats: Some(stats),
                }));
            }
        }

        info!(
            processed = progress.processed_notes,
            errors = stats.errors,
            "embedding pipeline finished"
        );
        self.bus.publish(Event::SetupProgress(SetupProgress {
            stage: Stage::Processing,
            status_type: StatusType::Completed,
            processing: None,
            stats: Some(stats),
        }));

        PipelineOutcome {
            stats,
            processing: progress,
            cancelled: false,
        }
    }

    /// Upsert on the blocking pool; writes stay in completion order.
    async fn store_note(&self, record: &NoteRecord, embedding: Vec<f32>) -> Result<(), String> {
        let indexed_at = chrono::Utc::now().timestamp_millis();
        let note = IndexedNote::from_record(record, embedding, content_hash(record), indexed_at);
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.upsert(&note)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(join) => Err(join.to_string()),
        }
    }
}
