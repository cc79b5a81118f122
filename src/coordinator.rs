//! Drives one indexing cycle at a time through its stages.
//!
//! `Idle -> Initializing -> Parsing -> Processing -> Completed`, or `Failed`
//! from any running stage. Both terminal stages return the coordinator to
//! `Idle`; the finished cycle stays readable through [`IndexingCoordinator::last_cycle`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::{Event, EventBus, SetupComplete, SetupProgress};
use crate::config::IndexingConfig;
use crate::embeddings::Embedder;
use crate::error::{FetchError, IndexingError, StorageError};
use crate::pipeline::EmbeddingPipeline;
use crate::source::{NoteSnapshot, NoteSource};
use crate::store::VectorStore;
use crate::tracker::ChangeTracker;
use crate::types::{CycleSnapshot, CycleStats, ProcessingProgress, Stage, StatusType};

#[derive(Default)]
struct CoordinatorState {
    current: CycleSnapshot,
    cancel: Option<CancellationToken>,
    last: Option<CycleSnapshot>,
}

pub struct IndexingCoordinator {
    store: Arc<VectorStore>,
    source: Arc<dyn NoteSource>,
    bus: EventBus,
    pipeline: EmbeddingPipeline,
    fetch_timeout: Duration,
    state: Mutex<CoordinatorState>,
}

/// A running cycle. Dropping the handle does not stop the cycle.
pub struct CycleHandle {
    cancel: CancellationToken,
    task: JoinHandle<CycleSnapshot>,
}

impl CycleHandle {
    /// Ask the cycle to stop at the next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the cycle to finish and return its final snapshot.
    pub async fn wait(self) -> CycleSnapshot {
        match self.task.await {
            Ok(snapshot) => snapshot,
            Err(e) => CycleSnapshot {
                stage: Stage::Failed,
                error: Some(format!("indexing task aborted: {e}")),
                ..CycleSnapshot::default()
            },
        }
    }
}

impl IndexingCoordinator {
    pub fn new(
        store: Arc<VectorStore>,
        source: Arc<dyn NoteSource>,
        embedder: Arc<dyn Embedder>,
        bus: EventBus,
        config: &IndexingConfig,
    ) -> Self {
        let pipeline = EmbeddingPipeline::new(Arc::clone(&store), embedder, bus.clone(), config);
        Self {
            store,
            source,
            bus,
            pipeline,
            fetch_timeout: config.fetch_timeout(),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new cycle on the Tokio runtime.
    ///
    /// Rejected with [`IndexingError::AlreadyIndexing`] unless the coordinator
    /// is idle; the running cycle is left untouched in that case.
    pub fn start(self: &Arc<Self>) -> Result<CycleHandle, IndexingError> {
        let cancel = CancellationToken::new();
        {
            let mut state = self.state();
            if state.current.stage != Stage::Idle {
                return Err(IndexingError::AlreadyIndexing);
            }
            state.current = CycleSnapshot {
                stage: Stage::Initializing,
                ..CycleSnapshot::default()
            };
            state.cancel = Some(cancel.clone());
        }

        info!("indexing cycle started");
        let this = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.run_cycle(token).await });
        Ok(CycleHandle { cancel, task })
    }

    /// Cancel the running cycle, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match &self.state().cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_indexing(&self) -> bool {
        self.state().current.stage != Stage::Idle
    }

    /// The running cycle, or an idle snapshot.
    pub fn snapshot(&self) -> CycleSnapshot {
        self.state().current.clone()
    }

    /// The most recently finished cycle.
    pub fn last_cycle(&self) -> Option<CycleSnapshot> {
        self.state().last.clone()
    }

    async fn run_cycle(self: Arc<Self>, cancel: CancellationToken) -> CycleSnapshot {
        let outcome = self.drive(&cancel).await;
        self.finish(outcome)
    }

    async fn drive(&self, cancel: &CancellationToken) -> Result<CycleStats, IndexingError> {
        self.transition(Stage::Initializing, StatusType::Starting, None);
        self.transition(Stage::Initializing, StatusType::CheckingServices, None);
        let indexed = self.on_store(|store| store.count()).await?;
        info!(indexed, "vector store ready");
        self.transition(Stage::Initializing, StatusType::ServicesReady, None);
        ensure_running(cancel)?;

        self.transition(Stage::Parsing, StatusType::ReadingDatabase, None);
        let snapshot = self.fetch().await?;
        info!(
            count = snapshot.notes.len(),
            skipped = snapshot.error_count(),
            "notes fetched"
        );
        self.transition(Stage::Parsing, StatusType::DatabaseRead, None);
        ensure_running(cancel)?;

        let changes = self
            .on_store(move |store| ChangeTracker::reconcile(snapshot, store))
            .await?;
        let stats = changes.stats();
        self.state().current.stats = stats;
        if !changes.deleted.is_empty() {
            self.transition(Stage::Processing, StatusType::CleaningUp, None);
        }

        let preparing = ProcessingProgress {
            current_note: None,
            processed_notes: 0,
            total_notes: changes.to_embed.len(),
        };
        self.transition(Stage::Processing, StatusType::PreparingNotes, Some(preparing));

        let outcome = self
            .pipeline
            .run(changes.to_embed, stats, cancel, |progress, stats| {
                let mut state = self.state();
                state.current.processing = Some(progress.clone());
                state.current.stats = *stats;
            })
            .await;
        self.state().current.stats = outcome.stats;
        if outcome.cancelled {
            return Err(IndexingError::Cancelled);
        }

        let completed_at = chrono::Utc::now().timestamp_millis();
        self.on_store(move |store| store.mark_cycle_completed(completed_at)).await?;
        Ok(outcome.stats)
    }

    /// Run a store call on the blocking pool.
    async fn on_store<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&VectorStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?
    }

    async fn fetch(&self) -> Result<NoteSnapshot, FetchError> {
        let source = Arc::clone(&self.source);
        let task = tokio::task::spawn_blocking(move || source.fetch_notes());
        match tokio::time::timeout(self.fetch_timeout, task).await {
            Err(_) => Err(FetchError::Timeout(self.fetch_timeout)),
            Ok(Err(join)) => Err(FetchError::Read(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    /// Record the new stage and announce it.
    fn transition(&self, stage: Stage, status: StatusType, processing: Option<ProcessingProgress>) {
        let stats = {
            let mut state = self.state();
            state.current.stage = stage;
            if processing.is_some() {
                state.current.processing = processing.clone();
            }
            state.current.stats
        };
        self.bus.publish(Event::SetupProgress(SetupProgress {
            stage,
            status_type: status,
            processing,
            stats: (stage == Stage::Processing).then_some(stats),
        }));
    }

    /// Close the cycle, return to `Idle` and publish the terminal events.
    fn finish(&self, outcome: Result<CycleStats, IndexingError>) -> CycleSnapshot {
        let (failed_at, snapshot) = {
            let mut state = self.state();
            let failed_at = state.current.stage;
            let mut snapshot = std::mem::take(&mut state.current);
            match &outcome {
                Ok(stats) => {
                    snapshot.stage = Stage::Completed;
                    snapshot.stats = *stats;
                }
                Err(e) => {
                    snapshot.stage = Stage::Failed;
                    snapshot.error = Some(e.to_string());
                }
            }
            state.cancel = None;
            state.last = Some(snapshot.clone());
            (failed_at, snapshot)
        };

        match &snapshot.error {
            None => {
                info!(
                    new = snapshot.stats.new,
                    modified = snapshot.stats.modified,
                    unchanged = snapshot.stats.unchanged,
                    deleted = snapshot.stats.deleted,
                    errors = snapshot.stats.errors,
                    "indexing cycle completed"
                );
                self.bus.publish(Event::SetupComplete(SetupComplete {
                    success: true,
                    stats: Some(snapshot.stats),
                    error: None,
                }));
            }
            Some(message) => {
                error!(stage = ?failed_at, "indexing cycle failed: {message}");
                self.bus.publish(Event::SetupProgress(SetupProgress {
                    stage: failed_at,
                    status_type: StatusType::Failed,
                    processing: None,
                    stats: Some(snapshot.stats),
                }));
                self.bus.publish(Event::SetupComplete(SetupComplete {
                    success: false,
                    stats: Some(snapshot.stats),
                    error: Some(message.clone()),
                }));
            }
        }
        snapshot
    }
}

fn ensure_running(cancel: &CancellationToken) -> Result<(), IndexingError> {
    if cancel.is_cancelled() {
        Err(IndexingError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::error::EmbeddingError;
    use crate::types::NoteRecord;
    use pretty_assertions::assert_eq;

    struct StaticSource(Result<Vec<NoteRecord>, ()>);

    impl NoteSource for StaticSource {
        fn fetch_notes(&self) -> Result<NoteSnapshot, FetchError> {
            self.0
                .clone()
                .map(Into::into)
                .map_err(|_| FetchError::Read("source offline".to_string()))
        }
    }

    struct FlatEmbedder;

    impl Embedder for FlatEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn note(id: &str) -> NoteRecord {
        NoteRecord {
            id: id.to_string(),
            uuid: id.to_string(),
            title: id.to_string(),
            plaintext: "body".to_string(),
            html: String::new(),
            creation_time: 0,
            modify_time: 1,
            is_pinned: false,
            is_deleted: false,
            in_trash: false,
        }
    }

    fn coordinator(
        dir: &tempfile::TempDir,
        source: StaticSource,
        bus: &EventBus,
    ) -> Arc<IndexingCoordinator> {
        let store = Arc::new(VectorStore::open(&dir.path().join("index.sqlite"), 2).unwrap());
        Arc::new(IndexingCoordinator::new(
            store,
            Arc::new(source),
            Arc::new(FlatEmbedder),
            bus.clone(),
            &IndexingConfig::default(),
        ))
    }

    fn statuses(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<(Stage, StatusType)> {
        let mut out = Vec::new();
        while let Ok(Event::SetupProgress(p)) = rx.try_recv() {
            out.push((p.stage, p.status_type));
        }
        out
    }

    #[tokio::test]
    async fn completed_cycle_walks_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(EventKind::SetupProgress);
        let coordinator = coordinator(&dir, StaticSource(Ok(vec![note("a")])), &bus);

        let snapshot = coordinator.start().unwrap().wait().await;

        assert_eq!(snapshot.stage, Stage::Completed);
        assert_eq!(
            statuses(&mut rx),
            vec![
                (Stage::Initializing, StatusType::Starting),
                (Stage::Initializing, StatusType::CheckingServices),
                (Stage::Initializing, StatusType::ServicesReady),
                (Stage::Parsing, StatusType::ReadingDatabase),
                (Stage::Parsing, StatusType::DatabaseRead),
                (Stage::Processing, StatusType::PreparingNotes),
                (Stage::Processing, StatusType::ProcessingNotes),
                (Stage::Processing, StatusType::Completed),
            ]
        );
        assert!(!coordinator.is_indexing());
        assert_eq!(coordinator.last_cycle().unwrap().stats.new, 1);
    }

    #[tokio::test]
    async fn fetch_failure_fails_the_cycle_at_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let (_p, mut progress) = bus.subscribe_channel(EventKind::SetupProgress);
        let (_c, mut complete) = bus.subscribe_channel(EventKind::SetupComplete);
        let coordinator = coordinator(&dir, StaticSource(Err(())), &bus);

        let snapshot = coordinator.start().unwrap().wait().await;

        assert_eq!(snapshot.stage, Stage::Failed);
        let seen = statuses(&mut progress);
        assert_eq!(seen.last(), Some(&(Stage::Parsing, StatusType::Failed)));
        let Ok(Event::SetupComplete(done)) = complete.try_recv() else {
            panic!("expected setup complete");
        };
        assert!(!done.success);
        assert!(done.error.unwrap().contains("source offline"));
        assert_eq!(coordinator.snapshot().stage, Stage::Idle);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let coordinator = coordinator(&dir, StaticSource(Ok(vec![note("a")])), &bus);

        let handle = coordinator.start().unwrap();
        assert!(matches!(coordinator.start(), Err(IndexingError::AlreadyIndexing)));
        assert_eq!(handle.wait().await.stage, Stage::Completed);

        assert!(coordinator.start().is_ok());
    }

    #[tokio::test]
    async fn cancelled_cycle_fails_without_touching_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let coordinator = coordinator(&dir, StaticSource(Ok(vec![note("a")])), &bus);

        let handle = coordinator.start().unwrap();
        handle.cancel();
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.stage, Stage::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("indexing cancelled"));
        assert!(coordinator.store.all_ids().unwrap().is_empty());
        assert_eq!(coordinator.store.last_completed_at().unwrap(), None);
    }
}
