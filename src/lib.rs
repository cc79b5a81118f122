pub mod bus;
pub mod config;
pub mod coordinator;
pub mod embeddings;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod reconnect;
pub mod search;
pub mod session;
pub mod source;
pub mod store;
pub mod tracker;
pub mod types;
pub mod watcher;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, EventKind, Subscription};
use crate::config::EngineConfig;
use crate::coordinator::{CycleHandle, IndexingCoordinator};
use crate::embeddings::Embedder;
use crate::error::{IndexingError, StorageError};
use crate::search::SearchService;
use crate::source::NoteSource;
use crate::store::VectorStore;
use crate::watcher::SourceWatcher;

/// Everything a running engine needs, built once and passed to whoever needs it.
/// Cheap to clone; clones share the same store, bus and coordinator.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    bus: EventBus,
    store: Arc<VectorStore>,
    source: Arc<dyn NoteSource>,
    coordinator: Arc<IndexingCoordinator>,
    search: Arc<SearchService>,
}

impl Engine {
    /// Open the vector store and wire the components together.
    /// Fails only if the store cannot be opened.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn NoteSource>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, StorageError> {
        let store = Arc::new(VectorStore::open(&config.store_path, embedder.dimensions())?);
        let bus = EventBus::new();
        let coordinator = Arc::new(IndexingCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&source),
            Arc::clone(&embedder),
            bus.clone(),
            &config.indexing,
        ));
        let search = Arc::new(SearchService::new(
            Arc::clone(&store),
            embedder,
            config.indexing.embed_timeout(),
            &config.search,
        ));
        info!(store = %config.store_path.display(), "engine ready");
        Ok(Self {
            config: Arc::new(config),
            bus,
            store,
            source,
            coordinator,
            search,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<IndexingCoordinator> {
        &self.coordinator
    }

    pub fn search(&self) -> &SearchService {
        &self.search
    }

    pub fn start_indexing(&self) -> Result<CycleHandle, IndexingError> {
        self.coordinator.start()
    }

    /// Start a cycle whenever the watcher reports a source change.
    /// A change that arrives mid-cycle is dropped; the next change catches it.
    pub fn wire_source_changes(&self) -> Subscription {
        let coordinator = Arc::clone(&self.coordinator);
        self.bus.subscribe(EventKind::SourceChanged, move |event| {
            if let Event::SourceChanged { observed_at } = event {
                debug!(observed_at, "source change observed");
            }
            match coordinator.start() {
                Ok(_) => Ok(()),
                Err(IndexingError::AlreadyIndexing) => {
                    warn!("source changed while indexing, skipping");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Poll the note source in the background until `cancel` fires.
    pub fn spawn_watcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        SourceWatcher::from_config(Arc::clone(&self.source), self.bus.clone(), &self.config.watcher)
            .spawn(cancel)
    }
}

/// Log to stderr; stdout may carry protocol messages.
/// `RUST_LOG` wins when set. Otherwise only log WARN and above in production
/// to avoid leaking note content.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let builder = tracing_subscriber::fmt().with_writer(std::io::stderr);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        #[cfg(debug_assertions)]
        Err(_) => builder.init(),
        #[cfg(not(debug_assertions))]
        Err(_) => builder.with_max_level(tracing::Level::WARN).init(),
    }
}
