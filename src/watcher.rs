use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{Event, EventBus};
use crate::config::WatcherConfig;
use crate::reconnect::Reconnector;
use crate::source::NoteSource;

/// Polls the note source for modifications and publishes
/// [`Event::SourceChanged`] once a change has been followed by a quiet period.
/// The note source may write several times during a save; we debounce.
pub struct SourceWatcher {
    source: Arc<dyn NoteSource>,
    bus: EventBus,
    poll_interval: Duration,
    debounce: Duration,
    reconnector: Reconnector,
}

impl SourceWatcher {
    pub fn new(
        source: Arc<dyn NoteSource>,
        bus: EventBus,
        poll_interval: Duration,
        debounce: Duration,
        reconnector: Reconnector,
    ) -> Self {
        Self {
            source,
            bus,
            poll_interval,
            debounce,
            reconnector,
        }
    }

    pub fn from_config(source: Arc<dyn NoteSource>, bus: EventBus, config: &WatcherConfig) -> Self {
        Self::new(
            source,
            bus,
            config.poll_interval(),
            config.debounce(),
            Reconnector::new(config.retry_initial(), config.retry_max()),
        )
    }

    /// Start the background poll loop. It stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut last_modified: Option<SystemTime> = None;
        let mut pending_since: Option<Instant> = None;
        let mut wait = self.poll_interval;

        info!(poll = ?self.poll_interval, debounce = ?self.debounce, "source watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = self.poll_interval;

            self.reconnector.begin_attempt();
            let current = match self.source.last_modified() {
                Ok(t) => {
                    self.reconnector.on_success();
                    t
                }
                Err(e) => {
                    debug!("source probe failed: {e}");
                    wait = self.reconnector.on_failure();
                    continue;
                }
            };

            let changed = match (last_modified, current) {
                (None, Some(t)) => {
                    last_modified = Some(t);
                    false // first observation is the baseline
                }
                (Some(prev), Some(cur)) if cur != prev => {
                    last_modified = Some(cur);
                    true
                }
                _ => false,
            };

            if changed {
                // Start (or reset) the debounce timer
                pending_since = Some(Instant::now());
            }

            if let Some(since) = pending_since {
                if since.elapsed() >= self.debounce {
                    pending_since = None;
                    debug!("note source changed");
                    self.bus.publish(Event::SourceChanged {
                        observed_at: chrono::Utc::now().timestamp_millis(),
                    });
                }
            }
        }
        info!("source watcher stopped");
    }
}
