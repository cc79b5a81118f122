//! One client conversation: inbound messages in, envelopes out.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{Event, EventKind, Subscription};
use crate::error::{IndexingError, SearchError};
use crate::protocol::{new_request_id, parse_inbound, Envelope, InboundMessage};
use crate::types::SearchResult;
use crate::Engine;

/// Request id that setup events are answered with. Set by `setup_start`;
/// cycles started elsewhere get a fresh id of their own.
type SetupRequest = Arc<Mutex<Option<String>>>;

fn lock(setup: &SetupRequest) -> MutexGuard<'_, Option<String>> {
    setup.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Session {
    engine: Engine,
    outbound: mpsc::UnboundedSender<Envelope>,
    setup_request: SetupRequest,
    subscriptions: Vec<Subscription>,
    forwarder: JoinHandle<()>,
}

impl Session {
    /// Open a session. Replies and cycle events are sent to `outbound`.
    /// Must be called from within a Tokio runtime.
    pub fn new(engine: Engine, outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        let (progress_sub, progress_rx) = engine.bus().subscribe_channel(EventKind::SetupProgress);
        let (complete_sub, complete_rx) = engine.bus().subscribe_channel(EventKind::SetupComplete);
        let setup_request = SetupRequest::default();
        let forwarder = tokio::spawn(forward_setup_events(
            progress_rx,
            complete_rx,
            Arc::clone(&setup_request),
            outbound.clone(),
        ));
        Self {
            engine,
            outbound,
            setup_request,
            subscriptions: vec![progress_sub, complete_sub],
            forwarder,
        }
    }

    /// Handle one inbound text message. Malformed input is answered with an
    /// `error` envelope; the session stays usable. Queries are answered from
    /// their own task, so replies may arrive out of request order.
    pub fn handle_text(&self, text: &str) {
        let inbound = match parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(rejected) => {
                warn!(code = rejected.error.code(), "Rejected inbound message: {}", rejected.error);
                self.send(Envelope::error(
                    &rejected.request_id,
                    rejected.error.code(),
                    &rejected.error.to_string(),
                ));
                return;
            }
        };
        let id = inbound.request_id;

        match inbound.message {
            InboundMessage::Ping => self.send(Envelope::pong(&id)),
            InboundMessage::SetupStart => {
                // Hold the lock across start so the first event already carries this id.
                let mut setup = lock(&self.setup_request);
                match self.engine.start_indexing() {
                    Ok(_) => {
                        debug!(request_id = %id, "setup started");
                        *setup = Some(id);
                    }
                    Err(e @ IndexingError::AlreadyIndexing) => {
                        drop(setup);
                        self.send(Envelope::error(&id, "already_indexing", &e.to_string()));
                    }
                    Err(e) => {
                        drop(setup);
                        self.send(Envelope::error(&id, "indexing_failed", &e.to_string()));
                    }
                }
            }
            InboundMessage::SearchRequest { query, limit } => {
                let engine = self.engine.clone();
                self.spawn_query(id, async move { engine.search().search(&query, limit).await });
            }
            InboundMessage::SimilarRequest { note_id, limit } => {
                let engine = self.engine.clone();
                self.spawn_query(id, async move { engine.search().similar(&note_id, limit).await });
            }
            InboundMessage::StatusRequest => {
                let stage = self.engine.coordinator().snapshot().stage;
                match self.engine.search().status() {
                    Ok(status) => self.send(Envelope::status(&id, &status, stage)),
                    Err(e) => self.send(Envelope::error(&id, "storage_failed", &e.to_string())),
                }
            }
        }
    }

    fn spawn_query<F>(&self, id: String, query: F)
    where
        F: Future<Output = Result<Vec<SearchResult>, SearchError>> + Send + 'static,
    {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let envelope = match query.await {
                Ok(results) => Envelope::search_results(&id, &results),
                Err(e) => {
                    warn!(code = e.code(), "Search failed: {e}");
                    Envelope::error(&id, e.code(), &e.to_string())
                }
            };
            if outbound.send(envelope).is_err() {
                debug!("session outbound closed, dropping search reply");
            }
        });
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            debug!("session outbound closed, dropping message");
        }
    }

    /// Stop forwarding cycle events. A running cycle is not affected.
    pub fn close(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.forwarder.abort();
    }
}

/// Forward setup events in publish order.
///
/// The two kinds arrive on separate queues. A `SetupComplete` is only
/// published after the cycle's last progress event, so draining the progress
/// queue before forwarding it keeps the terminal message last.
async fn forward_setup_events(
    mut progress: mpsc::UnboundedReceiver<Event>,
    mut complete: mpsc::UnboundedReceiver<Event>,
    setup_request: SetupRequest,
    outbound: mpsc::UnboundedSender<Envelope>,
) {
    let request_id = || lock(&setup_request).get_or_insert_with(new_request_id).clone();

    loop {
        let event = tokio::select! {
            biased;
            Some(event) = progress.recv() => event,
            Some(event) = complete.recv() => {
                while let Ok(Event::SetupProgress(p)) = progress.try_recv() {
                    let _ = outbound.send(Envelope::setup_progress(&request_id(), &p));
                }
                event
            }
            else => break,
        };

        let envelope = match event {
            Event::SetupProgress(p) => Envelope::setup_progress(&request_id(), &p),
            Event::SetupComplete(c) => {
                let id = lock(&setup_request).take().unwrap_or_else(new_request_id);
                Envelope::setup_complete(&id, &c)
            }
            Event::SourceChanged { .. } => continue,
        };
        if outbound.send(envelope).is_err() {
            break;
        }
    }
}
