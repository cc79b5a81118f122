#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notes_smart_index::bus::Event;
use notes_smart_index::config::EngineConfig;
use notes_smart_index::embeddings::{normalize, Embedder};
use notes_smart_index::error::{EmbeddingError, FetchError};
use notes_smart_index::source::{NoteSnapshot, NoteSource};
use notes_smart_index::types::NoteRecord;
use notes_smart_index::Engine;
use tokio::sync::mpsc::UnboundedReceiver;

pub const DIMS: usize = 16;

/// Note source whose snapshot the test controls.
#[derive(Default)]
pub struct FakeSource {
    notes: Mutex<Vec<NoteRecord>>,
    skipped: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn with_notes(notes: Vec<NoteRecord>) -> Arc<Self> {
        Arc::new(Self {
            notes: Mutex::new(notes),
            ..Self::default()
        })
    }

    /// Report `id` as a row that could not be decoded, and leave it out of the notes.
    pub fn break_row(&self, id: &str) {
        self.notes.lock().unwrap().retain(|n| n.id != id);
        self.skipped.lock().unwrap().push(id.to_string());
    }

    pub fn set_notes(&self, notes: Vec<NoteRecord>) {
        *self.notes.lock().unwrap() = notes;
    }

    pub fn update(&self, f: impl FnOnce(&mut Vec<NoteRecord>)) {
        f(&mut self.notes.lock().unwrap());
    }
}

impl NoteSource for FakeSource {
    fn fetch_notes(&self) -> Result<NoteSnapshot, FetchError> {
        Ok(NoteSnapshot {
            notes: self.notes.lock().unwrap().clone(),
            skipped: self.skipped.lock().unwrap().clone(),
            unreadable: 0,
        })
    }
}

/// Bag-of-words embedder: each word lands in a bucket picked by its bytes.
/// Texts containing any word in `fail_on` are refused. Texts containing a
/// word in `slow_on` block the calling thread for the given delay first.
#[derive(Default)]
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    fail_on: Mutex<HashSet<String>>,
    slow_on: Mutex<Option<(String, Duration)>>,
}

impl FakeEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, word: &str) {
        self.fail_on.lock().unwrap().insert(word.to_string());
    }

    pub fn slow_on(&self, word: &str, delay: Duration) {
        *self.slow_on.lock().unwrap() = Some((word.to_string(), delay));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for FakeEmbedder {
    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let slow = self.slow_on.lock().unwrap().clone();
        if let Some((word, delay)) = slow {
            if text.split_whitespace().any(|w| w.eq_ignore_ascii_case(&word)) {
                std::thread::sleep(delay);
            }
        }
        let fail_on = self.fail_on.lock().unwrap();
        let mut v = vec![0.0; DIMS];
        for word in text.split_whitespace().map(str::to_lowercase) {
            if fail_on.contains(&word) {
                return Err(EmbeddingError::Model(format!("refused {word}")));
            }
            let bucket = word.bytes().map(usize::from).sum::<usize>() % DIMS;
            v[bucket] += 1.0;
        }
        Ok(normalize(v))
    }
}

pub fn note(id: &str, title: &str, body: &str, modify_time: i64) -> NoteRecord {
    NoteRecord {
        id: id.to_string(),
        uuid: format!("uuid-{id}"),
        title: title.to_string(),
        plaintext: body.to_string(),
        html: format!("<p>{body}</p>"),
        creation_time: 1_700_000_000_000,
        modify_time,
        is_pinned: false,
        is_deleted: false,
        in_trash: false,
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store_path = dir.path().join("index.sqlite");
    config.model_cache_dir = dir.path().join("models");
    config.indexing.batch_size = 2;
    config.indexing.workers = 3;
    config
}

pub fn engine(
    dir: &tempfile::TempDir,
    source: &Arc<FakeSource>,
    embedder: &Arc<FakeEmbedder>,
) -> Engine {
    Engine::new(test_config(dir), source.clone(), embedder.clone()).unwrap()
}

/// Everything already queued on `rx`.
pub fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
