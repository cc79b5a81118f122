use serde::{Deserialize, Serialize};

/// A note as produced by the note source on every fetch. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub id: String,
    pub uuid: String,
    pub title: String,
    pub plaintext: String,
    pub html: String,
    pub creation_time: i64, // Unix timestamp in ms
    pub modify_time: i64,   // Unix timestamp in ms
    pub is_pinned: bool,
    /// Permanently deleted upstream; the row must go.
    pub is_deleted: bool,
    /// Sitting in the source's trash. The note still exists and can be restored.
    #[serde(default)]
    pub in_trash: bool,
}

impl NoteRecord {
    /// Text handed to the embedding model.
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.plaintext)
    }
}

/// A row of the vector store: display fields, the embedding and the hash of its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedNote {
    pub id: String,
    pub uuid: String,
    pub title: String,
    pub plaintext: String,
    pub html: String,
    pub creation_time: i64,
    pub modify_time: i64,
    pub is_pinned: bool,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub indexed_at: i64,
    pub trashed: bool,
}

impl IndexedNote {
    pub fn from_record(
        record: &NoteRecord,
        embedding: Vec<f32>,
        content_hash: String,
        indexed_at: i64,
    ) -> Self {
        Self {
            id: record.id.clone(),
            uuid: record.uuid.clone(),
            title: record.title.clone(),
            plaintext: record.plaintext.clone(),
            html: record.html.clone(),
            creation_time: record.creation_time,
            modify_time: record.modify_time,
            is_pinned: record.is_pinned,
            embedding,
            content_hash,
            indexed_at,
            trashed: record.in_trash,
        }
    }
}

/// What the change tracker needs to know about a stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub content_hash: String,
    pub trashed: bool,
}

/// A search hit: the stored note projected for display, plus its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub uuid: String,
    pub title: String,
    pub plaintext: String,
    pub html: String,
    pub creation_time: i64,
    pub modify_time: i64,
    pub is_pinned: bool,
    pub similarity_score: f32,
}

impl SearchResult {
    pub fn from_scored(note: IndexedNote, score: f32) -> Self {
        Self {
            id: note.id,
            uuid: note.uuid,
            title: note.title,
            plaintext: note.plaintext,
            html: note.html,
            creation_time: note.creation_time,
            modify_time: note.modify_time,
            is_pinned: note.is_pinned,
            similarity_score: score,
        }
    }
}

/// Stage of an indexing cycle. `Idle` means no cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Initializing,
    Parsing,
    Processing,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

/// Finer-grained status reported inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    // initializing
    Starting,
    CheckingServices,
    ServicesReady,
    // parsing
    ReadingDatabase,
    DatabaseRead,
    // processing
    PreparingNotes,
    ProcessingNotes,
    CleaningUp,
    // terminal
    Completed,
    Failed,
}

/// Per-cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStats {
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub in_trash: usize,
    pub errors: usize,
}

/// Where the pipeline currently is within the processing stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingProgress {
    pub current_note: Option<String>,
    pub processed_notes: usize,
    pub total_notes: usize,
}

/// Point-in-time view of the current (or last) indexing cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSnapshot {
    pub stage: Stage,
    pub stats: CycleStats,
    pub processing: Option<ProcessingProgress>,
    pub error: Option<String>,
}

impl Default for CycleSnapshot {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            stats: CycleStats::default(),
            processing: None,
            error: None,
        }
    }
}

/// Index health reported to status checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub has_completed_index: bool,
    pub indexed_notes: usize,
    pub last_completed_at: Option<i64>, // Unix timestamp in ms
}
