use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rusqlite::{Connection, Row};
use tracing::warn;

use crate::error::FetchError;
use crate::types::NoteRecord;

/// One full read of the note source.
///
/// Rows that exist upstream but could not be decoded are reported instead of
/// dropped, so they are not mistaken for deletions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteSnapshot {
    pub notes: Vec<NoteRecord>,
    /// Ids of rows whose other columns could not be decoded.
    pub skipped: Vec<String>,
    /// Rows whose id itself could not be read.
    pub unreadable: usize,
}

impl NoteSnapshot {
    /// Every record that was seen but not decoded.
    pub fn error_count(&self) -> usize {
        self.skipped.len() + self.unreadable
    }
}

impl From<Vec<NoteRecord>> for NoteSnapshot {
    fn from(notes: Vec<NoteRecord>) -> Self {
        Self {
            notes,
            ..Self::default()
        }
    }
}

/// Where notes come from. Implementations are blocking; the coordinator runs
/// them on the blocking pool under a timeout.
pub trait NoteSource: Send + Sync {
    /// Full snapshot of the current notes.
    fn fetch_notes(&self) -> Result<NoteSnapshot, FetchError>;

    /// Cheap change probe used by the watcher. `None` means the source cannot tell.
    fn last_modified(&self) -> Result<Option<SystemTime>, FetchError> {
        Ok(None)
    }
}

/// Auto-detect the Joplin SQLite database path.
/// Returns None if not found; the caller should ask for an explicit path.
pub fn detect_joplin_db_path() -> Option<PathBuf> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config/joplin-desktop/database.sqlite");
            if path.exists() {
                return Some(path);
            }
            let path = home.join(".config/joplin/database.sqlite");
            if path.exists() {
                return Some(path);
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        // Standard Joplin Desktop install: %USERPROFILE%\.config\joplin-desktop\database.sqlite
        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config").join("joplin-desktop").join("database.sqlite");
            if path.exists() {
                return Some(path);
            }
        }
        // Fallback: older/portable Joplin: %APPDATA%\Joplin\database.sqlite
        if let Some(app_data) = dirs::config_dir() {
            let path = app_data.join("Joplin").join("database.sqlite");
            if path.exists() {
                return Some(path);
            }
        }
    }

    None
}

/// Reads notes straight out of a Joplin desktop database.
///
/// Joplin keeps trashed notes in the `notes` table with a non-zero
/// `deleted_time`; those are reported as `in_trash`. Notes removed from the
/// trash disappear from the table and are picked up as deletions.
pub struct JoplinSource {
    path: PathBuf,
}

impl JoplinSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the Joplin SQLite database in read-only mode.
    /// WAL must be set before query_only: journal_mode writes a flag, and query_only
    /// blocks all writes including pragma writes, so the order matters.
    fn open(&self) -> Result<Connection, FetchError> {
        if !self.path.exists() {
            return Err(FetchError::NotFound(self.path.clone()));
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA query_only = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }
}

fn decode_note(row: &Row<'_>, id: String) -> rusqlite::Result<NoteRecord> {
    let deleted_time: i64 = row.get::<_, Option<i64>>(5)?.unwrap_or(0);
    Ok(NoteRecord {
        uuid: id.clone(),
        id,
        title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        plaintext: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        html: String::new(),
        creation_time: row.get(3)?,
        modify_time: row.get(4)?,
        is_pinned: false,
        is_deleted: false,
        in_trash: deleted_time > 0,
    })
}

impl NoteSource for JoplinSource {
    fn fetch_notes(&self) -> Result<NoteSnapshot, FetchError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, body, created_time, updated_time, deleted_time
             FROM notes
             WHERE is_conflict = 0
               AND (trim(body) != '' OR trim(title) != '')
             ORDER BY updated_time DESC",
        )?;

        let mut snapshot = NoteSnapshot::default();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: String = match row.get(0) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping note row without a readable id: {e}");
                    snapshot.unreadable += 1;
                    continue;
                }
            };
            match decode_note(row, id.clone()) {
                Ok(note) => snapshot.notes.push(note),
                Err(e) => {
                    warn!(id = %id, "Skipping malformed note row: {e}");
                    snapshot.skipped.push(id);
                }
            }
        }

        Ok(snapshot)
    }

    /// Joplin uses SQLite WAL mode: writes go to database.sqlite-wal first
    /// and the main file's mtime only changes after a WAL checkpoint, so both count.
    fn last_modified(&self) -> Result<Option<SystemTime>, FetchError> {
        let mtime_main = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|_| FetchError::NotFound(self.path.clone()))?;
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        let mtime_wal = std::fs::metadata(&wal).and_then(|m| m.modified()).ok();
        Ok(Some(match mtime_wal {
            Some(w) => mtime_main.max(w),
            None => mtime_main,
        }))
    }
}
