//! Reconciles a fresh fetch from the note source with what the store holds.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::source::NoteSnapshot;
use crate::store::VectorStore;
use crate::types::{CycleStats, NoteRecord};

/// Hash of the fields that feed the embedding.
pub fn content_hash(record: &NoteRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.title.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.plaintext.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.modify_time.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of one reconciliation pass. The five id sets are disjoint.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub new: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    pub in_trash: Vec<String>,
    /// Records that need a fresh embedding, in fetch order.
    pub to_embed: Vec<NoteRecord>,
    /// Stored rows whose trash flag must flip without re-embedding.
    pub trash_updates: Vec<(String, bool)>,
    /// Fetch-level problems (undecodable or malformed records, failed removals).
    pub errors: usize,
}

impl ChangeSet {
    pub fn stats(&self) -> CycleStats {
        CycleStats {
            new: self.new.len(),
            modified: self.modified.len(),
            unchanged: self.unchanged.len(),
            deleted: self.deleted.len(),
            in_trash: self.in_trash.len(),
            errors: self.errors,
        }
    }
}

pub struct ChangeTracker;

impl ChangeTracker {
    /// Classify `snapshot` against the store and apply deletions right away.
    /// Everything else is left for the pipeline.
    ///
    /// Rows the source could not decode count as errors and keep their stored
    /// copy. If some row's id could not be read at all, nothing is removed for
    /// having vanished upstream this cycle.
    pub fn reconcile(
        snapshot: NoteSnapshot,
        store: &VectorStore,
    ) -> Result<ChangeSet, StorageError> {
        let stored = store.index_state()?;
        let mut changes = ChangeSet {
            errors: snapshot.error_count(),
            ..ChangeSet::default()
        };
        let mut seen: HashSet<String> = HashSet::with_capacity(snapshot.notes.len());
        seen.extend(snapshot.skipped.iter().cloned());
        let mut removals: Vec<String> = Vec::new();

        for record in snapshot.notes {
            if record.id.trim().is_empty() {
                warn!("Skipping note without id");
                changes.errors += 1;
                continue;
            }
            if !seen.insert(record.id.clone()) {
                warn!(id = %record.id, "Skipping duplicate note id in fetch");
                changes.errors += 1;
                continue;
            }

            let existing = stored.get(&record.id);

            if record.is_deleted {
                if existing.is_some() {
                    removals.push(record.id.clone());
                }
                continue;
            }

            let hash = content_hash(&record);
            let content_changed = existing.map(|s| s.content_hash != hash).unwrap_or(true);

            if record.in_trash {
                debug!(id = %record.id, "note in trash");
                changes.in_trash.push(record.id.clone());
                match existing {
                    _ if content_changed => changes.to_embed.push(record),
                    Some(s) if !s.trashed => changes.trash_updates.push((record.id, true)),
                    _ => {}
                }
                continue;
            }

            match existing {
                None => {
                    changes.new.push(record.id.clone());
                    changes.to_embed.push(record);
                }
                Some(_) if content_changed => {
                    changes.modified.push(record.id.clone());
                    changes.to_embed.push(record);
                }
                Some(s) => {
                    if s.trashed {
                        changes.trash_updates.push((record.id.clone(), false));
                    }
                    changes.unchanged.push(record.id);
                }
            }
        }

        // Stored but gone upstream.
        if snapshot.unreadable > 0 {
            warn!(
                unreadable = snapshot.unreadable,
                "Source returned unreadable rows, keeping notes missing from this fetch"
            );
        } else {
            let mut vanished: Vec<String> = stored
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            vanished.sort();
            removals.extend(vanished);
        }

        for id in removals {
            match store.delete(&id) {
                Ok(_) => changes.deleted.push(id),
                Err(e) => {
                    warn!(id = %id, "Failed to remove deleted note: {e}");
                    changes.errors += 1;
                }
            }
        }

        for (id, trashed) in &changes.trash_updates {
            if let Err(e) = store.set_trashed(id, *trashed) {
                warn!(id = %id, "Failed to update trash flag: {e}");
                changes.errors += 1;
            }
        }

        let stats = changes.stats();
        info!(
            new = stats.new,
            modified = stats.modified,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            in_trash = stats.in_trash,
            errors = stats.errors,
            "change detection complete"
        );
        Ok(changes)
    }
}
