use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::metrics::record_backup_operation;
use crate::models::{PendingChange, PersistedBackup, SessionKey, SessionMetadata};
use crate::services::storage::KeyValueStore;
use crate::utils::time::now_millis;

/// Advisory on-device mirror of unsaved work for one session.
///
/// Every operation is best effort: failures are logged and swallowed so the
/// edit path never sees them.
#[derive(Clone)]
pub struct LocalBackupStore {
    storage: Arc<dyn KeyValueStore>,
    key: String,
}

impl LocalBackupStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, session: &SessionKey) -> Self {
        Self {
            storage,
            key: session.storage_key(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mirror<'a>(
        &self,
        changes: impl IntoIterator<Item = &'a PendingChange>,
        session_metadata: &SessionMetadata,
    ) {
        let backup = PersistedBackup {
            changes: changes
                .into_iter()
                .map(|change| (change.question_id.clone(), change.clone()))
                .collect::<IndexMap<_, _>>(),
            session_metadata: session_metadata.clone(),
            timestamp: now_millis(),
        };

        let payload = match serde_json::to_string(&backup) {
            Ok(payload) => payload,
            Err(e) => {
                record_backup_operation("mirror", false);
                warn!(key = %self.key, error = %e, "Failed to serialize autosave backup");
                return;
            }
        };

        match self.storage.set(&self.key, &payload) {
            Ok(()) => {
                record_backup_operation("mirror", true);
                debug!(key = %self.key, changes = backup.changes.len(), "Mirrored autosave backup");
            }
            Err(e) => {
                record_backup_operation("mirror", false);
                warn!(key = %self.key, error = %e, "Failed to write autosave backup");
            }
        }
    }

    /// Last mirrored backup, or `None` when absent, unreadable or corrupt.
    pub fn load(&self) -> Option<PersistedBackup> {
        let payload = match self.storage.get(&self.key) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                record_backup_operation("load", false);
                warn!(key = %self.key, error = %e, "Failed to read autosave backup");
                return None;
            }
        };

        match serde_json::from_str::<PersistedBackup>(&payload) {
            Ok(backup) => {
                record_backup_operation("load", true);
                Some(backup)
            }
            Err(e) => {
                record_backup_operation("load", false);
                warn!(key = %self.key, error = %e, "Ignoring corrupt autosave backup");
                None
            }
        }
    }

    pub fn clear(&self) {
        match self.storage.remove(&self.key) {
            Ok(()) => {
                record_backup_operation("clear", true);
                debug!(key = %self.key, "Cleared autosave backup");
            }
            Err(e) => {
                record_backup_operation("clear", false);
                warn!(key = %self.key, error = %e, "Failed to clear autosave backup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::change_buffer::ChangeBuffer;
    use crate::services::storage::MemoryStore;

    fn store() -> (Arc<MemoryStore>, LocalBackupStore) {
        let storage = Arc::new(MemoryStore::new());
        let backup = LocalBackupStore::new(storage.clone(), &SessionKey::new("exam", "user"));
        (storage, backup)
    }

    #[test]
    fn load_returns_what_was_mirrored() {
        let (_, backup) = store();
        let mut buffer = ChangeBuffer::new();
        buffer.put("q1", vec!["a1".to_string()], false);
        buffer.put("q2", vec!["b1".to_string()], true);
        let metadata = SessionMetadata {
            current_page: 3,
            total_answered: 2,
            flagged_count: 1,
        };

        backup.mirror(buffer.iter(), &metadata);

        let loaded = backup.load().unwrap();
        assert_eq!(loaded.session_metadata, metadata);
        let restored: Vec<_> = loaded.changes.values().cloned().collect();
        let expected: Vec<_> = buffer.iter().cloned().collect();
        assert_eq!(restored, expected);
    }

    #[test]
    fn load_is_idempotent() {
        let (_, backup) = store();
        let mut buffer = ChangeBuffer::new();
        buffer.put("q1", vec!["a1".to_string()], false);
        backup.mirror(buffer.iter(), &SessionMetadata::default());

        assert_eq!(backup.load(), backup.load());
    }

    #[test]
    fn corrupt_payload_is_treated_as_absent() {
        let (storage, backup) = store();
        storage.set(backup.key(), "{not json").unwrap();
        assert!(backup.load().is_none());
    }

    #[test]
    fn quota_failure_is_swallowed() {
        let (storage, backup) = store();
        storage.set_quota(Some(8));
        let mut buffer = ChangeBuffer::new();
        buffer.put("q1", vec!["a1".to_string()], false);

        backup.mirror(buffer.iter(), &SessionMetadata::default());
        assert!(backup.load().is_none());
    }

    #[test]
    fn sessions_with_similar_ids_do_not_share_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let stores: [Arc<dyn KeyValueStore>; 2] = [
            Arc::new(MemoryStore::new()),
            Arc::new(crate::services::storage::FileStore::new(dir.path()).unwrap()),
        ];
        let pairs = [
            (SessionKey::new("a_b", "c"), SessionKey::new("a", "b_c")),
            (SessionKey::new("exam.1", "u"), SessionKey::new("exam_1", "u")),
            (SessionKey::new("экзамен", "u"), SessionKey::new("история", "u")),
        ];

        for storage in stores {
            for (mirrored, other) in &pairs {
                let mut buffer = ChangeBuffer::new();
                buffer.put("q1", vec!["a1".to_string()], false);
                LocalBackupStore::new(storage.clone(), mirrored)
                    .mirror(buffer.iter(), &SessionMetadata::default());

                let other_backup = LocalBackupStore::new(storage.clone(), other);
                assert!(
                    other_backup.load().is_none(),
                    "{:?} restored the backup of {:?}",
                    other,
                    mirrored
                );
                assert!(LocalBackupStore::new(storage.clone(), mirrored)
                    .load()
                    .is_some());
            }
        }
    }

    #[test]
    fn clear_removes_the_record() {
        let (storage, backup) = store();
        backup.mirror(std::iter::empty(), &SessionMetadata::default());
        assert!(backup.load().is_some());

        backup.clear();
        assert!(backup.load().is_none());
        assert!(storage.is_empty());
    }
}
