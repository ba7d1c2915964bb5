use indexmap::{map::Entry, IndexMap};

use crate::models::PendingChange;
use crate::utils::time::now_millis;

/// Ordered, last-write-wins map of unsaved edits keyed by question.
///
/// Order is the order of the first edit to each question; replacing an edit
/// keeps its position.
#[derive(Debug, Clone, Default)]
pub struct ChangeBuffer {
    changes: IndexMap<String, PendingChange>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the edit for `question_id`, stamped with the
    /// current time. Timestamps never go backwards for a question.
    pub fn put(
        &mut self,
        question_id: impl Into<String>,
        selected_answers: Vec<String>,
        is_flagged: bool,
    ) -> &PendingChange {
        let question_id = question_id.into();
        let now = now_millis();

        match self.changes.entry(question_id) {
            Entry::Occupied(mut entry) => {
                let change = entry.get_mut();
                change.selected_answers = selected_answers;
                change.is_flagged = is_flagged;
                change.timestamp = change.timestamp.max(now);
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                let question_id = entry.key().clone();
                entry.insert(PendingChange {
                    question_id,
                    selected_answers,
                    is_flagged,
                    timestamp: now,
                })
            }
        }
    }

    /// Re-inserts an existing change keeping its timestamp. An entry that is
    /// strictly newer than `change` is kept.
    pub fn restore(&mut self, change: PendingChange) {
        match self.changes.entry(change.question_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().timestamp <= change.timestamp {
                    entry.insert(change);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(change);
            }
        }
    }

    pub fn restore_all(&mut self, changes: impl IntoIterator<Item = PendingChange>) {
        for change in changes {
            self.restore(change);
        }
    }

    /// Inserts `changes` over whatever is stored, ignoring timestamps. Used
    /// for edits known to be later than the stored ones.
    pub fn overlay_all(&mut self, changes: impl IntoIterator<Item = PendingChange>) {
        for change in changes {
            self.changes.insert(change.question_id.clone(), change);
        }
    }

    /// Takes every pending change in order and leaves the buffer empty.
    pub fn snapshot_and_clear(&mut self) -> Vec<PendingChange> {
        std::mem::take(&mut self.changes).into_values().collect()
    }

    pub fn get(&self, question_id: &str) -> Option<&PendingChange> {
        self.changes.get(question_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingChange> {
        self.changes.values()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
