use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;

use crate::models::{AutosaveRequest, PendingChange, SessionKey, SessionMetadata};

/// Number of most recent requests kept for inspection.
pub const REQUEST_LOG_CAPACITY: usize = 256;

/// State behind the development autosave endpoint.
///
/// Keeps the most recent requests it received plus a per-session,
/// last-write-wins view of the saved answers, and can be told to fail or
/// stall upcoming requests.
#[derive(Debug, Default)]
pub struct DevServerState {
    auth_token: Option<String>,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    requests: Mutex<VecDeque<AutosaveRequest>>,
    answers: Mutex<HashMap<SessionKey, SavedSession>>,
}

#[derive(Debug, Default, Clone)]
struct SavedSession {
    changes: IndexMap<String, PendingChange>,
    metadata: SessionMetadata,
}

impl DevServerState {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            auth_token: auth_token.filter(|t| !t.is_empty()),
            ..Self::default()
        }
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Makes the next `count` save requests fail with 503.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
    }

    pub(crate) fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Applies a batch; older edits never overwrite newer saved ones.
    pub fn record(&self, request: AutosaveRequest) -> u32 {
        let key = SessionKey::new(request.exam_quiz_id.clone(), request.user_id.clone());
        let mut saved = 0;
        {
            let mut answers = lock(&self.answers);
            let session = answers.entry(key).or_default();
            for change in &request.changes {
                let newer = session
                    .changes
                    .get(&change.question_id)
                    .map(|existing| existing.timestamp <= change.timestamp)
                    .unwrap_or(true);
                if newer {
                    session
                        .changes
                        .insert(change.question_id.clone(), change.clone());
                }
                saved += 1;
            }
            session.metadata = request.session_data.clone();
        }
        let mut requests = lock(&self.requests);
        if requests.len() == REQUEST_LOG_CAPACITY {
            requests.pop_front();
        }
        requests.push_back(request);
        saved
    }

    pub fn requests(&self) -> Vec<AutosaveRequest> {
        lock(&self.requests).iter().cloned().collect()
    }

    pub fn saved_answers(&self, session: &SessionKey) -> Vec<PendingChange> {
        lock(&self.answers)
            .get(session)
            .map(|s| s.changes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn saved_metadata(&self, session: &SessionKey) -> Option<SessionMetadata> {
        lock(&self.answers).get(session).map(|s| s.metadata.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn change(question_id: &str, answer: &str, age_secs: i64) -> PendingChange {
        PendingChange {
            question_id: question_id.to_string(),
            selected_answers: vec![answer.to_string()],
            is_flagged: false,
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    fn request(changes: Vec<PendingChange>) -> AutosaveRequest {
        AutosaveRequest {
            exam_quiz_id: "exam".to_string(),
            user_id: "user".to_string(),
            changes,
            session_data: SessionMetadata::default(),
        }
    }

    #[test]
    fn stale_changes_do_not_overwrite_newer_ones() {
        let state = DevServerState::new(None);
        state.record(request(vec![change("q1", "new", 0)]));
        state.record(request(vec![change("q1", "old", 60)]));

        let saved = state.saved_answers(&SessionKey::new("exam", "user"));
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].selected_answers, vec!["new".to_string()]);
        assert_eq!(state.requests().len(), 2);
    }

    #[test]
    fn request_log_keeps_only_the_latest_requests() {
        let state = DevServerState::new(None);
        for i in 0..REQUEST_LOG_CAPACITY + 5 {
            state.record(request(vec![change(&format!("q{}", i), "a", 0)]));
        }

        let requests = state.requests();
        assert_eq!(requests.len(), REQUEST_LOG_CAPACITY);
        assert_eq!(requests[0].changes[0].question_id, "q5");
        assert_eq!(
            state.saved_answers(&SessionKey::new("exam", "user")).len(),
            REQUEST_LOG_CAPACITY + 5
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let state = DevServerState::new(None);
        state.fail_next(2);
        assert!(state.take_injected_failure());
        assert!(state.take_injected_failure());
        assert!(!state.take_injected_failure());
    }
}
