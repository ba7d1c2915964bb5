//! Save scheduling state machine.
//!
//! All buffer and scheduling state is owned by a single task. Timers and
//! network calls run in spawned tasks that report back through the same
//! command channel, tagged with a timer generation or an attempt id so that
//! stale events are recognised and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AutosaveSettings;
use crate::metrics::{record_attempt, AUTOSAVE_PENDING_CHANGES, AUTOSAVE_SEND_DURATION_SECONDS};
use crate::models::{
    AutosaveSnapshot, PendingChange, SaveAttempt, SaveConfirmation, SaveStatus, SessionKey,
    SessionMetadata, SessionMetadataUpdate,
};
use crate::services::autosave_controller::AutosaveError;
use crate::services::backup_store::LocalBackupStore;
use crate::services::change_buffer::ChangeBuffer;
use crate::services::save_gateway::{GatewayError, SaveGateway};

pub(crate) type SaveWaiter = oneshot::Sender<Result<(), AutosaveError>>;

pub(crate) enum Command {
    AddChange {
        question_id: String,
        selected_answers: Vec<String>,
        is_flagged: bool,
    },
    UpdateSession(SessionMetadataUpdate),
    ForceSave {
        reply: SaveWaiter,
    },
    Retry,
    PendingChanges {
        reply: oneshot::Sender<Vec<PendingChange>>,
    },
    SessionMetadata {
        reply: oneshot::Sender<SessionMetadata>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
    SendFinished {
        attempt_id: u64,
        attempt_number: u32,
        elapsed: Duration,
        result: Result<SaveConfirmation, GatewayError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Debounce,
    Retry,
    SuccessDisplay,
}

/// Delayed task with an explicit handle and a generation counter.
///
/// Rescheduling or cancelling bumps the generation, so a firing that was
/// already queued before the change is ignored.
struct Timer {
    kind: TimerKind,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            handle: None,
        }
    }

    fn schedule(&mut self, delay: Duration, commands: &mpsc::WeakUnboundedSender<Command>) {
        self.cancel();
        let Some(tx) = commands.upgrade() else {
            return;
        };

        let kind = self.kind;
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::TimerFired { kind, generation });
        }));
    }

    fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True when `generation` is the live schedule; consumes it.
    fn fired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }
}

enum CyclePhase {
    Ready,
    InFlight(JoinHandle<()>),
    AwaitingRetry,
    Stalled,
}

/// One logical save: a frozen attempt plus everyone waiting on its outcome.
struct SaveCycle {
    attempt: SaveAttempt,
    phase: CyclePhase,
    forced: bool,
    waiters: Vec<SaveWaiter>,
}

pub(crate) struct SyncScheduler {
    settings: AutosaveSettings,
    session: SessionKey,
    gateway: Arc<dyn SaveGateway>,
    backup: LocalBackupStore,
    buffer: ChangeBuffer,
    metadata: SessionMetadata,
    status: SaveStatus,
    last_error: Option<String>,
    last_saved_at: Option<chrono::DateTime<Utc>>,
    cycle: Option<SaveCycle>,
    next_attempt_id: u64,
    debounce: Timer,
    retry_timer: Timer,
    display_timer: Timer,
    commands: mpsc::WeakUnboundedSender<Command>,
    state: watch::Sender<AutosaveSnapshot>,
}

impl SyncScheduler {
    pub(crate) fn new(
        settings: AutosaveSettings,
        session: SessionKey,
        gateway: Arc<dyn SaveGateway>,
        backup: LocalBackupStore,
        commands: mpsc::WeakUnboundedSender<Command>,
        state: watch::Sender<AutosaveSnapshot>,
    ) -> Self {
        Self {
            settings,
            session,
            gateway,
            backup,
            buffer: ChangeBuffer::new(),
            metadata: SessionMetadata::default(),
            status: SaveStatus::Idle,
            last_error: None,
            last_saved_at: None,
            cycle: None,
            next_attempt_id: 0,
            debounce: Timer::new(TimerKind::Debounce),
            retry_timer: Timer::new(TimerKind::Retry),
            display_timer: Timer::new(TimerKind::SuccessDisplay),
            commands,
            state,
        }
    }

    /// Restores unsaved work left behind by a previous run and schedules it.
    pub(crate) fn recover(&mut self) -> usize {
        let Some(backup) = self.backup.load() else {
            self.publish();
            return 0;
        };

        let restored = backup.changes.len();
        self.buffer.restore_all(backup.changes.into_values());
        self.metadata = backup.session_metadata;

        if restored > 0 {
            info!(
                key = %self.backup.key(),
                restored,
                "Recovered unsaved changes from local backup"
            );
            self.status = SaveStatus::Pending;
            self.schedule_debounce();
        }
        self.publish();
        restored
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        self.stop();
    }

    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::AddChange {
                question_id,
                selected_answers,
                is_flagged,
            } => self.add_change(question_id, selected_answers, is_flagged),
            Command::UpdateSession(update) => self.update_session(update),
            Command::ForceSave { reply } => self.force_save(reply).await,
            Command::Retry => self.retry(),
            Command::PendingChanges { reply } => {
                let _ = reply.send(self.unsaved_changes());
            }
            Command::SessionMetadata { reply } => {
                let _ = reply.send(self.metadata.clone());
            }
            Command::TimerFired { kind, generation } => self.timer_fired(kind, generation),
            Command::SendFinished {
                attempt_id,
                attempt_number,
                elapsed,
                result,
            } => self.send_finished(attempt_id, attempt_number, elapsed, result),
            Command::Shutdown { reply } => {
                self.stop();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn add_change(&mut self, question_id: String, selected_answers: Vec<String>, is_flagged: bool) {
        let change = self.buffer.put(question_id, selected_answers, is_flagged);
        debug!(
            question_id = %change.question_id,
            answers = change.selected_answers.len(),
            flagged = change.is_flagged,
            "Buffered change"
        );

        self.mirror_unsaved();
        match self.status {
            SaveStatus::Error => debug!("Autosave paused after failures, change kept locally"),
            SaveStatus::Saving => {}
            _ => self.status = SaveStatus::Pending,
        }
        self.schedule_debounce();
        self.publish();
    }

    fn update_session(&mut self, update: SessionMetadataUpdate) {
        self.metadata.apply(&update);
        if self.has_unsaved() {
            self.mirror_unsaved();
        }
        self.schedule_debounce();
        self.publish();
    }

    async fn force_save(&mut self, reply: SaveWaiter) {
        if !self.has_unsaved() {
            debug!("Force save requested with nothing to save");
            let _ = reply.send(Ok(()));
            return;
        }

        let (carried, mut waiters) = match self.cycle.take() {
            Some(cycle) => self.release_cycle(cycle).await,
            None => (Vec::new(), Vec::new()),
        };
        waiters.push(reply);

        info!("Force save requested");
        self.last_error = None;
        self.begin_cycle(carried, waiters, true);
    }

    fn retry(&mut self) {
        if self.status != SaveStatus::Error {
            debug!(status = %self.status, "Retry requested outside of error state, ignoring");
            return;
        }

        self.last_error = None;
        let (carried, waiters) = match self.cycle.take() {
            Some(cycle) => (cycle.attempt.changes, cycle.waiters),
            None => (Vec::new(), Vec::new()),
        };

        if carried.is_empty() && self.buffer.is_empty() {
            self.status = SaveStatus::Idle;
            self.publish();
            return;
        }

        info!("Manual retry requested");
        self.status = SaveStatus::Pending;
        self.begin_cycle(carried, waiters, false);
    }

    fn timer_fired(&mut self, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::Debounce => {
                if !self.debounce.fired(generation) {
                    return;
                }
                if self.cycle.is_some() {
                    debug!("Debounce elapsed while a save is outstanding, deferring");
                    return;
                }
                if self.buffer.is_empty() {
                    if self.status == SaveStatus::Pending {
                        self.status = SaveStatus::Idle;
                        self.publish();
                    }
                    return;
                }
                self.begin_cycle(Vec::new(), Vec::new(), false);
            }
            TimerKind::Retry => {
                if !self.retry_timer.fired(generation) {
                    return;
                }
                let awaiting = matches!(
                    self.cycle.as_ref().map(|cycle| &cycle.phase),
                    Some(CyclePhase::AwaitingRetry)
                );
                if awaiting {
                    self.dispatch();
                }
            }
            TimerKind::SuccessDisplay => {
                if !self.display_timer.fired(generation) {
                    return;
                }
                if self.status == SaveStatus::Success {
                    self.status = SaveStatus::Idle;
                    self.publish();
                }
            }
        }
    }

    /// Cancels whatever the cycle is doing and hands back its changes and
    /// waiters. A superseded attempt is not a failure.
    async fn release_cycle(&mut self, cycle: SaveCycle) -> (Vec<PendingChange>, Vec<SaveWaiter>) {
        self.retry_timer.cancel();
        if let CyclePhase::InFlight(handle) = cycle.phase {
            handle.abort();
            // the aborted call must be gone before another one starts
            let _ = handle.await;
            record_attempt("cancelled");
            debug!(attempt_id = cycle.attempt.id, "Superseded in-flight autosave attempt");
        }
        (cycle.attempt.changes, cycle.waiters)
    }

    /// Freezes `carried` plus the live buffer into a new attempt and sends it.
    fn begin_cycle(&mut self, carried: Vec<PendingChange>, waiters: Vec<SaveWaiter>, forced: bool) {
        self.debounce.cancel();
        self.display_timer.cancel();

        let changes = merge_unsaved(carried, self.buffer.snapshot_and_clear());

        self.next_attempt_id += 1;
        self.cycle = Some(SaveCycle {
            attempt: SaveAttempt {
                id: self.next_attempt_id,
                changes,
                session_metadata: self.metadata.clone(),
                attempt_number: 0,
            },
            phase: CyclePhase::Ready,
            forced,
            waiters,
        });
        self.dispatch();
    }

    fn dispatch(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        let Some(tx) = self.commands.upgrade() else {
            warn!("Autosave controller is gone, not sending");
            return;
        };

        let request = cycle.attempt.to_request(&self.session);
        let gateway = Arc::clone(&self.gateway);
        let timeout = self.settings.request_timeout;
        let attempt_id = cycle.attempt.id;
        let attempt_number = cycle.attempt.attempt_number;

        info!(
            attempt_id,
            attempt = attempt_number + 1,
            changes = request.changes.len(),
            "Sending autosave batch"
        );

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, gateway.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(timeout)),
            };
            let _ = tx.send(Command::SendFinished {
                attempt_id,
                attempt_number,
                elapsed: started.elapsed(),
                result,
            });
        });

        cycle.phase = CyclePhase::InFlight(handle);
        self.status = SaveStatus::Saving;
        self.publish();
    }

    fn send_finished(
        &mut self,
        attempt_id: u64,
        attempt_number: u32,
        elapsed: Duration,
        result: Result<SaveConfirmation, GatewayError>,
    ) {
        let current = matches!(
            &self.cycle,
            Some(cycle) if cycle.attempt.id == attempt_id
                && cycle.attempt.attempt_number == attempt_number
                && matches!(cycle.phase, CyclePhase::InFlight(_))
        );
        if !current {
            debug!(attempt_id, "Ignoring result of a superseded autosave attempt");
            return;
        }

        AUTOSAVE_SEND_DURATION_SECONDS.observe(elapsed.as_secs_f64());
        match result {
            Ok(confirmation) => self.on_success(confirmation),
            Err(error) => self.on_failure(error),
        }
    }

    fn on_success(&mut self, confirmation: SaveConfirmation) {
        let Some(cycle) = self.cycle.take() else {
            return;
        };

        record_attempt("success");
        self.last_error = None;
        self.last_saved_at = Some(Utc::now());
        info!(
            attempt_id = cycle.attempt.id,
            attempt = cycle.attempt.attempt_number + 1,
            saved = confirmation.saved,
            "Autosave confirmed"
        );

        for waiter in cycle.waiters {
            let _ = waiter.send(Ok(()));
        }

        if self.buffer.is_empty() {
            self.backup.clear();
            self.status = SaveStatus::Success;
            self.display_timer
                .schedule(self.settings.success_display, &self.commands);
        } else {
            // edits made while the batch was in flight start the next cycle
            self.mirror_unsaved();
            self.status = SaveStatus::Pending;
            self.schedule_debounce();
        }
        self.publish();
    }

    fn on_failure(&mut self, error: GatewayError) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };

        record_attempt("failure");
        cycle.attempt.attempt_number += 1;
        let failures = cycle.attempt.attempt_number;

        if !cycle.forced && self.settings.retry.should_retry(failures) {
            let delay = self.settings.retry.backoff_for(failures);
            warn!(
                attempt_id = cycle.attempt.id,
                failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Autosave attempt failed, retrying"
            );
            cycle.phase = CyclePhase::AwaitingRetry;
            self.status = SaveStatus::Pending;
            self.retry_timer.schedule(delay, &self.commands);
        } else {
            warn!(
                attempt_id = cycle.attempt.id,
                failures,
                error = %error,
                "Autosave failed, waiting for manual retry"
            );
            cycle.phase = CyclePhase::Stalled;
            for waiter in cycle.waiters.drain(..) {
                let _ = waiter.send(Err(AutosaveError::Gateway(error.clone())));
            }
            self.status = SaveStatus::Error;
            self.last_error = Some(error.to_string());
        }
        self.publish();
    }

    fn schedule_debounce(&mut self) {
        if self.status == SaveStatus::Error || self.cycle.is_some() || self.buffer.is_empty() {
            return;
        }
        self.debounce.schedule(self.settings.debounce, &self.commands);
    }

    fn has_unsaved(&self) -> bool {
        self.cycle.is_some() || !self.buffer.is_empty()
    }

    /// Frozen attempt changes overlaid with newer buffered edits.
    fn unsaved_changes(&self) -> Vec<PendingChange> {
        let frozen = match &self.cycle {
            Some(cycle) => cycle.attempt.changes.clone(),
            None => Vec::new(),
        };
        merge_unsaved(frozen, self.buffer.iter().cloned())
    }

    fn mirror_unsaved(&self) {
        let changes = self.unsaved_changes();
        if changes.is_empty() {
            self.backup.clear();
        } else {
            self.backup.mirror(&changes, &self.metadata);
        }
    }

    fn publish(&self) {
        let pending_count = match &self.cycle {
            None => self.buffer.len(),
            Some(_) => self.unsaved_changes().len(),
        };
        AUTOSAVE_PENDING_CHANGES.set(pending_count as i64);

        self.state.send_replace(AutosaveSnapshot {
            status: self.status,
            last_error: self.last_error.clone(),
            last_saved_at: self.last_saved_at,
            pending_count,
            has_unsaved_changes: pending_count > 0,
        });
    }

    fn stop(&mut self) {
        self.debounce.cancel();
        self.retry_timer.cancel();
        self.display_timer.cancel();
        if let Some(SaveCycle {
            phase: CyclePhase::InFlight(handle),
            ..
        }) = &self.cycle
        {
            handle.abort();
        }
        debug!("Autosave scheduler stopped");
    }
}

/// Frozen attempt changes with buffered edits laid over them. Buffered edits
/// were made after the attempt was frozen, so they win whatever their
/// timestamps say.
fn merge_unsaved(
    frozen: Vec<PendingChange>,
    buffered: impl IntoIterator<Item = PendingChange>,
) -> Vec<PendingChange> {
    let mut merged = ChangeBuffer::new();
    merged.overlay_all(frozen);
    merged.overlay_all(buffered);
    merged.snapshot_and_clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn change(question_id: &str, answer: &str, timestamp: chrono::DateTime<Utc>) -> PendingChange {
        PendingChange {
            question_id: question_id.to_string(),
            selected_answers: vec![answer.to_string()],
            is_flagged: false,
            timestamp,
        }
    }

    #[test]
    fn buffered_edit_wins_even_when_clock_stepped_back() {
        let frozen_at = Utc::now();
        let stepped_back = frozen_at - ChronoDuration::minutes(10);

        let merged = merge_unsaved(
            vec![change("q1", "frozen", frozen_at), change("q2", "kept", frozen_at)],
            vec![change("q1", "edited", stepped_back), change("q3", "new", stepped_back)],
        );

        let answers: Vec<_> = merged
            .iter()
            .map(|c| (c.question_id.as_str(), c.selected_answers[0].as_str()))
            .collect();
        assert_eq!(answers, [("q1", "edited"), ("q2", "kept"), ("q3", "new")]);
    }
}
