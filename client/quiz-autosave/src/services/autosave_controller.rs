use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AutosaveSettings, Config};
use crate::models::{
    AutosaveSnapshot, PendingChange, SaveStatus, SessionKey, SessionMetadata,
    SessionMetadataUpdate,
};
use crate::services::backup_store::LocalBackupStore;
use crate::services::save_gateway::{build_gateway, GatewayError, SaveGateway};
use crate::services::storage::{FileStore, KeyValueStore};
use crate::services::sync_scheduler::{Command, SyncScheduler};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AutosaveError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("autosave worker is not running")]
    Stopped,
    #[error("flush did not complete within {0:?}")]
    FlushTimeout(Duration),
}

/// Public entry point of the autosave pipeline for one quiz session.
///
/// Edits and commands are queued to a single scheduler task, so they are
/// applied in call order. Status accessors read the last published snapshot,
/// which trails queued commands until the scheduler has processed them.
pub struct AutosaveController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<AutosaveSnapshot>,
    session: SessionKey,
    flush_timeout: Duration,
    worker: JoinHandle<()>,
}

impl AutosaveController {
    /// Recovers any local backup for `session` and starts the scheduler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        settings: AutosaveSettings,
        session: SessionKey,
        gateway: Arc<dyn SaveGateway>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(AutosaveSnapshot::default());
        let flush_timeout = settings.flush_timeout;
        let backup = LocalBackupStore::new(storage, &session);

        let mut scheduler = SyncScheduler::new(
            settings,
            session.clone(),
            gateway,
            backup,
            commands.downgrade(),
            state_tx,
        );
        let recovered = scheduler.recover();
        let worker = tokio::spawn(scheduler.run(receiver));

        info!(
            exam_id = %session.exam_id,
            user_id = %session.user_id,
            recovered,
            "Autosave controller started"
        );

        Self {
            commands,
            state,
            session,
            flush_timeout,
            worker,
        }
    }

    /// Builds the configured gateway and file-backed backup store.
    pub fn from_config(config: &Config, session: SessionKey) -> anyhow::Result<Self> {
        let gateway = build_gateway(&config.gateway, config.autosave.request_timeout)?;
        let storage = FileStore::new(config.backup.dir.clone()).with_context(|| {
            format!(
                "Failed to open backup directory {}",
                config.backup.dir.display()
            )
        })?;

        Ok(Self::start(
            config.autosave.clone(),
            session,
            gateway,
            Arc::new(storage),
        ))
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn add_change(
        &self,
        question_id: impl Into<String>,
        selected_answers: Vec<String>,
        is_flagged: bool,
    ) {
        let command = Command::AddChange {
            question_id: question_id.into(),
            selected_answers,
            is_flagged,
        };
        if self.send(command).is_err() {
            warn!("Autosave worker stopped, change dropped");
        }
    }

    pub fn update_session(&self, update: SessionMetadataUpdate) {
        if self.send(Command::UpdateSession(update)).is_err() {
            warn!("Autosave worker stopped, session update dropped");
        }
    }

    /// Saves everything unsaved right now, skipping the debounce.
    ///
    /// Resolves `Ok` only once the server confirmed the batch. With nothing
    /// to save it resolves immediately without a network call.
    pub async fn force_save(&self) -> Result<(), AutosaveError> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::ForceSave { reply })?;
        outcome.await.map_err(|_| AutosaveError::Stopped)?
    }

    /// Leaves the error state and immediately resends the stalled batch.
    pub fn retry(&self) {
        if self.send(Command::Retry).is_err() {
            warn!("Autosave worker stopped, retry ignored");
        }
    }

    /// Best-effort flush for hosts about to terminate. Returns whether all
    /// unsaved work was confirmed within `timeout`.
    pub async fn flush_now(&self, timeout: Duration) -> bool {
        let result = match tokio::time::timeout(timeout, self.force_save()).await {
            Ok(result) => result,
            Err(_) => Err(AutosaveError::FlushTimeout(timeout)),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Flush before shutdown did not complete");
                false
            }
        }
    }

    /// Flushes with the configured timeout and stops the scheduler.
    /// Unsaved work stays in the local backup for the next start.
    pub async fn shutdown(self) -> bool {
        let saved = self.flush_now(self.flush_timeout).await;

        let (reply, stopped) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = stopped.await;
        }
        let _ = self.worker.await;

        info!(saved, "Autosave controller stopped");
        saved
    }

    pub async fn pending_changes(&self) -> Result<Vec<PendingChange>, AutosaveError> {
        let (reply, changes) = oneshot::channel();
        self.send(Command::PendingChanges { reply })?;
        changes.await.map_err(|_| AutosaveError::Stopped)
    }

    pub async fn session_metadata(&self) -> Result<SessionMetadata, AutosaveError> {
        let (reply, metadata) = oneshot::channel();
        self.send(Command::SessionMetadata { reply })?;
        metadata.await.map_err(|_| AutosaveError::Stopped)
    }

    pub fn status(&self) -> SaveStatus {
        self.state.borrow().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.borrow().last_error.clone()
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().last_saved_at
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending_count
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.state.borrow().has_unsaved_changes
    }

    pub fn snapshot(&self) -> AutosaveSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified after every status change.
    pub fn subscribe(&self) -> watch::Receiver<AutosaveSnapshot> {
        self.state.clone()
    }

    fn send(&self, command: Command) -> Result<(), AutosaveError> {
        self.commands
            .send(command)
            .map_err(|_| AutosaveError::Stopped)
    }
}
