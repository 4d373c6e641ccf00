use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use image_archiver_core::{RunState, TriggerSource};
use image_archiver_storage::RunLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::walker::{HistoryWalker, WalkSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(WalkSummary),
    SkippedBusy,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

/// Owns the run state machine: acquire the lock, walk, always release.
pub struct RunOrchestrator {
    lock: Arc<dyn RunLock>,
    walker: Arc<HistoryWalker>,
    state: Mutex<RunState>,
    current_cancel: Mutex<Option<watch::Sender<bool>>>,
    last_run: Mutex<Option<RunReport>>,
}

impl RunOrchestrator {
    pub fn new(lock: Arc<dyn RunLock>, walker: HistoryWalker) -> Self {
        Self {
            lock,
            walker: Arc::new(walker),
            state: Mutex::new(RunState::Idle),
            current_cancel: Mutex::new(None),
            last_run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_run(&self) -> Option<RunReport> {
        self.last_run
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Ask the in-flight run, if any, to stop at the next page or item boundary.
    pub fn cancel(&self) -> bool {
        let current = self.current_cancel.lock().unwrap_or_else(|p| p.into_inner());
        match current.as_ref() {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Fire-and-forget: the run proceeds on the runtime, callers get only the handle.
    pub fn trigger(self: &Arc<Self>, source: TriggerSource) -> JoinHandle<RunOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_once(source).await })
    }

    /// One complete run. Never fails: every error is logged and folded into the outcome.
    pub async fn run_once(&self, source: TriggerSource) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        // Only the lock holder drives Running/Releasing/Idle. A caller that loses
        // may only unwind the Acquiring it set itself.
        let claimed = self.transition(Some(RunState::Idle), RunState::Acquiring);

        let outcome = match self.lock.try_acquire(run_id).await {
            Ok(true) => {
                self.transition(None, RunState::Running);
                info!(%run_id, %source, "backup run started");
                let outcome = self.walk(run_id).await;
                self.transition(None, RunState::Releasing);
                self.release(run_id).await;
                self.transition(None, RunState::Idle);
                outcome
            }
            Ok(false) => {
                if claimed && self.transition(Some(RunState::Acquiring), RunState::SkippedBusy) {
                    self.transition(Some(RunState::SkippedBusy), RunState::Idle);
                }
                info!(%run_id, %source, "backup already running, skipping");
                RunOutcome::SkippedBusy
            }
            Err(e) => {
                if claimed {
                    self.transition(Some(RunState::Acquiring), RunState::Idle);
                }
                error!(%run_id, %source, error = %format!("{e:#}"), "failed to acquire backup lock");
                RunOutcome::Failed {
                    error: format!("acquire backup lock: {e:#}"),
                }
            }
        };

        *self.last_run.lock().unwrap_or_else(|p| p.into_inner()) = Some(RunReport {
            run_id,
            source,
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn walk(&self, run_id: Uuid) -> RunOutcome {
        let (tx, rx) = watch::channel(false);
        *self.current_cancel.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);

        // The walk runs in its own task so a panic surfaces as a JoinError and the
        // lock is still released below.
        let walker = Arc::clone(&self.walker);
        let result = tokio::spawn(async move { walker.run(&rx).await }).await;
        *self.current_cancel.lock().unwrap_or_else(|p| p.into_inner()) = None;

        match result {
            Ok(Ok(summary)) => {
                info!(
                    %run_id,
                    pages = summary.pages,
                    transferred = summary.transferred,
                    skipped_non_image = summary.skipped_non_image,
                    skipped_exported = summary.skipped_exported,
                    "backup run finished"
                );
                RunOutcome::Completed(summary)
            }
            Ok(Err(e)) => {
                error!(%run_id, error = %e, "backup run failed");
                RunOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(join_err) => {
                error!(%run_id, error = %join_err, "backup run aborted");
                RunOutcome::Failed {
                    error: format!("walker task aborted: {join_err}"),
                }
            }
        }
    }

    async fn release(&self, run_id: Uuid) {
        match self.lock.release(run_id).await {
            Ok(true) => {}
            Ok(false) => warn!(%run_id, "backup lock was no longer held by this run"),
            Err(e) => {
                error!(%run_id, error = %format!("{e:#}"), "failed to release backup lock")
            }
        }
    }

    /// Move to `next`, optionally only if the current state is `from`. Returns whether it moved.
    fn transition(&self, from: Option<RunState>, next: RunState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if from.is_some_and(|expected| *state != expected) {
            return false;
        }
        *state = next;
        true
    }
}
