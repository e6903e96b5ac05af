//! Run control and progress reporting types

use crate::error::{BacktideError, BacktideResult};
use crate::types::BackupProgressInfo;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Requested state of the drain loop, observed at batch boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Running,
    Paused,
    Cancelled,
}

/// Progress notifications for one run
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Info(BackupProgressInfo),
    Success,
    Cancelled,
    Fail(Arc<BacktideError>),
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success,
    Cancelled,
    Failed(Arc<BacktideError>),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

/// Handle to a started run
pub struct BackupRun {
    events: broadcast::Receiver<BackupEvent>,
    handle: JoinHandle<RunOutcome>,
}

impl BackupRun {
    pub(crate) fn new(events: broadcast::Receiver<BackupEvent>, handle: JoinHandle<RunOutcome>) -> Self {
        Self { events, handle }
    }

    /// Events of this run, starting from the first one emitted
    pub fn events(&mut self) -> &mut broadcast::Receiver<BackupEvent> {
        &mut self.events
    }

    /// Take the receiver holding every event since the run started,
    /// leaving a fresh subscription behind
    pub fn take_events(&mut self) -> broadcast::Receiver<BackupEvent> {
        let fresh = self.events.resubscribe();
        std::mem::replace(&mut self.events, fresh)
    }

    /// Wait for the run to end
    pub async fn wait(self) -> BacktideResult<RunOutcome> {
        Ok(self.handle.await?)
    }
}
