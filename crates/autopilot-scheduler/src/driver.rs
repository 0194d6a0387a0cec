//! Seams between the engine and the host application.
//!
//! A [`AutomationDriver`] performs the actual consequence of a schedule. The
//! engine calls it from its background task and hands over one-shot callback
//! handles; completing a handle queues the result back onto the same task.
//! A handle dropped without completion parks the schedule indefinitely.

use tokio::sync::mpsc;

use crate::engine::Command;
use crate::schedule::Schedule;

/// Outcome of preparing a schedule for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareResult {
    /// Go on to execution (possibly after waiting on delay conditions).
    Continue,
    /// Delete the schedule.
    Cancel,
    /// Back to idle; count and progress untouched.
    Skip,
    /// Count as an attempt for cooldown purposes without counting an execution.
    Penalize,
    /// Drop this preparation and prepare again from the stored definition.
    Invalidate,
}

pub trait AutomationDriver: Send + Sync {
    fn on_prepare_schedule(&self, schedule: &Schedule, callback: PrepareCallback);

    fn on_execute_schedule(&self, schedule: &Schedule, callback: ExecuteCallback);
}

/// Receives lifecycle notifications. Every method defaults to a no-op.
pub trait ScheduleListener: Send + Sync {
    fn on_new_schedule(&self, _schedule: &Schedule) {}

    fn on_schedule_cancelled(&self, _schedule: &Schedule) {}

    fn on_schedule_expired(&self, _schedule: &Schedule) {}

    fn on_schedule_limit_reached(&self, _schedule: &Schedule) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ScheduleListener for NoopListener {}

/// One-shot completion for [`AutomationDriver::on_prepare_schedule`].
#[derive(Debug)]
pub struct PrepareCallback {
    schedule_id: String,
    token: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl PrepareCallback {
    pub(crate) fn new(schedule_id: &str, token: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            schedule_id: schedule_id.to_string(),
            token,
            tx,
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn finish(self, result: PrepareResult) {
        let sent = self.tx.send(Command::PrepareFinished {
            id: self.schedule_id,
            token: self.token,
            result,
        });
        if sent.is_err() {
            tracing::debug!("prepare result dropped: engine stopped");
        }
    }
}

/// One-shot completion for [`AutomationDriver::on_execute_schedule`].
#[derive(Debug)]
pub struct ExecuteCallback {
    schedule_id: String,
    token: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl ExecuteCallback {
    pub(crate) fn new(schedule_id: &str, token: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            schedule_id: schedule_id.to_string(),
            token,
            tx,
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn finish(self) {
        let sent = self.tx.send(Command::ExecuteFinished {
            id: self.schedule_id,
            token: self.token,
        });
        if sent.is_err() {
            tracing::debug!("execution result dropped: engine stopped");
        }
    }
}
