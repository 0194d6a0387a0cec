//! Storage contract for schedule entries.
//!
//! The engine touches its store only from its own background task, so
//! implementations need to be `Send` but never `Sync`.

use autopilot_core::Result;
use chrono::{DateTime, Utc};

use crate::entry::{ScheduleEntry, ScheduleState};
use crate::event::TriggerType;
use crate::trigger::TriggerEntry;

/// Durable keyed storage for entries and their trigger progress.
///
/// Queries return entries ordered by `(priority, sequence)`.
pub trait ScheduleStore: Send {
    fn get_all(&self) -> Result<Vec<ScheduleEntry>>;

    fn get(&self, id: &str) -> Result<Option<ScheduleEntry>>;

    fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ScheduleEntry>>;

    fn get_by_group(&self, group: &str) -> Result<Vec<ScheduleEntry>>;

    fn get_by_states(&self, states: &[ScheduleState]) -> Result<Vec<ScheduleEntry>>;

    /// Triggers that can currently make progress: regular triggers of IDLE
    /// entries and cancellation triggers of WAITING_SCHEDULE_CONDITIONS
    /// entries, whose schedule has started by `now`.
    fn get_active_triggers(
        &self,
        trigger_type: TriggerType,
        schedule_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TriggerEntry>>;

    /// Unfinished, not-executing entries whose end is at or before `now`.
    fn get_active_expired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>>;

    /// Insert or update entries together with their triggers.
    fn save(&mut self, entries: &[ScheduleEntry]) -> Result<()>;

    /// Update trigger progress only.
    fn save_triggers(&mut self, triggers: &[TriggerEntry]) -> Result<()>;

    fn delete(&mut self, ids: &[String]) -> Result<usize>;

    fn delete_group(&mut self, group: &str) -> Result<usize>;

    fn delete_all(&mut self) -> Result<usize>;
}
