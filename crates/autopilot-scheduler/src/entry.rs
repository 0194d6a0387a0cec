//! Persisted runtime state of one schedule.

use std::fmt;
use std::str::FromStr;

use autopilot_core::AutopilotError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;
use crate::trigger::TriggerEntry;

/// Lifecycle state of a [`ScheduleEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Idle,
    TimeDelayed,
    PreparingSchedule,
    WaitingScheduleConditions,
    Executing,
    Paused,
    Finished,
}

impl ScheduleState {
    pub const ALL: [ScheduleState; 7] = [
        ScheduleState::Idle,
        ScheduleState::TimeDelayed,
        ScheduleState::PreparingSchedule,
        ScheduleState::WaitingScheduleConditions,
        ScheduleState::Executing,
        ScheduleState::Paused,
        ScheduleState::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Idle => "idle",
            ScheduleState::TimeDelayed => "time_delayed",
            ScheduleState::PreparingSchedule => "preparing_schedule",
            ScheduleState::WaitingScheduleConditions => "waiting_schedule_conditions",
            ScheduleState::Executing => "executing",
            ScheduleState::Paused => "paused",
            ScheduleState::Finished => "finished",
        }
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleState {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScheduleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| AutopilotError::parse(format!("unknown schedule state '{s}'")))
    }
}

/// A schedule plus everything the engine tracks about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub schedule: Schedule,
    /// Regular triggers first, then cancellation triggers.
    pub triggers: Vec<TriggerEntry>,
    pub state: ScheduleState,
    pub execution_count: u32,
    /// Wake time while TIME_DELAYED or PAUSED.
    pub delay_finish_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    /// Creation order, assigned by the store. Breaks priority ties.
    pub sequence: i64,
}

impl ScheduleEntry {
    pub fn new(schedule: Schedule, now: DateTime<Utc>) -> Self {
        let mut triggers: Vec<TriggerEntry> = schedule
            .triggers
            .iter()
            .enumerate()
            .map(|(i, t)| TriggerEntry::new(&schedule.id, i, false, t.clone()))
            .collect();
        if let Some(delay) = &schedule.delay {
            triggers.extend(
                delay
                    .cancellation_triggers
                    .iter()
                    .enumerate()
                    .map(|(i, t)| TriggerEntry::new(&schedule.id, i, true, t.clone())),
            );
        }
        Self {
            schedule,
            triggers,
            state: ScheduleState::Idle,
            execution_count: 0,
            delay_finish_at: None,
            last_execution_at: None,
            state_changed_at: now,
            sequence: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.schedule.id
    }

    pub fn set_state(&mut self, state: ScheduleState, now: DateTime<Utc>) {
        if self.state != state {
            tracing::debug!(schedule_id = %self.schedule.id, from = %self.state, to = %state, "state change");
            self.state = state;
            self.state_changed_at = now;
        }
        if !matches!(state, ScheduleState::TimeDelayed | ScheduleState::Paused) {
            self.delay_finish_at = None;
        }
    }

    /// Any regular trigger at goal.
    pub fn is_triggered(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| !t.cancellation && t.is_triggered())
    }

    /// Any cancellation trigger at goal.
    pub fn is_cancellation_triggered(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| t.cancellation && t.is_triggered())
    }

    pub fn reset_progress(&mut self) {
        self.triggers.iter_mut().for_each(TriggerEntry::reset);
    }

    pub fn reset_cancellation_progress(&mut self) {
        self.triggers
            .iter_mut()
            .filter(|t| t.cancellation)
            .for_each(TriggerEntry::reset);
    }

    /// Replace stored trigger progress with the given snapshots.
    pub fn merge_triggers(&mut self, updated: &[TriggerEntry]) {
        for t in self.triggers.iter_mut() {
            if let Some(u) = updated
                .iter()
                .find(|u| u.cancellation == t.cancellation && u.index == t.index)
            {
                t.progress = u.progress;
            }
        }
    }

    pub fn is_limit_reached(&self) -> bool {
        self.schedule.is_limit_reached(self.execution_count)
    }

    /// Finished but still revivable by an edit.
    pub fn is_in_grace_period(&self, now: DateTime<Utc>) -> bool {
        self.state == ScheduleState::Finished
            && now < self.state_changed_at + self.schedule.edit_grace_period()
    }
}
