//! Schedule definitions — what to run, when, how often and at what priority.

use std::collections::BTreeSet;

use autopilot_core::{AutopilotError, JsonValue, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{AppState, AutomationEvent};
use crate::trigger::Trigger;

/// Upper bound on triggers per schedule (regular and cancellation each).
pub const MAX_TRIGGERS: usize = 10;

fn default_limit() -> u32 {
    1
}

/// A declarative automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Opaque payload handed to the driver.
    #[serde(default)]
    pub data: JsonValue,
    pub triggers: Vec<Trigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Maximum executions; 0 means unlimited.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<ScheduleDelay>,
    /// Cooldown after each execution.
    #[serde(default)]
    pub interval_secs: u64,
    /// How long a finished schedule may still be revived by an edit.
    #[serde(default)]
    pub edit_grace_period_secs: u64,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl Schedule {
    /// Start building a schedule with a generated id.
    pub fn builder() -> ScheduleBuilder {
        ScheduleBuilder::new(uuid::Uuid::new_v4().to_string())
    }

    /// Start building a schedule with an explicit id.
    pub fn builder_with_id(id: impl Into<String>) -> ScheduleBuilder {
        ScheduleBuilder::new(id.into())
    }

    /// Parse and validate a JSON definition.
    pub fn from_json(text: &str) -> Result<Self> {
        let schedule: Self = serde_json::from_str(text)
            .map_err(|e| AutopilotError::parse(format!("invalid schedule: {e}")))?;
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AutopilotError::construction("schedule id must not be empty"));
        }
        if self.triggers.is_empty() || self.triggers.len() > MAX_TRIGGERS {
            return Err(AutopilotError::construction(format!(
                "schedule '{}' needs 1..={MAX_TRIGGERS} triggers, got {}",
                self.id,
                self.triggers.len()
            )));
        }
        for trigger in &self.triggers {
            trigger.validate()?;
        }
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start > end
        {
            return Err(AutopilotError::construction(format!(
                "schedule '{}' starts after it ends",
                self.id
            )));
        }
        if let Some(delay) = &self.delay {
            if delay.cancellation_triggers.len() > MAX_TRIGGERS {
                return Err(AutopilotError::construction(format!(
                    "schedule '{}' has too many cancellation triggers",
                    self.id
                )));
            }
            for trigger in &delay.cancellation_triggers {
                trigger.validate()?;
            }
        }
        Ok(())
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| start <= now)
    }

    /// Past the end of the validity window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| end <= now)
    }

    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.has_started(now) && !self.is_expired(now)
    }

    /// Whether `count` executions exhaust the limit.
    pub fn is_limit_reached(&self, count: u32) -> bool {
        self.limit > 0 && count >= self.limit
    }

    pub fn delay_seconds(&self) -> u64 {
        self.delay.as_ref().map_or(0, |d| d.seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs as i64)
    }

    pub fn edit_grace_period(&self) -> Duration {
        Duration::seconds(self.edit_grace_period_secs as i64)
    }
}

/// Validated builder for [`Schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleBuilder {
    schedule: Schedule,
}

impl ScheduleBuilder {
    fn new(id: String) -> Self {
        Self {
            schedule: Schedule {
                id,
                group: None,
                data: JsonValue::Null,
                triggers: Vec::new(),
                start: None,
                end: None,
                limit: default_limit(),
                priority: 0,
                delay: None,
                interval_secs: 0,
                edit_grace_period_secs: 0,
                metadata: JsonValue::Null,
            },
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.schedule.group = Some(group.into());
        self
    }

    pub fn data(mut self, data: JsonValue) -> Self {
        self.schedule.data = data;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.schedule.triggers.push(trigger);
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.schedule.start = Some(start);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.schedule.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.schedule.limit = limit;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.schedule.priority = priority;
        self
    }

    pub fn delay(mut self, delay: ScheduleDelay) -> Self {
        self.schedule.delay = Some(delay);
        self
    }

    pub fn interval_secs(mut self, secs: u64) -> Self {
        self.schedule.interval_secs = secs;
        self
    }

    pub fn edit_grace_period_secs(mut self, secs: u64) -> Self {
        self.schedule.edit_grace_period_secs = secs;
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.schedule.metadata = metadata;
        self
    }

    pub fn build(self) -> Result<Schedule> {
        self.schedule.validate()?;
        Ok(self.schedule)
    }
}

/// Conditions between a trigger firing and execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDelay {
    /// Wall-clock wait before preparation.
    #[serde(default)]
    pub seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<AppState>,
    /// Execute only while one of these screens is visible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    /// Abandon the wait if any of these fire first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancellation_triggers: Vec<Trigger>,
}

impl ScheduleDelay {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    /// Check app-state/screen/region conditions against what has been observed.
    pub fn conditions_met(&self, observed: &ObservedState) -> bool {
        if let Some(required) = self.app_state
            && observed.app_state != Some(required)
        {
            return false;
        }
        if !self.screens.is_empty()
            && !observed
                .screen
                .as_ref()
                .is_some_and(|screen| self.screens.contains(screen))
        {
            return false;
        }
        if let Some(region) = &self.region_id
            && !observed.regions.contains(region)
        {
            return false;
        }
        true
    }
}

/// Device state tracked from the event stream, used for delay conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    pub app_state: Option<AppState>,
    pub screen: Option<String>,
    pub regions: BTreeSet<String>,
}

impl ObservedState {
    /// Fold an event in. Returns true when the state changed.
    pub fn observe(&mut self, event: &AutomationEvent) -> bool {
        match event {
            AutomationEvent::Foreground { .. } => {
                self.app_state.replace(AppState::Foreground) != Some(AppState::Foreground)
            }
            AutomationEvent::Background { .. } => {
                self.app_state.replace(AppState::Background) != Some(AppState::Background)
            }
            AutomationEvent::ScreenView { name } => {
                self.screen.replace(name.clone()).as_ref() != Some(name)
            }
            AutomationEvent::RegionEnter { region_id } => self.regions.insert(region_id.clone()),
            AutomationEvent::RegionExit { region_id } => self.regions.remove(region_id),
            _ => false,
        }
    }
}

/// In-place edits to a live schedule. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEdits {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub edit_grace_period_secs: Option<u64>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

impl ScheduleEdits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    pub fn edit_grace_period_secs(mut self, secs: u64) -> Self {
        self.edit_grace_period_secs = Some(secs);
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Produce the edited schedule, validated. The input is left untouched.
    pub fn apply(&self, schedule: &Schedule) -> Result<Schedule> {
        let mut edited = schedule.clone();
        if let Some(limit) = self.limit {
            edited.limit = limit;
        }
        if let Some(priority) = self.priority {
            edited.priority = priority;
        }
        if let Some(data) = &self.data {
            edited.data = data.clone();
        }
        if let Some(start) = self.start {
            edited.start = Some(start);
        }
        if let Some(end) = self.end {
            edited.end = Some(end);
        }
        if let Some(secs) = self.interval_secs {
            edited.interval_secs = secs;
        }
        if let Some(secs) = self.edit_grace_period_secs {
            edited.edit_grace_period_secs = secs;
        }
        if let Some(metadata) = &self.metadata {
            edited.metadata = metadata.clone();
        }
        edited.validate()?;
        Ok(edited)
    }
}
