//! Triggers — typed event counters with an optional predicate and a goal.

use autopilot_core::{AutopilotError, JsonMatcher, JsonPredicate, JsonValue, Result, ValueMatcher};
use serde::{Deserialize, Serialize};

use crate::event::{TriggerType, TriggerUpdate};

/// Declarative trigger definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Progress needed to fire. Always positive.
    pub goal: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<JsonPredicate>,
}

impl Trigger {
    pub fn new(trigger_type: TriggerType, goal: f64, predicate: Option<JsonPredicate>) -> Result<Self> {
        let trigger = Self {
            trigger_type,
            goal,
            predicate,
        };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.goal.is_finite() && self.goal > 0.0) {
            return Err(AutopilotError::construction(format!(
                "{} trigger goal must be positive, got {}",
                self.trigger_type, self.goal
            )));
        }
        Ok(())
    }

    pub fn foreground(goal: f64) -> Result<Self> {
        Self::new(TriggerType::Foreground, goal, None)
    }

    pub fn background(goal: f64) -> Result<Self> {
        Self::new(TriggerType::Background, goal, None)
    }

    pub fn app_init(goal: f64) -> Result<Self> {
        Self::new(TriggerType::AppInit, goal, None)
    }

    pub fn active_session(goal: f64) -> Result<Self> {
        Self::new(TriggerType::ActiveSession, goal, None)
    }

    /// Counts views of one screen.
    pub fn screen(name: &str, goal: f64) -> Result<Self> {
        let predicate = JsonPredicate::matcher(JsonMatcher::new(ValueMatcher::equals(name)));
        Self::new(TriggerType::Screen, goal, Some(predicate))
    }

    pub fn region_enter(region_id: &str, goal: f64) -> Result<Self> {
        Self::new(TriggerType::RegionEnter, goal, Some(region_predicate(region_id)))
    }

    pub fn region_exit(region_id: &str, goal: f64) -> Result<Self> {
        Self::new(TriggerType::RegionExit, goal, Some(region_predicate(region_id)))
    }

    /// Counts occurrences of a named custom event.
    pub fn custom_event(name: &str, goal: f64) -> Result<Self> {
        Self::new(TriggerType::CustomEventCount, goal, Some(event_name_predicate(name)))
    }

    /// Sums the value of a named custom event.
    pub fn custom_event_value(name: &str, goal: f64) -> Result<Self> {
        Self::new(TriggerType::CustomEventValue, goal, Some(event_name_predicate(name)))
    }

    /// Counts app upgrades into a version range.
    pub fn version(constraint: &str, goal: f64) -> Result<Self> {
        let predicate = JsonPredicate::matcher(
            JsonMatcher::new(ValueMatcher::version(constraint)?).with_key("version"),
        );
        Self::new(TriggerType::Version, goal, Some(predicate))
    }

    /// Progress delta for an event, or `None` if the event does not qualify.
    pub fn evaluate(&self, trigger_type: TriggerType, value: f64, payload: &JsonValue) -> Option<f64> {
        if trigger_type != self.trigger_type {
            return None;
        }
        if let Some(predicate) = &self.predicate
            && !predicate.apply(payload)
        {
            return None;
        }
        Some(if self.trigger_type.is_value_style() { value } else { 1.0 })
    }
}

fn event_name_predicate(name: &str) -> JsonPredicate {
    JsonPredicate::matcher(JsonMatcher::new(ValueMatcher::equals(name)).with_key("event_name"))
}

fn region_predicate(region_id: &str) -> JsonPredicate {
    JsonPredicate::matcher(JsonMatcher::new(ValueMatcher::equals(region_id)).with_key("region_id"))
}

/// Runtime counter for one trigger of one schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEntry {
    pub schedule_id: String,
    /// Position within the schedule's trigger list (or cancellation list).
    pub index: usize,
    /// Cancellation triggers only count while the schedule waits on conditions.
    pub cancellation: bool,
    pub trigger: Trigger,
    pub progress: f64,
}

impl TriggerEntry {
    pub fn new(schedule_id: &str, index: usize, cancellation: bool, trigger: Trigger) -> Self {
        Self {
            schedule_id: schedule_id.to_string(),
            index,
            cancellation,
            trigger,
            progress: 0.0,
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type
    }

    pub fn is_triggered(&self) -> bool {
        self.progress >= self.trigger.goal
    }

    /// Apply an update. Returns `None` when the update was ignored, otherwise
    /// whether the goal is now reached. Negative and non-finite amounts are
    /// ignored so progress never decreases.
    pub fn process(&mut self, update: &TriggerUpdate) -> Option<bool> {
        let delta = self
            .trigger
            .evaluate(update.trigger_type, update.value, &update.payload)?;
        if !delta.is_finite() || delta < 0.0 {
            return None;
        }
        self.progress += delta;
        Some(self.is_triggered())
    }

    pub fn reset(&mut self) {
        self.progress = 0.0;
    }
}
