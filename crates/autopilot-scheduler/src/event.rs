//! Events consumed by the engine.
//!
//! Every source (lifecycle, custom events, screens, regions, app upgrades)
//! is flattened into a tagged [`AutomationEvent`], which expands into one or
//! more [`TriggerUpdate`]s: `(trigger type, numeric value, JSON payload)`.

use std::fmt;
use std::str::FromStr;

use autopilot_core::{AutopilotError, JsonValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of events a trigger can count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Foreground,
    Background,
    AppInit,
    ActiveSession,
    Screen,
    RegionEnter,
    RegionExit,
    CustomEventCount,
    CustomEventValue,
    Version,
}

impl TriggerType {
    pub const ALL: [TriggerType; 10] = [
        TriggerType::Foreground,
        TriggerType::Background,
        TriggerType::AppInit,
        TriggerType::ActiveSession,
        TriggerType::Screen,
        TriggerType::RegionEnter,
        TriggerType::RegionExit,
        TriggerType::CustomEventCount,
        TriggerType::CustomEventValue,
        TriggerType::Version,
    ];

    /// Value-style triggers add the event's numeric value; all others add 1.
    pub fn is_value_style(&self) -> bool {
        matches!(self, TriggerType::CustomEventValue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Foreground => "foreground",
            TriggerType::Background => "background",
            TriggerType::AppInit => "app_init",
            TriggerType::ActiveSession => "active_session",
            TriggerType::Screen => "screen",
            TriggerType::RegionEnter => "region_enter",
            TriggerType::RegionExit => "region_exit",
            TriggerType::CustomEventCount => "custom_event_count",
            TriggerType::CustomEventValue => "custom_event_value",
            TriggerType::Version => "version",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| AutopilotError::parse(format!("unknown trigger type '{s}'")))
    }
}

/// Foreground/background state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Foreground,
    Background,
}

/// An event notification from the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    Foreground {
        at: DateTime<Utc>,
    },
    Background {
        at: DateTime<Utc>,
    },
    AppInit,
    CustomEvent {
        name: String,
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        properties: JsonValue,
    },
    ScreenView {
        name: String,
    },
    RegionEnter {
        region_id: String,
    },
    RegionExit {
        region_id: String,
    },
    VersionChanged {
        version: String,
    },
}

/// One `(type, value, payload)` tuple fed to triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerUpdate {
    pub trigger_type: TriggerType,
    pub value: f64,
    pub payload: JsonValue,
}

impl TriggerUpdate {
    fn count(trigger_type: TriggerType, payload: JsonValue) -> Self {
        Self {
            trigger_type,
            value: 1.0,
            payload,
        }
    }
}

impl AutomationEvent {
    pub fn foreground() -> Self {
        Self::Foreground { at: Utc::now() }
    }

    pub fn background() -> Self {
        Self::Background { at: Utc::now() }
    }

    pub fn custom(name: impl Into<String>, value: Option<f64>, properties: JsonValue) -> Self {
        Self::CustomEvent {
            name: name.into(),
            value,
            properties,
        }
    }

    pub fn screen(name: impl Into<String>) -> Self {
        Self::ScreenView { name: name.into() }
    }

    /// Expand into the trigger updates this event produces.
    pub fn trigger_updates(&self) -> Vec<TriggerUpdate> {
        match self {
            Self::Foreground { .. } => vec![
                TriggerUpdate::count(TriggerType::Foreground, JsonValue::Null),
                TriggerUpdate::count(TriggerType::ActiveSession, JsonValue::Null),
            ],
            Self::Background { .. } => {
                vec![TriggerUpdate::count(TriggerType::Background, JsonValue::Null)]
            }
            Self::AppInit => vec![TriggerUpdate::count(TriggerType::AppInit, JsonValue::Null)],
            Self::CustomEvent {
                name,
                value,
                properties,
            } => {
                let mut fields = vec![
                    ("event_name", JsonValue::from(name.as_str())),
                    ("properties", properties.clone()),
                ];
                if let Some(v) = value {
                    fields.push(("event_value", JsonValue::from(*v)));
                }
                let payload = JsonValue::object(fields);

                let mut updates = vec![TriggerUpdate::count(
                    TriggerType::CustomEventCount,
                    payload.clone(),
                )];
                if let Some(v) = value {
                    updates.push(TriggerUpdate {
                        trigger_type: TriggerType::CustomEventValue,
                        value: *v,
                        payload,
                    });
                }
                updates
            }
            Self::ScreenView { name } => vec![TriggerUpdate::count(
                TriggerType::Screen,
                JsonValue::from(name.as_str()),
            )],
            Self::RegionEnter { region_id } => vec![TriggerUpdate::count(
                TriggerType::RegionEnter,
                JsonValue::object([("region_id", JsonValue::from(region_id.as_str()))]),
            )],
            Self::RegionExit { region_id } => vec![TriggerUpdate::count(
                TriggerType::RegionExit,
                JsonValue::object([("region_id", JsonValue::from(region_id.as_str()))]),
            )],
            Self::VersionChanged { version } => vec![TriggerUpdate::count(
                TriggerType::Version,
                JsonValue::object([("version", JsonValue::from(version.as_str()))]),
            )],
        }
    }
}
