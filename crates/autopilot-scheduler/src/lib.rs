//! # Autopilot Scheduler
//!
//! Persistent, event-driven automation engine.
//!
//! ## Architecture
//! ```text
//! AutomationEvent (foreground, custom event, screen, region, version...)
//!   └── AutomationEngine handle ──mpsc──▶ background task
//!         ├── active triggers (store query) → predicate → progress
//!         ├── ScheduleEntry state machine
//!         │     IDLE → TIME_DELAYED → PREPARING → WAITING → EXECUTING
//!         │          → IDLE | PAUSED (interval) | FINISHED
//!         ├── AutomationDriver (prepare / execute, one-shot callbacks)
//!         ├── Timer + Clock (delays, cooldowns)
//!         └── ScheduleStore (SQLite)
//! ```

pub mod clock;
pub mod driver;
pub mod engine;
pub mod entry;
pub mod event;
pub mod persistence;
pub mod schedule;
pub mod store;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock, Timer, TimerHandle, TokioTimer};
pub use driver::{
    AutomationDriver, ExecuteCallback, NoopListener, PrepareCallback, PrepareResult,
    ScheduleListener,
};
pub use engine::{AutomationEngine, EngineBuilder};
pub use entry::{ScheduleEntry, ScheduleState};
pub use event::{AppState, AutomationEvent, TriggerType, TriggerUpdate};
pub use persistence::SqliteScheduleStore;
pub use schedule::{ObservedState, Schedule, ScheduleBuilder, ScheduleDelay, ScheduleEdits};
pub use store::ScheduleStore;
pub use trigger::{Trigger, TriggerEntry};
