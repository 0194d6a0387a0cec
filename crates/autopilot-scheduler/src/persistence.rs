//! SQLite-backed schedule store — survives restarts.
//! Dates are stored as epoch milliseconds; definitions and predicates as JSON.

use std::path::Path;

use autopilot_core::{AutopilotError, JsonPredicate, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params, params_from_iter};

use crate::entry::{ScheduleEntry, ScheduleState};
use crate::event::TriggerType;
use crate::schedule::Schedule;
use crate::store::ScheduleStore;
use crate::trigger::{Trigger, TriggerEntry};

const SCHEDULE_COLUMNS: &str = "rowid, schedule_id, definition, execution_state, execution_count, \
     delay_finish_ms, last_execution_ms, state_changed_ms";

/// SQLite implementation of [`ScheduleStore`].
pub struct SqliteScheduleStore {
    conn: rusqlite::Connection,
}

impl SqliteScheduleStore {
    /// Open or create the schedule database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| AutopilotError::storage(format!("DB open: {e}")))?;
        let store = Self { conn };
        store.migrate()?;
        tracing::debug!(path = %path.display(), "opened schedule store");
        Ok(store)
    }

    /// Private database that vanishes on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| AutopilotError::storage(format!("DB open: {e}")))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schedules (
                schedule_id TEXT PRIMARY KEY,
                schedule_group TEXT,
                definition TEXT NOT NULL,              -- full schedule JSON
                execution_state TEXT NOT NULL DEFAULT 'idle',
                execution_count INTEGER NOT NULL DEFAULT 0,
                delay_finish_ms INTEGER,
                metadata TEXT NOT NULL DEFAULT 'null',
                priority INTEGER NOT NULL DEFAULT 0,
                start_ms INTEGER,
                end_ms INTEGER,
                last_execution_ms INTEGER,
                state_changed_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_group ON schedules(schedule_group);
            CREATE INDEX IF NOT EXISTS idx_schedules_state ON schedules(execution_state);

            CREATE TABLE IF NOT EXISTS triggers (
                schedule_id TEXT NOT NULL,
                trigger_index INTEGER NOT NULL,
                cancellation INTEGER NOT NULL DEFAULT 0,
                trigger_type TEXT NOT NULL,
                goal REAL NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                predicate TEXT,                        -- JSON, NULL matches everything
                PRIMARY KEY (schedule_id, cancellation, trigger_index),
                FOREIGN KEY (schedule_id) REFERENCES schedules(schedule_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_triggers_type ON triggers(trigger_type);
         ",
            )
            .map_err(|e| AutopilotError::storage(format!("Migration: {e}")))
    }

    fn query_entries(
        &self,
        where_clause: &str,
        values: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<ScheduleEntry>> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules {where_clause} ORDER BY priority, rowid"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| AutopilotError::storage(format!("Query schedules: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(values), ScheduleRow::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| AutopilotError::storage(format!("Query schedules: {e}")))?;
        rows.into_iter()
            .map(|row| {
                let triggers = self.load_triggers(&row.schedule_id)?;
                row.into_entry(&triggers)
            })
            .collect()
    }

    fn load_triggers(&self, schedule_id: &str) -> Result<Vec<TriggerEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT schedule_id, trigger_index, cancellation, trigger_type, goal, progress, predicate
                 FROM triggers WHERE schedule_id = ?1 ORDER BY cancellation, trigger_index",
            )
            .map_err(|e| AutopilotError::storage(format!("Query triggers: {e}")))?;
        let rows = stmt
            .query_map(params![schedule_id], TriggerRow::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| AutopilotError::storage(format!("Query triggers: {e}")))?;
        rows.into_iter().map(TriggerRow::into_entry).collect()
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn get_all(&self) -> Result<Vec<ScheduleEntry>> {
        self.query_entries("", Vec::new())
    }

    fn get(&self, id: &str) -> Result<Option<ScheduleEntry>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?1"),
                params![id],
                ScheduleRow::from_row,
            )
            .optional()
            .map_err(|e| AutopilotError::storage(format!("Get schedule: {e}")))?;
        match row {
            Some(row) => {
                let triggers = self.load_triggers(id)?;
                row.into_entry(&triggers).map(Some)
            }
            None => Ok(None),
        }
    }

    fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ScheduleEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.query_entries(
            &format!("WHERE schedule_id IN ({})", placeholders(ids.len())),
            ids.iter().cloned().map(Into::into).collect(),
        )
    }

    fn get_by_group(&self, group: &str) -> Result<Vec<ScheduleEntry>> {
        self.query_entries("WHERE schedule_group = ?1", vec![group.to_string().into()])
    }

    fn get_by_states(&self, states: &[ScheduleState]) -> Result<Vec<ScheduleEntry>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        self.query_entries(
            &format!("WHERE execution_state IN ({})", placeholders(states.len())),
            states.iter().map(|s| s.as_str().to_string().into()).collect(),
        )
    }

    fn get_active_triggers(
        &self,
        trigger_type: TriggerType,
        schedule_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TriggerEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.schedule_id, t.trigger_index, t.cancellation, t.trigger_type, t.goal,
                        t.progress, t.predicate
                 FROM triggers t JOIN schedules s ON s.schedule_id = t.schedule_id
                 WHERE t.trigger_type = ?1
                   AND (?2 IS NULL OR t.schedule_id = ?2)
                   AND (s.start_ms IS NULL OR s.start_ms <= ?3)
                   AND ((t.cancellation = 0 AND s.execution_state = 'idle')
                     OR (t.cancellation = 1 AND s.execution_state = 'waiting_schedule_conditions'))
                 ORDER BY s.priority, s.rowid, t.cancellation, t.trigger_index",
            )
            .map_err(|e| AutopilotError::storage(format!("Query active triggers: {e}")))?;
        let rows = stmt
            .query_map(
                params![trigger_type.as_str(), schedule_id, now.timestamp_millis()],
                TriggerRow::from_row,
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| AutopilotError::storage(format!("Query active triggers: {e}")))?;
        rows.into_iter().map(TriggerRow::into_entry).collect()
    }

    fn get_active_expired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
        self.query_entries(
            "WHERE end_ms IS NOT NULL AND end_ms <= ?1
               AND execution_state NOT IN ('finished', 'executing')",
            vec![now.timestamp_millis().into()],
        )
    }

    fn save(&mut self, entries: &[ScheduleEntry]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| AutopilotError::storage(format!("Begin: {e}")))?;
        for entry in entries {
            let schedule = &entry.schedule;
            let definition = serde_json::to_string(schedule)?;
            tx.execute(
                "INSERT INTO schedules
                 (schedule_id, schedule_group, definition, execution_state, execution_count,
                  delay_finish_ms, metadata, priority, start_ms, end_ms, last_execution_ms,
                  state_changed_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(schedule_id) DO UPDATE SET
                    schedule_group = excluded.schedule_group,
                    definition = excluded.definition,
                    execution_state = excluded.execution_state,
                    execution_count = excluded.execution_count,
                    delay_finish_ms = excluded.delay_finish_ms,
                    metadata = excluded.metadata,
                    priority = excluded.priority,
                    start_ms = excluded.start_ms,
                    end_ms = excluded.end_ms,
                    last_execution_ms = excluded.last_execution_ms,
                    state_changed_ms = excluded.state_changed_ms",
                params![
                    schedule.id,
                    schedule.group,
                    definition,
                    entry.state.as_str(),
                    entry.execution_count,
                    entry.delay_finish_at.map(|t| t.timestamp_millis()),
                    schedule.metadata.to_string(),
                    schedule.priority,
                    schedule.start.map(|t| t.timestamp_millis()),
                    schedule.end.map(|t| t.timestamp_millis()),
                    entry.last_execution_at.map(|t| t.timestamp_millis()),
                    entry.state_changed_at.timestamp_millis(),
                ],
            )
            .map_err(|e| AutopilotError::storage(format!("Save schedule '{}': {e}", schedule.id)))?;
            for trigger in &entry.triggers {
                upsert_trigger(&tx, trigger)?;
            }
        }
        tx.commit()
            .map_err(|e| AutopilotError::storage(format!("Commit: {e}")))
    }

    fn save_triggers(&mut self, triggers: &[TriggerEntry]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| AutopilotError::storage(format!("Begin: {e}")))?;
        for trigger in triggers {
            tx.execute(
                "UPDATE triggers SET progress = ?1
                 WHERE schedule_id = ?2 AND cancellation = ?3 AND trigger_index = ?4",
                params![
                    trigger.progress,
                    trigger.schedule_id,
                    trigger.cancellation,
                    trigger.index as i64
                ],
            )
            .map_err(|e| AutopilotError::storage(format!("Save trigger progress: {e}")))?;
        }
        tx.commit()
            .map_err(|e| AutopilotError::storage(format!("Commit: {e}")))
    }

    fn delete(&mut self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.conn
            .execute(
                &format!("DELETE FROM schedules WHERE schedule_id IN ({})", placeholders(ids.len())),
                params_from_iter(ids),
            )
            .map_err(|e| AutopilotError::storage(format!("Delete schedules: {e}")))
    }

    fn delete_group(&mut self, group: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM schedules WHERE schedule_group = ?1", params![group])
            .map_err(|e| AutopilotError::storage(format!("Delete group: {e}")))
    }

    fn delete_all(&mut self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM schedules", [])
            .map_err(|e| AutopilotError::storage(format!("Delete all: {e}")))
    }
}

fn upsert_trigger(tx: &rusqlite::Transaction<'_>, trigger: &TriggerEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO triggers
         (schedule_id, trigger_index, cancellation, trigger_type, goal, progress, predicate)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(schedule_id, cancellation, trigger_index) DO UPDATE SET
            trigger_type = excluded.trigger_type,
            goal = excluded.goal,
            progress = excluded.progress,
            predicate = excluded.predicate",
        params![
            trigger.schedule_id,
            trigger.index as i64,
            trigger.cancellation,
            trigger.trigger_type().as_str(),
            trigger.trigger.goal,
            trigger.progress,
            trigger.trigger.predicate.as_ref().map(|p| p.to_json().to_string()),
        ],
    )
    .map_err(|e| AutopilotError::storage(format!("Save trigger: {e}")))?;
    Ok(())
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AutopilotError::storage(format!("timestamp out of range: {ms}")))
}

/// Raw `schedules` row, decoded outside the rusqlite closure.
struct ScheduleRow {
    sequence: i64,
    schedule_id: String,
    definition: String,
    state: String,
    execution_count: u32,
    delay_finish_ms: Option<i64>,
    last_execution_ms: Option<i64>,
    state_changed_ms: i64,
}

impl ScheduleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            schedule_id: row.get(1)?,
            definition: row.get(2)?,
            state: row.get(3)?,
            execution_count: row.get(4)?,
            delay_finish_ms: row.get(5)?,
            last_execution_ms: row.get(6)?,
            state_changed_ms: row.get(7)?,
        })
    }

    fn into_entry(self, stored_triggers: &[TriggerEntry]) -> Result<ScheduleEntry> {
        let schedule: Schedule = serde_json::from_str(&self.definition).map_err(|e| {
            AutopilotError::storage(format!("corrupt definition for '{}': {e}", self.schedule_id))
        })?;
        let mut entry = ScheduleEntry::new(schedule, from_ms(self.state_changed_ms)?);
        entry.merge_triggers(stored_triggers);
        entry.state = self.state.parse()?;
        entry.execution_count = self.execution_count;
        entry.delay_finish_at = self.delay_finish_ms.map(from_ms).transpose()?;
        entry.last_execution_at = self.last_execution_ms.map(from_ms).transpose()?;
        entry.sequence = self.sequence;
        Ok(entry)
    }
}

struct TriggerRow {
    schedule_id: String,
    index: i64,
    cancellation: bool,
    trigger_type: String,
    goal: f64,
    progress: f64,
    predicate: Option<String>,
}

impl TriggerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            schedule_id: row.get(0)?,
            index: row.get(1)?,
            cancellation: row.get(2)?,
            trigger_type: row.get(3)?,
            goal: row.get(4)?,
            progress: row.get(5)?,
            predicate: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<TriggerEntry> {
        let predicate = self
            .predicate
            .as_deref()
            .map(JsonPredicate::parse)
            .transpose()?;
        let trigger = Trigger {
            trigger_type: self.trigger_type.parse()?,
            goal: self.goal,
            predicate,
        };
        let mut entry = TriggerEntry::new(
            &self.schedule_id,
            usize::try_from(self.index)
                .map_err(|_| AutopilotError::storage(format!("bad trigger index {}", self.index)))?,
            self.cancellation,
            trigger,
        );
        entry.progress = self.progress;
        Ok(entry)
    }
}
