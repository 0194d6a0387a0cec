//! Automation engine — the orchestrator.
//!
//! [`AutomationEngine`] is a cheap, cloneable handle. Every call is turned into
//! a command and queued onto a single background task that owns the store,
//! the trigger state and all timers, so mutations are applied strictly in
//! arrival order. Driver and timer callbacks re-enter through the same queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use autopilot_core::{AutopilotError, JsonValue, Result};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::{Clock, ManualClock, SystemClock, Timer, TimerHandle, TokioTimer};
use crate::driver::{
    AutomationDriver, ExecuteCallback, NoopListener, PrepareCallback, PrepareResult,
    ScheduleListener,
};
use crate::entry::{ScheduleEntry, ScheduleState};
use crate::event::AutomationEvent;
use crate::schedule::{ObservedState, Schedule, ScheduleEdits};
use crate::store::ScheduleStore;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work item for the background task.
pub(crate) enum Command {
    Schedule {
        schedules: Vec<Schedule>,
        metadata: JsonValue,
        reply: Reply<Vec<String>>,
    },
    Cancel {
        ids: Vec<String>,
        reply: Reply<usize>,
    },
    CancelGroup {
        group: String,
        reply: Reply<usize>,
    },
    CancelAll {
        reply: Reply<usize>,
    },
    Edit {
        id: String,
        edits: ScheduleEdits,
        reply: Reply<Option<Schedule>>,
    },
    GetSchedule {
        id: String,
        reply: Reply<Option<Schedule>>,
    },
    GetSchedules {
        group: Option<String>,
        reply: Reply<Vec<Schedule>>,
    },
    GetState {
        id: String,
        reply: Reply<Option<ScheduleState>>,
    },
    SetPaused(bool),
    Event(AutomationEvent),
    PrepareFinished {
        id: String,
        token: u64,
        result: PrepareResult,
    },
    ExecuteFinished {
        id: String,
        token: u64,
    },
    TimerFired {
        id: String,
        token: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

fn engine_stopped() -> AutopilotError {
    AutopilotError::Engine("automation engine is not running".into())
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct AutomationEngine {
    tx: mpsc::UnboundedSender<Command>,
}

impl AutomationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| engine_stopped())?;
        rx.await.map_err(|_| engine_stopped())?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| engine_stopped())
    }

    /// Accept a schedule. Returns false if the id is already in use.
    /// Non-null `metadata` replaces the schedule's own.
    pub async fn schedule(&self, schedule: Schedule, metadata: JsonValue) -> Result<bool> {
        let accepted = self.schedule_multiple(vec![schedule], metadata).await?;
        Ok(!accepted.is_empty())
    }

    /// Accept a batch in one step. Invalid definitions fail the whole batch;
    /// ids already in use are skipped. Returns the accepted ids.
    pub async fn schedule_multiple(
        &self,
        schedules: Vec<Schedule>,
        metadata: JsonValue,
    ) -> Result<Vec<String>> {
        self.request(|reply| Command::Schedule {
            schedules,
            metadata,
            reply,
        })
        .await
    }

    /// Cancel by id. Returns how many live schedules were removed.
    pub async fn cancel<I, S>(&self, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        self.request(|reply| Command::Cancel { ids, reply }).await
    }

    pub async fn cancel_group(&self, group: &str) -> Result<usize> {
        let group = group.to_string();
        self.request(|reply| Command::CancelGroup { group, reply })
            .await
    }

    pub async fn cancel_all(&self) -> Result<usize> {
        self.request(|reply| Command::CancelAll { reply }).await
    }

    /// Edit in place. `Ok(None)` when no such schedule exists.
    pub async fn edit_schedule(&self, id: &str, edits: ScheduleEdits) -> Result<Option<Schedule>> {
        let id = id.to_string();
        self.request(|reply| Command::Edit { id, edits, reply })
            .await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let id = id.to_string();
        self.request(|reply| Command::GetSchedule { id, reply }).await
    }

    pub async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        self.request(|reply| Command::GetSchedules { group: None, reply })
            .await
    }

    pub async fn get_group(&self, group: &str) -> Result<Vec<Schedule>> {
        let group = Some(group.to_string());
        self.request(|reply| Command::GetSchedules { group, reply })
            .await
    }

    pub async fn get_state(&self, id: &str) -> Result<Option<ScheduleState>> {
        let id = id.to_string();
        self.request(|reply| Command::GetState { id, reply }).await
    }

    /// Global gate. While paused, triggers keep counting but nothing starts.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.send(Command::SetPaused(paused))
    }

    pub fn add_event(&self, event: AutomationEvent) -> Result<()> {
        self.send(Command::Event(event))
    }

    pub fn foreground(&self) -> Result<()> {
        self.add_event(AutomationEvent::foreground())
    }

    pub fn background(&self) -> Result<()> {
        self.add_event(AutomationEvent::background())
    }

    pub fn app_init(&self) -> Result<()> {
        self.add_event(AutomationEvent::AppInit)
    }

    pub fn custom_event(&self, name: &str, value: Option<f64>, properties: JsonValue) -> Result<()> {
        self.add_event(AutomationEvent::custom(name, value, properties))
    }

    pub fn screen_view(&self, name: &str) -> Result<()> {
        self.add_event(AutomationEvent::screen(name))
    }

    pub fn region_enter(&self, region_id: &str) -> Result<()> {
        self.add_event(AutomationEvent::RegionEnter {
            region_id: region_id.to_string(),
        })
    }

    pub fn region_exit(&self, region_id: &str) -> Result<()> {
        self.add_event(AutomationEvent::RegionExit {
            region_id: region_id.to_string(),
        })
    }

    pub fn version_changed(&self, version: &str) -> Result<()> {
        self.add_event(AutomationEvent::VersionChanged {
            version: version.to_string(),
        })
    }

    /// Forward an event source into the engine until it ends or the engine stops.
    pub fn attach_source<S>(&self, source: S) -> JoinHandle<()>
    where
        S: Stream<Item = AutomationEvent> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut source = Box::pin(source);
            while let Some(event) = source.next().await {
                if tx.send(Command::Event(event)).is_err() {
                    break;
                }
            }
        })
    }

    /// Stop the background task. Later calls fail with an engine error.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| engine_stopped())
    }
}

/// Wires the engine's collaborators, then spawns it.
pub struct EngineBuilder {
    store: Option<Box<dyn ScheduleStore>>,
    driver: Option<Arc<dyn AutomationDriver>>,
    listener: Arc<dyn ScheduleListener>,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    start_paused: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            driver: None,
            listener: Arc::new(NoopListener),
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimer),
            start_paused: false,
        }
    }
}

impl EngineBuilder {
    pub fn store(mut self, store: impl ScheduleStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn driver(mut self, driver: Arc<dyn AutomationDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ScheduleListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Use one manual clock for both time and timers.
    pub fn manual_clock(self, clock: ManualClock) -> Self {
        let clock = Arc::new(clock);
        self.clock(clock.clone()).timer(clock)
    }

    pub fn start_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    /// Spawn the background task. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<AutomationEngine> {
        let store = self
            .store
            .ok_or_else(|| AutopilotError::construction("engine needs a schedule store"))?;
        let driver = self
            .driver
            .ok_or_else(|| AutopilotError::construction("engine needs a driver"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let core = EngineCore {
            store,
            driver,
            listener: self.listener,
            clock: self.clock,
            timer: self.timer,
            tx: tx.clone(),
            paused: self.start_paused,
            observed: ObservedState::default(),
            tokens: HashMap::new(),
            last_token: 0,
            timers: HashMap::new(),
        };
        tokio::spawn(core.run(rx));
        Ok(AutomationEngine { tx })
    }
}

enum FinishReason {
    LimitReached,
    Expired,
}

/// State owned by the background task.
struct EngineCore {
    store: Box<dyn ScheduleStore>,
    driver: Arc<dyn AutomationDriver>,
    listener: Arc<dyn ScheduleListener>,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    tx: mpsc::UnboundedSender<Command>,
    paused: bool,
    observed: ObservedState,
    /// Current attempt per schedule; callbacks carrying another token are stale.
    tokens: HashMap<String, u64>,
    last_token: u64,
    timers: HashMap<String, TimerHandle>,
}

impl EngineCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(paused = self.paused, "⚙️ Automation engine started");
        self.recover();
        while let Some(command) = rx.recv().await {
            if let Command::Shutdown { reply } = command {
                for (_, timer) in self.timers.drain() {
                    timer.cancel();
                }
                let _ = reply.send(());
                break;
            }
            self.handle(command);
        }
        tracing::info!("⚙️ Automation engine stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule {
                schedules,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.schedule(schedules, metadata));
            }
            Command::Cancel { ids, reply } => {
                let result = self.store.get_by_ids(&ids).and_then(|e| self.remove(e));
                let _ = reply.send(result);
            }
            Command::CancelGroup { group, reply } => {
                let result = self.store.get_by_group(&group).and_then(|e| self.remove(e));
                let _ = reply.send(result);
            }
            Command::CancelAll { reply } => {
                let result = self.store.get_all().and_then(|e| self.remove(e));
                let _ = reply.send(result);
            }
            Command::Edit { id, edits, reply } => {
                let _ = reply.send(self.edit(&id, &edits));
            }
            Command::GetSchedule { id, reply } => {
                let result = self.store.get(&id).map(|entry| {
                    entry
                        .filter(|e| e.state != ScheduleState::Finished)
                        .map(|e| e.schedule)
                });
                let _ = reply.send(result);
            }
            Command::GetSchedules { group, reply } => {
                let entries = match &group {
                    Some(group) => self.store.get_by_group(group),
                    None => self.store.get_all(),
                };
                let result = entries.map(|entries| {
                    entries
                        .into_iter()
                        .filter(|e| e.state != ScheduleState::Finished)
                        .map(|e| e.schedule)
                        .collect()
                });
                let _ = reply.send(result);
            }
            Command::GetState { id, reply } => {
                let _ = reply.send(self.store.get(&id).map(|e| e.map(|e| e.state)));
            }
            Command::SetPaused(paused) => self.set_paused(paused),
            Command::Event(event) => self.process_event(event),
            Command::PrepareFinished { id, token, result } => {
                self.on_prepare_finished(&id, token, result)
            }
            Command::ExecuteFinished { id, token } => self.on_execute_finished(&id, token),
            Command::TimerFired { id, token } => self.on_timer_fired(&id, token),
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ─── Bookkeeping ──────────────────────────────────────────

    fn begin_attempt(&mut self, id: &str) -> u64 {
        self.last_token += 1;
        self.tokens.insert(id.to_string(), self.last_token);
        self.last_token
    }

    fn is_current(&self, id: &str, token: u64) -> bool {
        self.tokens.get(id) == Some(&token)
    }

    /// Drop any in-flight attempt and pending timer for `id`.
    fn forget(&mut self, id: &str) {
        self.tokens.remove(id);
        if let Some(timer) = self.timers.remove(id) {
            timer.cancel();
        }
    }

    fn arm_timer(&mut self, id: &str, wake: DateTime<Utc>, now: DateTime<Utc>) {
        self.forget(id);
        let token = self.begin_attempt(id);
        let delay = (wake - now).to_std().unwrap_or_default();
        let tx = self.tx.clone();
        let schedule_id = id.to_string();
        let handle = self.timer.schedule(
            delay,
            Box::new(move || {
                let _ = tx.send(Command::TimerFired {
                    id: schedule_id,
                    token,
                });
            }),
        );
        self.timers.insert(id.to_string(), handle);
    }

    fn persist(&mut self, entry: &ScheduleEntry) -> bool {
        match self.store.save(std::slice::from_ref(entry)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(schedule_id = %entry.id(), state = %entry.state, "⚠️ Failed to persist schedule: {e}");
                false
            }
        }
    }

    fn load(&self, id: &str) -> Option<ScheduleEntry> {
        match self.store.get(id) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(schedule_id = %id, "⚠️ Failed to load schedule: {e}");
                None
            }
        }
    }

    fn load_states(&self, states: &[ScheduleState]) -> Vec<ScheduleEntry> {
        match self.store.get_by_states(states) {
            Ok(mut entries) => {
                entries.sort_by_key(|e| (e.schedule.priority, e.sequence));
                entries
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to load schedules: {e}");
                Vec::new()
            }
        }
    }

    // ─── Public operations ────────────────────────────────────

    fn schedule(&mut self, schedules: Vec<Schedule>, metadata: JsonValue) -> Result<Vec<String>> {
        for schedule in &schedules {
            schedule.validate()?;
        }
        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut replaced = Vec::new();
        let mut accepted = Vec::new();
        for mut schedule in schedules {
            if !seen.insert(schedule.id.clone()) {
                tracing::warn!(schedule_id = %schedule.id, "Duplicate id in batch, skipped");
                continue;
            }
            match self.store.get(&schedule.id)? {
                Some(existing) if existing.state != ScheduleState::Finished => {
                    tracing::warn!(schedule_id = %schedule.id, "Schedule id already in use, skipped");
                    continue;
                }
                Some(_) => replaced.push(schedule.id.clone()),
                None => {}
            }
            if !metadata.is_null() {
                schedule.metadata = metadata.clone();
            }
            accepted.push(ScheduleEntry::new(schedule, now));
        }
        self.store.delete(&replaced)?;
        self.store.save(&accepted)?;

        for entry in &accepted {
            tracing::info!(schedule_id = %entry.id(), priority = entry.schedule.priority, "📅 Schedule added");
            self.listener.on_new_schedule(&entry.schedule);
        }
        Ok(accepted.into_iter().map(|e| e.schedule.id).collect())
    }

    /// Delete entries, notifying for those that were still live.
    fn remove(&mut self, entries: Vec<ScheduleEntry>) -> Result<usize> {
        let ids: Vec<String> = entries.iter().map(|e| e.schedule.id.clone()).collect();
        self.store.delete(&ids)?;
        let mut cancelled = 0;
        for entry in &entries {
            self.forget(entry.id());
            if entry.state != ScheduleState::Finished {
                tracing::info!(schedule_id = %entry.id(), "🗑️ Schedule cancelled");
                self.listener.on_schedule_cancelled(&entry.schedule);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn edit(&mut self, id: &str, edits: &ScheduleEdits) -> Result<Option<Schedule>> {
        let Some(mut entry) = self.store.get(id)? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let edited = edits.apply(&entry.schedule)?;

        if entry.state == ScheduleState::Finished {
            if !entry.is_in_grace_period(now) {
                self.store.delete(&[id.to_string()])?;
                return Ok(None);
            }
            entry.schedule = edited;
            if !entry.is_limit_reached() && !entry.schedule.is_expired(now) {
                entry.reset_progress();
                entry.set_state(ScheduleState::Idle, now);
                tracing::info!(schedule_id = %id, count = entry.execution_count, "♻️ Schedule revived by edit");
            }
            self.store.save(std::slice::from_ref(&entry))?;
            return Ok(Some(entry.schedule));
        }

        entry.schedule = edited;
        let schedule = entry.schedule.clone();
        tracing::info!(schedule_id = %id, state = %entry.state, "✏️ Schedule edited");
        if entry.schedule.is_expired(now) {
            self.finish(entry, FinishReason::Expired)?;
        } else if entry.is_limit_reached() {
            self.finish(entry, FinishReason::LimitReached)?;
        } else if entry.state == ScheduleState::Paused {
            let wake = entry.state_changed_at + entry.schedule.interval();
            if wake <= now {
                self.forget(id);
                entry.set_state(ScheduleState::Idle, now);
                self.store.save(std::slice::from_ref(&entry))?;
            } else {
                entry.delay_finish_at = Some(wake);
                self.store.save(std::slice::from_ref(&entry))?;
                self.arm_timer(id, wake, now);
            }
        } else {
            self.store.save(std::slice::from_ref(&entry))?;
        }
        Ok(Some(schedule))
    }

    fn set_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        tracing::info!(paused, "⏯️ Automation engine paused state changed");
        if !paused {
            let now = self.clock.now();
            for entry in self.load_states(&[ScheduleState::Idle, ScheduleState::TimeDelayed]) {
                match entry.state {
                    ScheduleState::Idle if entry.is_triggered() => self.start_cycle(entry, now),
                    ScheduleState::TimeDelayed
                        if entry.delay_finish_at.is_none_or(|wake| wake <= now) =>
                    {
                        self.delay_elapsed(entry, now)
                    }
                    _ => {}
                }
            }
        }
    }

    // ─── Event processing ─────────────────────────────────────

    fn process_event(&mut self, event: AutomationEvent) {
        let now = self.clock.now();
        self.expire_lapsed(now);
        let observed_changed = self.observed.observe(&event);

        let mut fired: Vec<String> = Vec::new();
        let mut cancelled: Vec<String> = Vec::new();
        for update in event.trigger_updates() {
            let triggers = match self.store.get_active_triggers(update.trigger_type, None, now) {
                Ok(triggers) => triggers,
                Err(e) => {
                    tracing::warn!(trigger_type = %update.trigger_type, "⚠️ Failed to load triggers: {e}");
                    continue;
                }
            };
            let mut changed = Vec::new();
            for mut trigger in triggers {
                let Some(reached) = trigger.process(&update) else {
                    continue;
                };
                if reached {
                    let target = if trigger.cancellation { &mut cancelled } else { &mut fired };
                    if !target.contains(&trigger.schedule_id) {
                        target.push(trigger.schedule_id.clone());
                    }
                }
                changed.push(trigger);
            }
            if changed.is_empty() {
                continue;
            }
            tracing::debug!(trigger_type = %update.trigger_type, count = changed.len(), "Trigger progress updated");
            if let Err(e) = self.store.save_triggers(&changed) {
                tracing::warn!(trigger_type = %update.trigger_type, "⚠️ Failed to save trigger progress: {e}");
            }
        }

        for id in &cancelled {
            self.abandon_wait(id, now);
        }
        if !fired.is_empty() {
            self.start_fired(&fired, now);
        }
        if observed_changed {
            self.check_waiting(now);
        }
    }

    fn start_fired(&mut self, ids: &[String], now: DateTime<Utc>) {
        if self.paused {
            tracing::debug!(count = ids.len(), "Engine paused, triggered schedules held");
            return;
        }
        let mut entries = match self.store.get_by_ids(ids) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("⚠️ Failed to load triggered schedules: {e}");
                return;
            }
        };
        entries.sort_by_key(|e| (e.schedule.priority, e.sequence));
        for entry in entries {
            if entry.state == ScheduleState::Idle && entry.is_triggered() {
                tracing::info!(schedule_id = %entry.id(), "🔔 Schedule triggered");
                self.start_cycle(entry, now);
            }
        }
    }

    fn abandon_wait(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(mut entry) = self.load(id) else {
            return;
        };
        if entry.state != ScheduleState::WaitingScheduleConditions {
            return;
        }
        entry.reset_progress();
        entry.set_state(ScheduleState::Idle, now);
        if self.persist(&entry) {
            tracing::info!(schedule_id = %id, "🚫 Cancellation trigger fired, wait abandoned");
        }
    }

    fn check_waiting(&mut self, now: DateTime<Utc>) {
        for entry in self.load_states(&[ScheduleState::WaitingScheduleConditions]) {
            let met = entry
                .schedule
                .delay
                .as_ref()
                .is_none_or(|delay| delay.conditions_met(&self.observed));
            if met {
                self.execute(entry, now);
            }
        }
    }

    /// Finish every live entry past its end and purge lapsed finished ones.
    fn expire_lapsed(&mut self, now: DateTime<Utc>) {
        match self.store.get_active_expired(now) {
            Ok(entries) => {
                for entry in entries {
                    let id = entry.schedule.id.clone();
                    if let Err(e) = self.finish(entry, FinishReason::Expired) {
                        tracing::warn!(schedule_id = %id, "⚠️ Failed to expire schedule: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("⚠️ Failed to query expired schedules: {e}"),
        }

        let lapsed: Vec<String> = self
            .load_states(&[ScheduleState::Finished])
            .into_iter()
            .filter(|e| !e.is_in_grace_period(now))
            .map(|e| e.schedule.id)
            .collect();
        if lapsed.is_empty() {
            return;
        }
        match self.store.delete(&lapsed) {
            Ok(n) => tracing::debug!(count = n, "Purged finished schedules past their grace period"),
            Err(e) => tracing::warn!("⚠️ Failed to purge finished schedules: {e}"),
        }
    }

    // ─── State machine ────────────────────────────────────────

    fn start_cycle(&mut self, mut entry: ScheduleEntry, now: DateTime<Utc>) {
        if entry.schedule.is_expired(now) {
            self.finish_logged(entry, FinishReason::Expired);
            return;
        }
        if !entry.schedule.has_started(now) {
            return;
        }
        let delay = entry.schedule.delay_seconds();
        if delay == 0 {
            self.prepare(entry, now);
            return;
        }
        let wake = now + chrono::Duration::seconds(delay as i64);
        entry.set_state(ScheduleState::TimeDelayed, now);
        entry.delay_finish_at = Some(wake);
        if self.persist(&entry) {
            tracing::info!(schedule_id = %entry.id(), delay_secs = delay, "⏳ Schedule delayed");
            self.arm_timer(entry.id(), wake, now);
        }
    }

    fn delay_elapsed(&mut self, entry: ScheduleEntry, now: DateTime<Utc>) {
        if self.paused {
            tracing::debug!(schedule_id = %entry.id(), "Engine paused, delayed schedule held");
            return;
        }
        if entry.schedule.is_expired(now) {
            self.finish_logged(entry, FinishReason::Expired);
            return;
        }
        self.prepare(entry, now);
    }

    fn prepare(&mut self, mut entry: ScheduleEntry, now: DateTime<Utc>) {
        self.forget(entry.id());
        entry.set_state(ScheduleState::PreparingSchedule, now);
        if !self.persist(&entry) {
            return;
        }
        let token = self.begin_attempt(entry.id());
        tracing::info!(schedule_id = %entry.id(), priority = entry.schedule.priority, "📋 Preparing schedule");
        let callback = PrepareCallback::new(entry.id(), token, self.tx.clone());
        self.driver.on_prepare_schedule(&entry.schedule, callback);
    }

    fn on_prepare_finished(&mut self, id: &str, token: u64, result: PrepareResult) {
        if !self.is_current(id, token) {
            tracing::debug!(schedule_id = %id, ?result, "Stale prepare result ignored");
            return;
        }
        self.tokens.remove(id);
        let Some(mut entry) = self.load(id) else {
            return;
        };
        if entry.state != ScheduleState::PreparingSchedule {
            return;
        }
        let now = self.clock.now();
        tracing::debug!(schedule_id = %id, ?result, "Prepare finished");

        match result {
            PrepareResult::Continue => {
                if entry.schedule.is_expired(now) {
                    self.finish_logged(entry, FinishReason::Expired);
                    return;
                }
                let met = entry
                    .schedule
                    .delay
                    .as_ref()
                    .is_none_or(|delay| delay.conditions_met(&self.observed));
                if met {
                    self.execute(entry, now);
                } else {
                    entry.reset_cancellation_progress();
                    entry.set_state(ScheduleState::WaitingScheduleConditions, now);
                    if self.persist(&entry) {
                        tracing::info!(schedule_id = %id, "⏸️ Waiting on schedule conditions");
                    }
                }
            }
            PrepareResult::Cancel => {
                if let Err(e) = self.remove(vec![entry]) {
                    tracing::warn!(schedule_id = %id, "⚠️ Failed to delete cancelled schedule: {e}");
                }
            }
            PrepareResult::Skip => {
                entry.set_state(ScheduleState::Idle, now);
                if self.persist(&entry) {
                    tracing::info!(schedule_id = %id, "⏭️ Schedule skipped");
                }
            }
            PrepareResult::Penalize => {
                tracing::info!(schedule_id = %id, "Schedule penalized");
                self.complete_cycle(entry, now, false);
            }
            PrepareResult::Invalidate => {
                tracing::info!(schedule_id = %id, "🔁 Preparation invalidated, preparing again");
                self.prepare(entry, now);
            }
        }
    }

    fn execute(&mut self, mut entry: ScheduleEntry, now: DateTime<Utc>) {
        self.forget(entry.id());
        entry.set_state(ScheduleState::Executing, now);
        if !self.persist(&entry) {
            return;
        }
        let token = self.begin_attempt(entry.id());
        tracing::info!(schedule_id = %entry.id(), "🚀 Executing schedule");
        let callback = ExecuteCallback::new(entry.id(), token, self.tx.clone());
        self.driver.on_execute_schedule(&entry.schedule, callback);
    }

    fn on_execute_finished(&mut self, id: &str, token: u64) {
        if !self.is_current(id, token) {
            tracing::debug!(schedule_id = %id, "Stale execution result ignored");
            return;
        }
        self.tokens.remove(id);
        let Some(entry) = self.load(id) else {
            return;
        };
        if entry.state != ScheduleState::Executing {
            return;
        }
        let now = self.clock.now();
        self.complete_cycle(entry, now, true);
    }

    /// End of one cycle: bump the count (unless penalized), reset progress,
    /// then finish, cool down, or go idle.
    fn complete_cycle(&mut self, mut entry: ScheduleEntry, now: DateTime<Utc>, counted: bool) {
        if counted {
            entry.execution_count += 1;
            entry.last_execution_at = Some(now);
            tracing::info!(schedule_id = %entry.id(), count = entry.execution_count, "✅ Schedule executed");
        }
        entry.reset_progress();

        if entry.is_limit_reached() {
            self.finish_logged(entry, FinishReason::LimitReached);
        } else if entry.schedule.is_expired(now) {
            self.finish_logged(entry, FinishReason::Expired);
        } else if entry.schedule.interval_secs > 0 {
            let wake = now + entry.schedule.interval();
            entry.set_state(ScheduleState::Paused, now);
            entry.delay_finish_at = Some(wake);
            if self.persist(&entry) {
                tracing::info!(schedule_id = %entry.id(), interval_secs = entry.schedule.interval_secs, "💤 Cooling down");
                self.arm_timer(entry.id(), wake, now);
            }
        } else {
            entry.set_state(ScheduleState::Idle, now);
            self.persist(&entry);
        }
    }

    fn on_timer_fired(&mut self, id: &str, token: u64) {
        if !self.is_current(id, token) {
            return;
        }
        self.tokens.remove(id);
        self.timers.remove(id);
        let Some(entry) = self.load(id) else {
            return;
        };
        let now = self.clock.now();
        match entry.state {
            ScheduleState::TimeDelayed => self.delay_elapsed(entry, now),
            ScheduleState::Paused => self.end_cooldown(entry, now),
            state => tracing::debug!(schedule_id = %id, %state, "Timer fired in unexpected state"),
        }
    }

    fn end_cooldown(&mut self, mut entry: ScheduleEntry, now: DateTime<Utc>) {
        if entry.schedule.is_expired(now) {
            self.finish_logged(entry, FinishReason::Expired);
            return;
        }
        entry.set_state(ScheduleState::Idle, now);
        if self.persist(&entry) {
            tracing::info!(schedule_id = %entry.id(), "⏰ Cooldown over");
        }
    }

    fn finish(&mut self, mut entry: ScheduleEntry, reason: FinishReason) -> Result<()> {
        let now = self.clock.now();
        entry.set_state(ScheduleState::Finished, now);
        if entry.schedule.edit_grace_period_secs > 0 {
            self.store.save(std::slice::from_ref(&entry))?;
        } else {
            self.store.delete(&[entry.schedule.id.clone()])?;
        }
        // A failed finish leaves pending callbacks current.
        self.forget(entry.id());
        match reason {
            FinishReason::LimitReached => {
                tracing::info!(schedule_id = %entry.id(), count = entry.execution_count, "🏁 Schedule limit reached");
                self.listener.on_schedule_limit_reached(&entry.schedule);
            }
            FinishReason::Expired => {
                tracing::info!(schedule_id = %entry.id(), "⌛ Schedule expired");
                self.listener.on_schedule_expired(&entry.schedule);
            }
        }
        Ok(())
    }

    fn finish_logged(&mut self, entry: ScheduleEntry, reason: FinishReason) {
        let id = entry.schedule.id.clone();
        if let Err(e) = self.finish(entry, reason) {
            tracing::warn!(schedule_id = %id, "⚠️ Failed to finish schedule: {e}");
        }
    }

    // ─── Recovery ─────────────────────────────────────────────

    /// Bring persisted entries back in line with the clock after a restart.
    fn recover(&mut self) {
        let now = self.clock.now();
        self.expire_lapsed(now);
        let entries = match self.store.get_all() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("⚠️ Recovery skipped, failed to load schedules: {e}");
                return;
            }
        };
        let total = entries.len();
        for entry in entries {
            let wake = entry.delay_finish_at;
            match entry.state {
                ScheduleState::TimeDelayed => match wake {
                    Some(wake) if wake > now => self.arm_timer(entry.id(), wake, now),
                    _ => self.delay_elapsed(entry, now),
                },
                ScheduleState::Paused => match wake {
                    Some(wake) if wake > now => self.arm_timer(entry.id(), wake, now),
                    _ => self.end_cooldown(entry, now),
                },
                ScheduleState::PreparingSchedule => self.prepare(entry, now),
                ScheduleState::Executing => {
                    tracing::warn!(schedule_id = %entry.id(), "Execution interrupted, counting it as finished");
                    self.complete_cycle(entry, now, true);
                }
                ScheduleState::Idle if !self.paused && entry.is_triggered() => {
                    self.start_cycle(entry, now)
                }
                _ => {}
            }
        }
        tracing::info!(schedules = total, "🔄 Recovery complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteScheduleStore;
    use crate::event::TriggerType;
    use crate::schedule::ScheduleDelay;
    use crate::trigger::{Trigger, TriggerEntry};
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDriver {
        /// `None` holds prepare callbacks for the test to complete.
        prepare_result: Mutex<Option<PrepareResult>>,
        hold_execution: AtomicBool,
        log: Mutex<Vec<String>>,
        prepared_data: Mutex<Vec<JsonValue>>,
        held_prepares: Mutex<Vec<PrepareCallback>>,
        held_executions: Mutex<Vec<ExecuteCallback>>,
    }

    impl RecordingDriver {
        fn continuing() -> Arc<Self> {
            let driver = Self::default();
            *driver.prepare_result.lock().unwrap() = Some(PrepareResult::Continue);
            Arc::new(driver)
        }

        fn set_prepare_result(&self, result: Option<PrepareResult>) {
            *self.prepare_result.lock().unwrap() = result;
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn prepares(&self) -> Vec<String> {
            self.log()
                .into_iter()
                .filter_map(|l| l.strip_prefix("prepare:").map(str::to_string))
                .collect()
        }

        fn executions(&self) -> usize {
            self.log().iter().filter(|l| l.starts_with("execute:")).count()
        }

        fn take_prepare(&self) -> PrepareCallback {
            self.held_prepares.lock().unwrap().remove(0)
        }
    }

    impl AutomationDriver for RecordingDriver {
        fn on_prepare_schedule(&self, schedule: &Schedule, callback: PrepareCallback) {
            self.log.lock().unwrap().push(format!("prepare:{}", schedule.id));
            self.prepared_data.lock().unwrap().push(schedule.data.clone());
            let result = *self.prepare_result.lock().unwrap();
            match result {
                Some(result) => callback.finish(result),
                None => self.held_prepares.lock().unwrap().push(callback),
            }
        }

        fn on_execute_schedule(&self, schedule: &Schedule, callback: ExecuteCallback) {
            self.log.lock().unwrap().push(format!("execute:{}", schedule.id));
            if self.hold_execution.load(Ordering::SeqCst) {
                self.held_executions.lock().unwrap().push(callback);
            } else {
                callback.finish();
            }
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, kind: &str, schedule: &Schedule) {
            self.events.lock().unwrap().push(format!("{kind}:{}", schedule.id));
        }
    }

    impl ScheduleListener for RecordingListener {
        fn on_new_schedule(&self, schedule: &Schedule) {
            self.record("new", schedule);
        }

        fn on_schedule_cancelled(&self, schedule: &Schedule) {
            self.record("cancelled", schedule);
        }

        fn on_schedule_expired(&self, schedule: &Schedule) {
            self.record("expired", schedule);
        }

        fn on_schedule_limit_reached(&self, schedule: &Schedule) {
            self.record("limit", schedule);
        }
    }

    struct Harness {
        engine: AutomationEngine,
        clock: ManualClock,
        driver: Arc<RecordingDriver>,
        listener: Arc<RecordingListener>,
    }

    impl Harness {
        fn start(
            store: impl ScheduleStore + 'static,
            driver: Arc<RecordingDriver>,
            paused: bool,
        ) -> Self {
            let clock = ManualClock::new(t0());
            let listener = Arc::new(RecordingListener::default());
            let engine = AutomationEngine::builder()
                .store(store)
                .driver(driver.clone())
                .listener(listener.clone())
                .manual_clock(clock.clone())
                .start_paused(paused)
                .start()
                .unwrap();
            Self {
                engine,
                clock,
                driver,
                listener,
            }
        }

        fn new() -> Self {
            Self::start(
                SqliteScheduleStore::open_in_memory().unwrap(),
                RecordingDriver::continuing(),
                false,
            )
        }

        /// Drain the queue, including work queued by callbacks.
        async fn settle(&self) {
            for _ in 0..16 {
                self.engine.get_state("").await.unwrap();
            }
        }

        async fn event(&self, name: &str) {
            self.engine.custom_event(name, None, JsonValue::Null).unwrap();
            self.settle().await;
        }

        async fn advance(&self, secs: u64) {
            self.clock.advance(Duration::from_secs(secs));
            self.settle().await;
        }

        async fn state(&self, id: &str) -> Option<ScheduleState> {
            self.engine.get_state(id).await.unwrap()
        }

        async fn add(&self, schedule: Schedule) {
            assert!(self.engine.schedule(schedule, JsonValue::Null).await.unwrap());
        }
    }

    /// Delegates to SQLite but rejects writes for the ids in `failing`.
    struct FailingStore {
        inner: SqliteScheduleStore,
        failing: Arc<Mutex<Vec<String>>>,
    }

    impl FailingStore {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let failing = Arc::new(Mutex::new(Vec::new()));
            let store = Self {
                inner: SqliteScheduleStore::open_in_memory().unwrap(),
                failing: failing.clone(),
            };
            (store, failing)
        }

        fn check<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
            let failing = self.failing.lock().unwrap();
            match ids.into_iter().find(|id| failing.iter().any(|f| f == id)) {
                Some(id) => Err(AutopilotError::storage(format!("disk full writing {id}"))),
                None => Ok(()),
            }
        }
    }

    impl ScheduleStore for FailingStore {
        fn get_all(&self) -> Result<Vec<ScheduleEntry>> {
            self.inner.get_all()
        }

        fn get(&self, id: &str) -> Result<Option<ScheduleEntry>> {
            self.inner.get(id)
        }

        fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ScheduleEntry>> {
            self.inner.get_by_ids(ids)
        }

        fn get_by_group(&self, group: &str) -> Result<Vec<ScheduleEntry>> {
            self.inner.get_by_group(group)
        }

        fn get_by_states(&self, states: &[ScheduleState]) -> Result<Vec<ScheduleEntry>> {
            self.inner.get_by_states(states)
        }

        fn get_active_triggers(
            &self,
            trigger_type: TriggerType,
            schedule_id: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<Vec<TriggerEntry>> {
            self.inner.get_active_triggers(trigger_type, schedule_id, now)
        }

        fn get_active_expired(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
            self.inner.get_active_expired(now)
        }

        fn save(&mut self, entries: &[ScheduleEntry]) -> Result<()> {
            self.check(entries.iter().map(|e| e.id()))?;
            self.inner.save(entries)
        }

        fn save_triggers(&mut self, triggers: &[TriggerEntry]) -> Result<()> {
            self.inner.save_triggers(triggers)
        }

        fn delete(&mut self, ids: &[String]) -> Result<usize> {
            self.check(ids.iter().map(String::as_str))?;
            self.inner.delete(ids)
        }

        fn delete_group(&mut self, group: &str) -> Result<usize> {
            self.inner.delete_group(group)
        }

        fn delete_all(&mut self) -> Result<usize> {
            self.inner.delete_all()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
    }

    fn on_x(id: &str) -> crate::schedule::ScheduleBuilder {
        Schedule::builder_with_id(id).trigger(Trigger::custom_event("X", 1.0).unwrap())
    }

    #[tokio::test]
    async fn test_limit_reached_deletes_entry() {
        let h = Harness::new();
        h.add(on_x("s").limit(2).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.driver.log(), vec!["prepare:s", "execute:s"]);
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));

        h.event("Y").await;
        assert_eq!(h.driver.log().len(), 2);

        h.event("X").await;
        assert_eq!(h.driver.executions(), 2);
        assert_eq!(h.state("s").await, None);
        assert_eq!(h.listener.events(), vec!["new:s", "limit:s"]);

        h.event("X").await;
        assert_eq!(h.driver.log().len(), 4);
    }

    #[tokio::test]
    async fn test_interval_pauses_until_elapsed() {
        let h = Harness::new();
        h.add(on_x("s").limit(0).interval_secs(10).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Paused));
        // Triggers are inactive while cooling down.
        h.event("X").await;
        assert_eq!(h.driver.executions(), 1);

        h.advance(9).await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Paused));
        h.advance(1).await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));

        h.event("X").await;
        assert_eq!(h.driver.executions(), 2);
    }

    #[tokio::test]
    async fn test_prepare_follows_priority_then_creation_order() {
        let h = Harness::new();
        h.add(on_x("c").priority(5).build().unwrap()).await;
        h.add(on_x("a").priority(-1).build().unwrap()).await;
        h.add(on_x("b2").priority(3).build().unwrap()).await;
        h.add(on_x("b1").priority(3).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.driver.prepares(), vec!["a", "b2", "b1", "c"]);
        assert_eq!(h.driver.executions(), 4);
    }

    #[tokio::test]
    async fn test_edit_end_into_past_finishes_without_driver() {
        let h = Harness::new();
        h.add(on_x("s").build().unwrap()).await;

        let edited = h
            .engine
            .edit_schedule("s", ScheduleEdits::new().end(t0()))
            .await
            .unwrap();
        assert_eq!(edited.unwrap().end, Some(t0()));
        assert_eq!(h.state("s").await, None);
        assert!(h.driver.log().is_empty());
        assert_eq!(h.listener.events(), vec!["new:s", "expired:s"]);
    }

    #[tokio::test]
    async fn test_edit_unknown_and_invalid() {
        let h = Harness::new();
        let missing = h.engine.edit_schedule("nope", ScheduleEdits::new().limit(3)).await;
        assert!(missing.unwrap().is_none());

        h.add(on_x("s").start(t0() + chrono::Duration::hours(1)).build().unwrap()).await;
        let err = h
            .engine
            .edit_schedule("s", ScheduleEdits::new().end(t0() + chrono::Duration::minutes(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AutopilotError::Construction(_)));
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
    }

    #[tokio::test]
    async fn test_cancel_during_prepare_makes_callback_noop() {
        let driver = Arc::new(RecordingDriver::default());
        let h = Harness::start(SqliteScheduleStore::open_in_memory().unwrap(), driver, false);
        h.add(on_x("s").build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::PreparingSchedule));
        assert_eq!(h.engine.cancel(["s"]).await.unwrap(), 1);

        h.driver.take_prepare().finish(PrepareResult::Continue);
        h.settle().await;
        assert_eq!(h.driver.executions(), 0);
        assert_eq!(h.state("s").await, None);
        assert_eq!(h.listener.events(), vec!["new:s", "cancelled:s"]);
    }

    #[tokio::test]
    async fn test_storage_failure_only_stops_the_affected_schedule() {
        let (store, failing) = FailingStore::new();
        let h = Harness::start(store, RecordingDriver::continuing(), false);
        h.add(on_x("bad").priority(0).build().unwrap()).await;
        h.add(on_x("good").priority(1).build().unwrap()).await;
        failing.lock().unwrap().push("bad".into());

        h.event("X").await;
        assert_eq!(h.driver.log(), vec!["prepare:good", "execute:good"]);
        assert_eq!(h.state("bad").await, Some(ScheduleState::Idle));
        assert_eq!(h.state("good").await, None);
    }

    #[tokio::test]
    async fn test_failed_finish_keeps_prepare_callback_live() {
        let (store, failing) = FailingStore::new();
        let h = Harness::start(store, Arc::new(RecordingDriver::default()), false);
        h.add(on_x("s").end(t0() + chrono::Duration::seconds(60)).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::PreparingSchedule));

        failing.lock().unwrap().push("s".into());
        h.advance(120).await;
        h.event("tick").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::PreparingSchedule));
        assert_eq!(h.listener.events(), vec!["new:s"]);

        failing.lock().unwrap().clear();
        h.driver.take_prepare().finish(PrepareResult::Continue);
        h.settle().await;
        assert_eq!(h.state("s").await, None);
        assert_eq!(h.driver.executions(), 0);
        assert_eq!(h.listener.events(), vec!["new:s", "expired:s"]);
    }

    #[tokio::test]
    async fn test_end_passing_during_cooldown_finishes() {
        let h = Harness::new();
        h.add(
            on_x("s")
                .limit(0)
                .interval_secs(10)
                .end(t0() + chrono::Duration::seconds(5))
                .build()
                .unwrap(),
        )
        .await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Paused));
        h.advance(10).await;
        assert_eq!(h.state("s").await, None);
        assert_eq!(h.listener.events(), vec!["new:s", "expired:s"]);
    }

    #[tokio::test]
    async fn test_negative_value_does_not_offset_later_purchases() {
        let h = Harness::new();
        h.add(
            Schedule::builder_with_id("s")
                .trigger(Trigger::custom_event_value("buy", 10.0).unwrap())
                .build()
                .unwrap(),
        )
        .await;

        h.engine.custom_event("buy", Some(-50.0), JsonValue::Null).unwrap();
        h.engine.custom_event("buy", Some(f64::NAN), JsonValue::Null).unwrap();
        h.settle().await;
        assert!(h.driver.log().is_empty());
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));

        h.engine.custom_event("buy", Some(12.0), JsonValue::Null).unwrap();
        h.settle().await;
        assert_eq!(h.driver.log(), vec!["prepare:s", "execute:s"]);
    }

    #[tokio::test]
    async fn test_seconds_delay() {
        let h = Harness::new();
        h.add(on_x("s").delay(ScheduleDelay::seconds(5)).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::TimeDelayed));
        h.advance(4).await;
        assert!(h.driver.log().is_empty());
        h.advance(1).await;
        assert_eq!(h.driver.log(), vec!["prepare:s", "execute:s"]);
        assert_eq!(h.state("s").await, None);
    }

    #[tokio::test]
    async fn test_waiting_conditions_and_cancellation_triggers() {
        let h = Harness::new();
        let delay = ScheduleDelay {
            screens: vec!["home".into()],
            cancellation_triggers: vec![Trigger::background(1.0).unwrap()],
            ..ScheduleDelay::default()
        };
        h.add(on_x("s").delay(delay).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::WaitingScheduleConditions));

        h.engine.background().unwrap();
        h.settle().await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
        assert_eq!(h.driver.executions(), 0);

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::WaitingScheduleConditions));
        h.engine.screen_view("settings").unwrap();
        h.settle().await;
        assert_eq!(h.driver.executions(), 0);
        h.engine.screen_view("home").unwrap();
        h.settle().await;
        assert_eq!(h.driver.executions(), 1);
        assert_eq!(h.state("s").await, None);
    }

    #[tokio::test]
    async fn test_conditions_already_met_execute_immediately() {
        let h = Harness::new();
        let delay = ScheduleDelay {
            region_id: Some("office".into()),
            ..ScheduleDelay::default()
        };
        h.add(on_x("s").delay(delay).build().unwrap()).await;
        h.engine.region_enter("office").unwrap();
        h.event("X").await;
        assert_eq!(h.driver.executions(), 1);
    }

    #[tokio::test]
    async fn test_pause_gate_holds_then_resumes() {
        let h = Harness::start(
            SqliteScheduleStore::open_in_memory().unwrap(),
            RecordingDriver::continuing(),
            true,
        );
        h.add(on_x("s").build().unwrap()).await;
        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
        assert!(h.driver.log().is_empty());

        h.engine.set_paused(false).unwrap();
        h.settle().await;
        assert_eq!(h.driver.log(), vec!["prepare:s", "execute:s"]);
    }

    #[tokio::test]
    async fn test_skip_and_penalize() {
        let driver = Arc::new(RecordingDriver::default());
        driver.set_prepare_result(Some(PrepareResult::Skip));
        let h = Harness::start(SqliteScheduleStore::open_in_memory().unwrap(), driver, false);
        h.add(on_x("s").interval_secs(30).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
        assert_eq!(h.driver.prepares().len(), 1);

        h.driver.set_prepare_result(Some(PrepareResult::Penalize));
        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Paused));
        assert_eq!(h.driver.executions(), 0);

        h.advance(30).await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
        // Penalized attempts do not use up the limit of one.
        h.driver.set_prepare_result(Some(PrepareResult::Continue));
        h.event("X").await;
        assert_eq!(h.driver.executions(), 1);
        assert_eq!(h.state("s").await, None);
    }

    #[tokio::test]
    async fn test_prepare_cancel_deletes() {
        let driver = Arc::new(RecordingDriver::default());
        driver.set_prepare_result(Some(PrepareResult::Cancel));
        let h = Harness::start(SqliteScheduleStore::open_in_memory().unwrap(), driver, false);
        h.add(on_x("s").build().unwrap()).await;
        h.event("X").await;
        assert_eq!(h.state("s").await, None);
        assert_eq!(h.listener.events(), vec!["new:s", "cancelled:s"]);
    }

    #[tokio::test]
    async fn test_invalidate_prepares_latest_definition() {
        let driver = Arc::new(RecordingDriver::default());
        let h = Harness::start(SqliteScheduleStore::open_in_memory().unwrap(), driver, false);
        h.add(on_x("s").data(JsonValue::from(1i64)).build().unwrap()).await;

        h.event("X").await;
        let first = h.driver.take_prepare();
        h.engine
            .edit_schedule("s", ScheduleEdits::new().data(JsonValue::from(2i64)))
            .await
            .unwrap();
        first.finish(PrepareResult::Invalidate);
        h.settle().await;

        assert_eq!(
            *h.driver.prepared_data.lock().unwrap(),
            vec![JsonValue::from(1i64), JsonValue::from(2i64)]
        );
        h.driver.take_prepare().finish(PrepareResult::Continue);
        h.settle().await;
        assert_eq!(h.driver.executions(), 1);
    }

    #[tokio::test]
    async fn test_grace_period_revival() {
        let h = Harness::new();
        h.add(on_x("s").edit_grace_period_secs(60).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Finished));
        assert!(h.engine.get_schedule("s").await.unwrap().is_none());

        // Same limit: nothing left to run, stays finished.
        h.engine
            .edit_schedule("s", ScheduleEdits::new().priority(2))
            .await
            .unwrap();
        assert_eq!(h.state("s").await, Some(ScheduleState::Finished));

        h.engine
            .edit_schedule("s", ScheduleEdits::new().limit(2))
            .await
            .unwrap();
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
        h.event("X").await;
        assert_eq!(h.driver.executions(), 2);
        assert_eq!(h.state("s").await, Some(ScheduleState::Finished));

        h.clock.advance(Duration::from_secs(61));
        h.event("Y").await;
        assert_eq!(h.state("s").await, None);
        assert_eq!(
            h.listener.events(),
            vec!["new:s", "limit:s", "limit:s"]
        );
    }

    #[tokio::test]
    async fn test_execution_held_then_finished() {
        let driver = RecordingDriver::continuing();
        driver.hold_execution.store(true, Ordering::SeqCst);
        let h = Harness::start(SqliteScheduleStore::open_in_memory().unwrap(), driver, false);
        h.add(on_x("s").limit(0).build().unwrap()).await;

        h.event("X").await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Executing));
        let callback = h.driver.held_executions.lock().unwrap().remove(0);
        assert_eq!(callback.schedule_id(), "s");
        callback.finish();
        h.settle().await;
        assert_eq!(h.state("s").await, Some(ScheduleState::Idle));
    }

    #[tokio::test]
    async fn test_recovery_resumes_interrupted_work() {
        let mut store = SqliteScheduleStore::open_in_memory().unwrap();
        let mut entries = Vec::new();
        let mut push = |schedule: Schedule, state: ScheduleState, wake: Option<i64>| {
            let mut entry = ScheduleEntry::new(schedule, t0());
            entry.state = state;
            entry.delay_finish_at = wake.map(|s| t0() + chrono::Duration::seconds(s));
            entries.push(entry);
        };
        push(on_x("exec").limit(2).build().unwrap(), ScheduleState::Executing, None);
        push(on_x("exec_last").build().unwrap(), ScheduleState::Executing, None);
        push(on_x("prep").build().unwrap(), ScheduleState::PreparingSchedule, None);
        push(on_x("cooled").limit(0).build().unwrap(), ScheduleState::Paused, Some(-5));
        push(on_x("delayed").build().unwrap(), ScheduleState::TimeDelayed, Some(30));
        push(
            on_x("lapsed").end(t0()).build().unwrap(),
            ScheduleState::Idle,
            None,
        );
        store.save(&entries).unwrap();

        let h = Harness::start(store, RecordingDriver::continuing(), false);
        h.settle().await;
        assert_eq!(h.state("exec").await, Some(ScheduleState::Idle));
        assert_eq!(h.state("exec_last").await, None);
        assert_eq!(h.state("prep").await, None);
        assert_eq!(h.state("cooled").await, Some(ScheduleState::Idle));
        assert_eq!(h.state("delayed").await, Some(ScheduleState::TimeDelayed));
        assert_eq!(h.state("lapsed").await, None);
        assert_eq!(h.driver.prepares(), vec!["prep"]);

        h.advance(30).await;
        assert_eq!(h.driver.prepares(), vec!["prep", "delayed"]);
        let events = h.listener.events();
        assert!(events.contains(&"expired:lapsed".to_string()));
        assert!(events.contains(&"limit:exec_last".to_string()));
    }

    #[tokio::test]
    async fn test_batch_duplicates_and_group_cancel() {
        let h = Harness::new();
        let batch = vec![
            on_x("a").group("g").build().unwrap(),
            on_x("b").group("g").build().unwrap(),
            on_x("a").build().unwrap(),
            on_x("c").build().unwrap(),
        ];
        let meta = JsonValue::object([("campaign", JsonValue::from("spring"))]);
        let accepted = h.engine.schedule_multiple(batch, meta.clone()).await.unwrap();
        assert_eq!(accepted, vec!["a", "b", "c"]);
        assert!(!h.engine.schedule(on_x("a").build().unwrap(), JsonValue::Null).await.unwrap());

        let stored = h.engine.get_schedule("a").await.unwrap().unwrap();
        assert_eq!(stored.metadata, meta);
        assert_eq!(h.engine.get_group("g").await.unwrap().len(), 2);

        assert_eq!(h.engine.cancel_group("g").await.unwrap(), 2);
        assert_eq!(h.engine.get_schedules().await.unwrap().len(), 1);
        assert_eq!(h.engine.cancel_all().await.unwrap(), 1);
        assert!(h.engine.get_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_batch_is_rejected_whole() {
        let h = Harness::new();
        let mut bad = on_x("bad").build().unwrap();
        bad.triggers.clear();
        let err = h
            .engine
            .schedule_multiple(vec![on_x("good").build().unwrap(), bad], JsonValue::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, AutopilotError::Construction(_)));
        assert!(h.engine.get_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attached_source_feeds_events() {
        let h = Harness::new();
        h.add(on_x("x").build().unwrap()).await;
        h.add(
            Schedule::builder_with_id("y")
                .trigger(Trigger::custom_event("Y", 1.0).unwrap())
                .build()
                .unwrap(),
        )
        .await;
        let events = vec![
            AutomationEvent::custom("X", None, JsonValue::Null),
            AutomationEvent::custom("Y", None, JsonValue::Null),
        ];
        h.engine
            .attach_source(futures::stream::iter(events))
            .await
            .unwrap();
        h.settle().await;
        assert_eq!(h.driver.executions(), 2);
        assert_eq!(h.state("x").await, None);
        assert_eq!(h.state("y").await, None);
    }

    #[tokio::test]
    async fn test_shutdown_fails_later_calls() {
        let h = Harness::new();
        h.engine.shutdown().await.unwrap();
        assert!(matches!(
            h.engine.get_state("s").await.unwrap_err(),
            AutopilotError::Engine(_)
        ));
        assert!(h.engine.foreground().is_err());
    }

    #[tokio::test]
    async fn test_builder_requires_store_and_driver() {
        assert!(AutomationEngine::builder().start().is_err());
        let err = AutomationEngine::builder()
            .store(SqliteScheduleStore::open_in_memory().unwrap())
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, AutopilotError::Construction(_)));
    }
}
