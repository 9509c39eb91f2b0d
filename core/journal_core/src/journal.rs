//! Async runtime around the day session: wall clock, timers, day rollover.
//!
//! All events funnel through one mutex, so handlers never interleave.

use crate::{
    config::Settings,
    error::{JournalError, StoreError},
    model::{NoteEntry, ShiftEntry, ShiftKind},
    report::Report,
    scheduler::ScheduledTask,
    session::{DaySession, Notification, SessionSnapshot},
    store::{LogStore, SqliteStore},
};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::{
    path::PathBuf,
    sync::{Arc, Weak},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

pub type StoreFactory =
    Box<dyn Fn(NaiveDate) -> Result<Box<dyn LogStore>, StoreError> + Send + Sync>;

struct Inner {
    session: DaySession,
    auto_note: Option<ScheduledTask>,
    timers: Vec<ScheduledTask>,
}

impl Inner {
    fn cancel_auto_note(&mut self) {
        if let Some(task) = self.auto_note.take() {
            task.cancel();
        }
    }

    fn stop_timers(&mut self) {
        for task in self.timers.drain(..) {
            task.cancel();
        }
        self.cancel_auto_note();
    }
}

pub struct Journal {
    inner: Mutex<Inner>,
    settings: Settings,
    open_store: StoreFactory,
    clock: Arc<dyn Clock>,
}

impl Journal {
    /// Opens today's journal under `data_dir`.
    pub fn open(
        data_dir: PathBuf,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, JournalError> {
        let factory: StoreFactory = Box::new(move |date| {
            let store = SqliteStore::open(&data_dir, date)?;
            Ok(Box::new(store) as Box<dyn LogStore>)
        });
        Self::with_store_factory(settings, clock, factory)
    }

    pub fn with_store_factory(
        settings: Settings,
        clock: Arc<dyn Clock>,
        open_store: StoreFactory,
    ) -> Result<Arc<Self>, JournalError> {
        let now = clock.now();
        let store = open_store(now.date())?;
        let session = DaySession::open(store, &settings.categories, now);
        info!(
            "journal open for {} ({} categories)",
            session.date(),
            settings.categories.len()
        );
        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                session,
                auto_note: None,
                timers: Vec::new(),
            }),
            settings,
            open_store,
            clock,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Spawns the tick and prompt loops. They run until shutdown.
    pub async fn start_timers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let tick = ScheduledTask::every("tick", self.settings.tick_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(journal) = weak.upgrade() {
                    if let Err(err) = journal.tick().await {
                        warn!("tick failed: {err}");
                    }
                }
            }
        });

        let weak = Arc::downgrade(self);
        let prompt = ScheduledTask::every("prompt", self.settings.prompt_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(journal) = weak.upgrade() {
                    journal.prompt().await;
                }
            }
        });
        let mut inner = self.inner.lock().await;
        inner.stop_timers();
        inner.timers = vec![tick, prompt];
    }

    pub async fn timers_running(&self) -> bool {
        !self.inner.lock().await.timers.is_empty()
    }

    /// Swaps in a fresh session once the wall clock has crossed midnight.
    /// The old day is closed at 23:59:59; an open shift or lunch and the
    /// active category continue from 00:00:00.
    fn roll_over(&self, inner: &mut Inner, now: NaiveDateTime) -> Result<(), JournalError> {
        let current = inner.session.date();
        if now.date() <= current {
            return Ok(());
        }

        let carry = inner.session.carry();
        let end = current.and_time(NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default());
        if let Err(err) = inner.session.close_day(end) {
            warn!("could not close {current} cleanly: {err}");
        }
        inner.cancel_auto_note();

        let midnight = now.date().and_time(NaiveTime::default());
        let store = (self.open_store)(now.date())?;
        let mut session = DaySession::open(store, &self.settings.categories, midnight);
        session.continue_from(&carry, midnight)?;
        info!(
            "rolled over from {current} to {} carrying {} ({})",
            now.date(),
            carry.category,
            carry.shift
        );
        inner.session = session;
        Ok(())
    }

    pub async fn category_selected(&self, category: &str) -> Result<SessionSnapshot, JournalError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.roll_over(&mut inner, now)?;
        inner.session.on_category_selected(category, now)?;
        inner.cancel_auto_note();
        Ok(inner.session.snapshot(now))
    }

    pub async fn note_submitted(
        &self,
        text: &str,
        subcategory: Option<&str>,
    ) -> Result<NoteEntry, JournalError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.roll_over(&mut inner, now)?;
        let note = inner.session.on_note_submitted(text, subcategory, now)?;
        inner.cancel_auto_note();
        Ok(note)
    }

    pub async fn shift_button(&self, kind: ShiftKind) -> Result<ShiftEntry, JournalError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.roll_over(&mut inner, now)?;
        let entry = inner.session.on_shift_button(kind, now)?;
        if kind == ShiftKind::LunchOut {
            inner.cancel_auto_note();
        }
        Ok(entry)
    }

    pub async fn tick(&self) -> Result<Option<NoteEntry>, JournalError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if inner.session.is_closed() {
            return Ok(None);
        }
        self.roll_over(&mut inner, now)?;
        inner.session.on_tick(now)
    }

    /// Stops the timers, then writes the final flush and shutdown marker.
    pub async fn shutdown(&self) -> Result<(), JournalError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.stop_timers();
        self.roll_over(&mut inner, now)?;
        inner.session.on_shutdown_requested(now)
    }

    /// Builds today's report and writes its artifacts next to the log.
    pub async fn report(&self) -> Result<Report, JournalError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.roll_over(&mut inner, now)?;
        let report = inner.session.report(now)?;
        if let Err(err) = inner.session.write_report_artifacts(&report) {
            warn!("could not write report artifacts: {err}");
        }
        Ok(report)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let now = self.clock.now();
        self.inner.lock().await.session.snapshot(now)
    }

    pub async fn drain_notifications(&self) -> Vec<Notification> {
        self.inner.lock().await.session.drain_notifications()
    }

    pub async fn auto_note_pending(&self) -> bool {
        self.inner.lock().await.auto_note.is_some()
    }

    /// Asks the user for a note and arms the auto-note timeout. Muted while
    /// on lunch; a prompt already awaiting an answer is not re-armed.
    pub async fn prompt(self: &Arc<Self>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if inner.session.is_closed() {
            return;
        }
        if let Err(err) = self.roll_over(&mut inner, now) {
            warn!("rollover before prompt failed: {err}");
        }
        if inner.session.should_suspend_prompting() {
            debug!("on lunch; prompt suppressed");
            return;
        }
        if inner.auto_note.is_some() {
            debug!("previous prompt still open");
            return;
        }

        inner.session.notify(Notification::PromptForNote);
        let weak: Weak<Self> = Arc::downgrade(self);
        inner.auto_note = Some(ScheduledTask::once(
            "auto_note",
            self.settings.prompt_timeout(),
            async move {
                if let Some(journal) = weak.upgrade() {
                    journal.fire_auto_note().await;
                }
            },
        ));
        debug!("prompted for note at {}", now.time());
    }

    async fn fire_auto_note(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        // This runs inside the task the handle owns; aborting it here would
        // cancel ourselves mid-write.
        if let Some(task) = inner.auto_note.take() {
            task.detach();
        }
        if inner.session.is_closed() {
            return;
        }
        if let Err(err) = self.roll_over(&mut inner, now) {
            warn!("rollover before auto-note failed: {err}");
        }
        match inner.session.on_auto_note(now) {
            Ok(_) => info!("no answer to prompt; auto-note saved at {}", now.time()),
            Err(err) => warn!("auto-note failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::DEFAULT_CATEGORY, shift::ShiftState};
    use std::sync::Mutex as StdMutex;

    struct ManualClock(StdMutex<NaiveDateTime>);

    impl ManualClock {
        fn at(t: NaiveDateTime) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(t)))
        }

        fn set(&self, t: NaiveDateTime) {
            *self.0.lock().unwrap() = t;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            *self.0.lock().unwrap()
        }
    }

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn journal(clock: Arc<ManualClock>) -> Arc<Journal> {
        let factory: StoreFactory = Box::new(|date| {
            Ok(Box::new(SqliteStore::open_in_memory(date)?) as Box<dyn LogStore>)
        });
        Journal::with_store_factory(Settings::default(), clock, factory).unwrap()
    }

    #[tokio::test]
    async fn rollover_splits_time_at_midnight() {
        let clock = ManualClock::at(at(1, 23, 50, 0));
        let j = journal(clock.clone());
        j.category_selected("code").await.unwrap();

        clock.set(at(2, 0, 10, 0));
        j.tick().await.unwrap();

        let snap = j.snapshot().await;
        assert_eq!(snap.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(snap.active_category, "code");
        assert_eq!(snap.minutes.get("code"), 10.0);
    }

    #[tokio::test]
    async fn rollover_during_lunch_stays_on_lunch() {
        let clock = ManualClock::at(at(1, 20, 0, 0));
        let j = journal(clock.clone());
        j.shift_button(ShiftKind::WorkIn).await.unwrap();
        j.category_selected("code").await.unwrap();
        clock.set(at(1, 23, 30, 0));
        j.shift_button(ShiftKind::LunchOut).await.unwrap();

        clock.set(at(2, 0, 20, 0));
        j.tick().await.unwrap();
        let snap = j.snapshot().await;
        assert_eq!(snap.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(snap.shift_state, ShiftState::OnLunch);
        assert!(snap.timer_paused);
        assert_eq!(snap.minutes.get("code"), 0.0);

        clock.set(at(2, 0, 30, 0));
        j.shift_button(ShiftKind::LunchIn).await.unwrap();
        clock.set(at(2, 1, 0, 0));
        j.tick().await.unwrap();
        assert_eq!(j.snapshot().await.minutes.get("code"), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_timers_before_the_marker() {
        let clock = ManualClock::at(at(1, 9, 0, 0));
        let j = journal(clock.clone());
        j.start_timers().await;
        assert!(j.timers_running().await);

        clock.set(at(1, 10, 0, 0));
        j.shutdown().await.unwrap();
        assert!(!j.timers_running().await);

        clock.set(at(1, 11, 0, 0));
        tokio::time::sleep(Settings::default().prompt_interval() * 2).await;
        assert!(j.tick().await.unwrap().is_none());
        let snap = j.snapshot().await;
        assert!(snap.closed);
        assert_eq!(snap.minutes.get(DEFAULT_CATEGORY), 60.0);
        assert!(j.drain_notifications().await.is_empty());
    }

    #[tokio::test]
    async fn clock_going_backwards_does_not_roll_back_a_day() {
        let clock = ManualClock::at(at(2, 0, 5, 0));
        let j = journal(clock.clone());
        clock.set(at(1, 23, 59, 0));
        j.tick().await.unwrap();
        assert_eq!(j.snapshot().await.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }
}
