//! One calendar day of journaling: the ledger, the shift machine and the
//! category timer, driven by discrete events.
//!
//! Every handler takes `now` explicitly; callers serialize the calls.

use crate::{
    error::JournalError,
    ledger::{CategoryTimeTable, Ledger},
    model::{NoteEntry, ShiftEntry, ShiftKind, DEFAULT_CATEGORY},
    report::{render_markdown, Report},
    shift::{ShiftState, ShiftStateMachine},
    store::LogStore,
    timer::{CategoryTimer, FlushReason},
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Messages for the UI layer, queued until drained.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    PromptForNote,
    NoteSaved {
        category: String,
        timestamp: String,
    },
    IllegalShiftTransition {
        shift: ShiftKind,
        state: ShiftState,
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub date: NaiveDate,
    pub active_category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_since: Option<NaiveDateTime>,
    pub timer_paused: bool,
    pub pending_minutes: f64,
    pub shift_state: ShiftState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_in: Option<NaiveDateTime>,
    pub open_shift_minutes: f64,
    pub worked_minutes: f64,
    pub lunch_minutes: f64,
    pub minutes: CategoryTimeTable,
    pub note_count: usize,
    pub closed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DayCarry {
    pub category: String,
    pub shift: ShiftState,
}

pub struct DaySession {
    date: NaiveDate,
    store: Box<dyn LogStore>,
    categories: Vec<String>,
    ledger: Ledger,
    shifts: ShiftStateMachine,
    timer: CategoryTimer,
    outbox: Vec<Notification>,
    closed: bool,
}

impl DaySession {
    /// Loads the day's log, replays shifts and backfills downtime since the
    /// last clean shutdown. Unreadable persisted state yields a fresh day.
    pub fn open(store: Box<dyn LogStore>, categories: &[String], now: NaiveDateTime) -> Self {
        let date = store.date();
        let table = CategoryTimeTable::new(categories.iter().cloned());
        let mut ledger = Ledger::load(store.as_ref(), table);

        let shift_entries = store.read_shifts().unwrap_or_else(|err| {
            warn!("could not read shifts for {date}: {err}; starting off shift");
            Vec::new()
        });
        let shifts = ShiftStateMachine::replay(date, &shift_entries);

        let timer = if shifts.state() == ShiftState::OnLunch {
            info!("resuming {date} on lunch; timer paused, no downtime backfill");
            CategoryTimer::paused()
        } else {
            ledger.backfill_idle_gap(date, now);
            CategoryTimer::new(now)
        };

        let mut session = Self {
            date,
            store,
            categories: categories.to_vec(),
            ledger,
            shifts,
            timer,
            outbox: Vec::new(),
            closed: false,
        };
        if let Err(err) = session.persist() {
            warn!("could not write journal for {date} on open: {err}");
        }
        session
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn shifts(&self) -> &ShiftStateMachine {
        &self.shifts
    }

    pub fn timer(&self) -> &CategoryTimer {
        &self.timer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn should_suspend_prompting(&self) -> bool {
        self.shifts.should_suspend_prompting()
    }

    pub fn notify(&mut self, n: Notification) {
        self.outbox.push(n);
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }

    fn is_known_category(&self, category: &str) -> bool {
        category == DEFAULT_CATEGORY || self.categories.iter().any(|c| c == category)
    }

    fn persist(&mut self) -> Result<(), JournalError> {
        self.ledger.merge(self.store.as_mut())?;
        Ok(())
    }

    pub fn on_category_selected(
        &mut self,
        category: &str,
        now: NaiveDateTime,
    ) -> Result<(), JournalError> {
        let category = category.trim();
        if !self.is_known_category(category) {
            return Err(JournalError::UnknownCategory(category.to_string()));
        }
        if self.timer.switch_to(&mut self.ledger, category, now).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// Saves a user note against the active category.
    pub fn on_note_submitted(
        &mut self,
        text: &str,
        subcategory: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<NoteEntry, JournalError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(JournalError::EmptyNote);
        }
        self.timer.flush(&mut self.ledger, now, FlushReason::NoteSaved);

        let note = NoteEntry::new(self.timer.active_category(), now.time(), text)
            .with_subcategory(subcategory.map(str::trim).unwrap_or_default());
        self.save_note(note)
    }

    /// Records that a prompt went unanswered. Lands in `default`.
    pub fn on_auto_note(&mut self, now: NaiveDateTime) -> Result<NoteEntry, JournalError> {
        self.timer.flush(&mut self.ledger, now, FlushReason::AutoNote);
        self.save_note(NoteEntry::auto_note(now.time()))
    }

    fn save_note(&mut self, note: NoteEntry) -> Result<NoteEntry, JournalError> {
        self.ledger.append(note.clone());
        self.persist()?;
        info!("saved note for {} at {}", note.category, note.timestamp_str());
        self.notify(Notification::NoteSaved {
            category: note.category.clone(),
            timestamp: note.timestamp_str(),
        });
        Ok(note)
    }

    pub fn on_tick(&mut self, now: NaiveDateTime) -> Result<Option<NoteEntry>, JournalError> {
        let flushed = self.timer.flush(&mut self.ledger, now, FlushReason::Tick);
        if flushed.is_some() {
            self.persist()?;
        }
        Ok(flushed)
    }

    /// Applies a shift transition. Illegal transitions leave every piece of
    /// state untouched and queue an [`Notification::IllegalShiftTransition`].
    pub fn on_shift_button(
        &mut self,
        kind: ShiftKind,
        now: NaiveDateTime,
    ) -> Result<ShiftEntry, JournalError> {
        let mut next = self.shifts.clone();
        let entry = match next.apply(kind, now) {
            Ok(entry) => entry,
            Err(err) => {
                if let JournalError::IllegalTransition { kind, state, reason } = &err {
                    warn!("rejected {kind} while {state}: {reason}");
                    self.notify(Notification::IllegalShiftTransition {
                        shift: *kind,
                        state: *state,
                        reason: reason.to_string(),
                    });
                }
                return Err(err);
            }
        };

        self.store.append_shift(&entry)?;
        self.shifts = next;
        info!("shift {kind} at {}; now {}", now.time(), self.shifts.state());

        match kind {
            ShiftKind::LunchOut => {
                // The shift row is already durable; a failed flush stays in
                // memory and goes out with the next successful merge.
                if self.timer.pause(&mut self.ledger, now).is_some() {
                    if let Err(err) = self.persist() {
                        warn!("lunch started but flushed time not saved yet: {err}");
                    }
                }
            }
            ShiftKind::LunchIn => self.timer.resume(now),
            ShiftKind::WorkIn | ShiftKind::WorkOut => {}
        }
        Ok(entry)
    }

    /// Final flush plus the shutdown marker that the next start backfills from.
    pub fn on_shutdown_requested(&mut self, now: NaiveDateTime) -> Result<(), JournalError> {
        self.timer.flush(&mut self.ledger, now, FlushReason::Shutdown);
        self.ledger.append(NoteEntry::shutdown_marker(now));
        self.persist()?;
        self.closed = true;
        info!("session {} closed at {}", self.date, now.time());
        Ok(())
    }

    /// What the next day inherits at midnight.
    pub fn carry(&self) -> DayCarry {
        DayCarry {
            category: self.timer.active_category().to_string(),
            shift: self.shifts.state(),
        }
    }

    /// Closes the day at `end_of_day` once the wall clock has crossed
    /// midnight. An open shift is ended there (lunch first, then work).
    pub fn close_day(&mut self, end_of_day: NaiveDateTime) -> Result<(), JournalError> {
        self.timer.flush(&mut self.ledger, end_of_day, FlushReason::DayEnd);
        let closing: &[ShiftKind] = match self.shifts.state() {
            ShiftState::OnLunch => &[ShiftKind::LunchIn, ShiftKind::WorkOut],
            ShiftState::Working => &[ShiftKind::WorkOut],
            ShiftState::Off => &[],
        };
        for kind in closing {
            let mut next = self.shifts.clone();
            let entry = next.apply(*kind, end_of_day)?;
            self.store.append_shift(&entry)?;
            self.shifts = next;
        }
        self.ledger.append(NoteEntry::shutdown_marker(end_of_day));
        self.persist()?;
        self.closed = true;
        Ok(())
    }

    /// Reopens at `midnight` what the previous day left running: the shift
    /// (and lunch) plus the active category.
    pub fn continue_from(&mut self, carry: &DayCarry, midnight: NaiveDateTime) -> Result<(), JournalError> {
        if self.shifts.state() == ShiftState::Off {
            if matches!(carry.shift, ShiftState::Working | ShiftState::OnLunch) {
                self.on_shift_button(ShiftKind::WorkIn, midnight)?;
            }
            if carry.shift == ShiftState::OnLunch {
                self.on_shift_button(ShiftKind::LunchOut, midnight)?;
            }
        }
        if carry.category != DEFAULT_CATEGORY && self.is_known_category(&carry.category) {
            self.on_category_selected(&carry.category, midnight)?;
        }
        Ok(())
    }

    /// Flushes, persists and summarizes the day.
    pub fn report(&mut self, now: NaiveDateTime) -> Result<Report, JournalError> {
        if self.timer.flush(&mut self.ledger, now, FlushReason::Report).is_some() {
            self.persist()?;
        }
        Ok(self.build_report())
    }

    pub fn build_report(&self) -> Report {
        Report::build(
            self.date,
            &self.ledger.sorted_notes(),
            self.ledger.times(),
            self.shifts.entries(),
            self.shifts.total_lunch_minutes(),
        )
    }

    /// Writes `report_<date>.md` and `report_<date>.json` next to the log.
    pub fn write_report_artifacts(&self, report: &Report) -> Result<Vec<PathBuf>, JournalError> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?;
        let mut written = Vec::new();
        for (name, contents) in [
            (format!("report_{}.md", self.date), render_markdown(report)),
            (format!("report_{}.json", self.date), json),
        ] {
            if let Some(path) = self.store.save_artifact(&name, &contents)? {
                written.push(path);
            }
        }
        Ok(written)
    }

    pub fn snapshot(&self, now: NaiveDateTime) -> SessionSnapshot {
        SessionSnapshot {
            date: self.date,
            active_category: self.timer.active_category().to_string(),
            active_since: self.timer.active_since(),
            timer_paused: self.timer.is_paused(),
            pending_minutes: self.timer.pending_minutes(now),
            shift_state: self.shifts.state(),
            clock_in: self.shifts.clock_in(),
            open_shift_minutes: self.shifts.open_shift_minutes(now),
            worked_minutes: self.shifts.worked_minutes_total(),
            lunch_minutes: self.shifts.total_lunch_minutes(),
            minutes: self.ledger.times().clone(),
            note_count: self.ledger.notes().len(),
            closed: self.closed,
        }
    }
}
