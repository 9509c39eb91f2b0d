//! Clock-in / lunch / clock-out state machine.
//!
//! | event     | Off       | Working  | OnLunch  |
//! |-----------|-----------|----------|----------|
//! | work_in   | Working   | reject   | reject   |
//! | lunch_out | reject    | OnLunch  | reject   |
//! | lunch_in  | reject    | reject   | Working  |
//! | work_out  | reject    | Off      | reject   |

use crate::{
    error::JournalError,
    model::{minutes_between, truncate_to_seconds, ShiftEntry, ShiftKind},
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftState {
    #[default]
    Off,
    Working,
    OnLunch,
}

impl fmt::Display for ShiftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShiftState::Off => "off",
            ShiftState::Working => "working",
            ShiftState::OnLunch => "on_lunch",
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShiftStateMachine {
    state: ShiftState,
    clock_in: Option<NaiveDateTime>,
    lunch_start: Option<NaiveDateTime>,
    /// Lunch minutes inside the current shift; subtracted on work_out.
    shift_lunch_minutes: f64,
    total_lunch_minutes: f64,
    entries: Vec<ShiftEntry>,
}

impl ShiftStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds state by applying persisted entries in order. Entries that
    /// would be illegal are skipped.
    pub fn replay(date: NaiveDate, entries: &[ShiftEntry]) -> Self {
        let mut machine = Self::new();
        for e in entries {
            let at = date.and_time(e.timestamp);
            if let Err(err) = machine.apply(e.kind, at) {
                warn!("skipping persisted shift entry {} at {}: {err}", e.kind, e.timestamp);
            }
        }
        if !machine.entries.is_empty() {
            info!("replayed {} shift entries; state {}", machine.entries.len(), machine.state);
        }
        machine
    }

    pub fn state(&self) -> ShiftState {
        self.state
    }

    pub fn entries(&self) -> &[ShiftEntry] {
        &self.entries
    }

    pub fn clock_in(&self) -> Option<NaiveDateTime> {
        self.clock_in
    }

    pub fn lunch_start(&self) -> Option<NaiveDateTime> {
        self.lunch_start
    }

    pub fn total_lunch_minutes(&self) -> f64 {
        self.total_lunch_minutes
    }

    /// Sum of `worked` over completed shifts.
    pub fn worked_minutes_total(&self) -> f64 {
        self.entries.iter().filter_map(|e| e.worked).sum()
    }

    /// The periodic note prompt is muted while on lunch.
    pub fn should_suspend_prompting(&self) -> bool {
        self.state == ShiftState::OnLunch
    }

    /// Fails with [`JournalError::IllegalTransition`] if `kind` is not allowed
    /// from the current state.
    pub fn check(&self, kind: ShiftKind) -> Result<(), JournalError> {
        use ShiftKind::*;
        use ShiftState::*;

        let reason = match (kind, self.state) {
            (WorkIn, Off) | (LunchOut, Working) | (LunchIn, OnLunch) | (WorkOut, Working) => {
                return Ok(())
            }
            (WorkIn, Working) | (WorkIn, OnLunch) => "already clocked in",
            (LunchOut, Off) | (WorkOut, Off) => "must clock in first",
            (LunchOut, OnLunch) => "already on lunch",
            (LunchIn, Off) | (LunchIn, Working) => "not on lunch",
            (WorkOut, OnLunch) => "must end lunch first",
        };
        Err(JournalError::IllegalTransition {
            kind,
            state: self.state,
            reason,
        })
    }

    /// Applies a transition and returns the entry to persist. State is left
    /// untouched when the transition is rejected.
    pub fn apply(&mut self, kind: ShiftKind, now: NaiveDateTime) -> Result<ShiftEntry, JournalError> {
        self.check(kind)?;
        let now = now.date().and_time(truncate_to_seconds(now.time()));
        let mut entry = ShiftEntry::new(kind, now.time());

        match kind {
            ShiftKind::WorkIn => {
                self.state = ShiftState::Working;
                self.clock_in = Some(now);
                self.shift_lunch_minutes = 0.0;
            }
            ShiftKind::LunchOut => {
                self.state = ShiftState::OnLunch;
                self.lunch_start = Some(now);
            }
            ShiftKind::LunchIn => {
                let duration = self
                    .lunch_start
                    .take()
                    .map(|start| non_negative(minutes_between(start, now), "lunch"))
                    .unwrap_or(0.0);
                self.shift_lunch_minutes += duration;
                self.total_lunch_minutes += duration;
                self.state = ShiftState::Working;
                entry.duration = Some(duration);
            }
            ShiftKind::WorkOut => {
                let span = self
                    .clock_in
                    .take()
                    .map(|start| minutes_between(start, now))
                    .unwrap_or(0.0);
                let worked = non_negative(span - self.shift_lunch_minutes, "worked");
                self.shift_lunch_minutes = 0.0;
                self.state = ShiftState::Off;
                entry.worked = Some(worked);
            }
        }

        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Minutes worked so far in the open shift, lunch excluded.
    pub fn open_shift_minutes(&self, now: NaiveDateTime) -> f64 {
        let Some(start) = self.clock_in else {
            return 0.0;
        };
        let running_lunch = self
            .lunch_start
            .map(|l| minutes_between(l, now).max(0.0))
            .unwrap_or(0.0);
        (minutes_between(start, now) - self.shift_lunch_minutes - running_lunch).max(0.0)
    }
}

fn non_negative(minutes: f64, what: &str) -> f64 {
    if minutes < 0.0 {
        warn!("{what} duration {minutes:.2} is negative (clock drift?); clamping to 0");
        0.0
    } else {
        minutes
    }
}
