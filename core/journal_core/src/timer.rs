use crate::{
    ledger::Ledger,
    model::{NoteEntry, DEFAULT_CATEGORY},
};
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, warn};

/// Flush granularity: 0.01 minute. Whatever is below one quantum stays with
/// `active_since` and is picked up by the next flush.
const QUANTUM_MS: i64 = 600;

/// Why the timer was flushed. Recorded as the subcategory of the synthetic
/// entry so flushes landing in the same second stay distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Switch,
    Tick,
    NoteSaved,
    AutoNote,
    Report,
    Shutdown,
    LunchOut,
    DayEnd,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Switch => "switch",
            FlushReason::Tick => "tick",
            FlushReason::NoteSaved => "note",
            FlushReason::AutoNote => "auto_note",
            FlushReason::Report => "report",
            FlushReason::Shutdown => "shutdown",
            FlushReason::LunchOut => "lunch",
            FlushReason::DayEnd => "day_end",
        }
    }
}

/// Tracks which category is accruing time and since when.
///
/// `active_since` is `None` while paused (on lunch); nothing accrues then.
#[derive(Clone, Debug)]
pub struct CategoryTimer {
    active: String,
    active_since: Option<NaiveDateTime>,
}

impl CategoryTimer {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            active: DEFAULT_CATEGORY.to_string(),
            active_since: Some(now),
        }
    }

    pub fn paused() -> Self {
        Self {
            active: DEFAULT_CATEGORY.to_string(),
            active_since: None,
        }
    }

    pub fn active_category(&self) -> &str {
        &self.active
    }

    pub fn active_since(&self) -> Option<NaiveDateTime> {
        self.active_since
    }

    pub fn is_paused(&self) -> bool {
        self.active_since.is_none()
    }

    /// Minutes accrued but not yet flushed.
    pub fn pending_minutes(&self, now: NaiveDateTime) -> f64 {
        self.active_since
            .map(|since| ((now - since).num_milliseconds().max(0) / QUANTUM_MS) as f64 / 100.0)
            .unwrap_or(0.0)
    }

    /// Moves elapsed time for the active category into `ledger` and appends
    /// the matching time-log entry. Returns the entry, if any time was due.
    pub fn flush(
        &mut self,
        ledger: &mut Ledger,
        now: NaiveDateTime,
        reason: FlushReason,
    ) -> Option<NoteEntry> {
        let since = self.active_since?;
        let elapsed_ms = (now - since).num_milliseconds();
        if elapsed_ms < 0 {
            warn!(
                "clock went backwards ({since} -> {now}) while timing {}; dropping {:.2} minutes",
                self.active,
                elapsed_ms as f64 / 60_000.0
            );
            self.active_since = Some(now);
            return None;
        }

        let quanta = elapsed_ms / QUANTUM_MS;
        if quanta == 0 {
            return None;
        }
        self.active_since = Some(since + Duration::milliseconds(quanta * QUANTUM_MS));

        let minutes = quanta as f64 / 100.0;
        let applied = ledger.add_time(&self.active, minutes);
        let entry = NoteEntry::time_logged(&self.active, applied, now.time())
            .with_subcategory(reason.as_str());
        ledger.append(entry.clone());
        debug!("logged {applied:.2} minutes for {} ({})", self.active, reason.as_str());
        Some(entry)
    }

    /// Flushes the old category, then makes `category` active from `now`.
    pub fn switch_to(
        &mut self,
        ledger: &mut Ledger,
        category: &str,
        now: NaiveDateTime,
    ) -> Option<NoteEntry> {
        let flushed = self.flush(ledger, now, FlushReason::Switch);
        if category != self.active {
            debug!("switching {} -> {category}", self.active);
        }
        self.active = category.to_string();
        if self.active_since.is_some() {
            self.active_since = Some(now);
        }
        flushed
    }

    pub fn pause(&mut self, ledger: &mut Ledger, now: NaiveDateTime) -> Option<NoteEntry> {
        let flushed = self.flush(ledger, now, FlushReason::LunchOut);
        self.active_since = None;
        flushed
    }

    pub fn resume(&mut self, now: NaiveDateTime) {
        if self.active_since.is_none() {
            self.active_since = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CategoryTimeTable;
    use chrono::NaiveDate;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::new(CategoryTimeTable::new(["code", "meeting"]))
    }

    fn logged_sum(ledger: &Ledger, category: &str) -> f64 {
        ledger
            .notes()
            .iter()
            .filter(|n| n.category == category)
            .filter_map(|n| n.logged_minutes())
            .sum()
    }

    #[test]
    fn ticks_conserve_time_in_table_and_entries() {
        let mut l = ledger();
        let mut timer = CategoryTimer::new(base());
        timer.switch_to(&mut l, "code", base());

        let steps_ms = [60_000, 61_234, 59_999, 120_500, 1_000];
        let mut now = base();
        for ms in steps_ms {
            now += Duration::milliseconds(ms);
            timer.flush(&mut l, now, FlushReason::Tick);
        }

        let wall = (now - base()).num_milliseconds() as f64 / 60_000.0;
        let table = l.times().get("code");
        assert!((table - logged_sum(&l, "code")).abs() < 1e-9);
        assert!(table <= wall);
        assert!(wall - table < 0.01);
    }

    #[test]
    fn switch_attributes_elapsed_to_old_category() {
        let mut l = ledger();
        let mut timer = CategoryTimer::new(base());
        timer.switch_to(&mut l, "code", base());
        let entry = timer
            .switch_to(&mut l, "meeting", base() + Duration::minutes(10))
            .unwrap();

        assert_eq!(entry.category, "code");
        assert_eq!(entry.subcategory, "switch");
        assert_eq!(l.times().get("code"), 10.0);
        assert_eq!(l.times().get("meeting"), 0.0);
        assert_eq!(timer.active_category(), "meeting");
    }

    #[test]
    fn zero_elapsed_switch_appends_nothing() {
        let mut l = ledger();
        let mut timer = CategoryTimer::new(base());
        assert!(timer.switch_to(&mut l, "code", base()).is_none());
        assert!(l.notes().is_empty());
    }

    #[test]
    fn backwards_clock_is_clamped() {
        let mut l = ledger();
        let mut timer = CategoryTimer::new(base());
        let earlier = base() - Duration::minutes(5);
        assert!(timer.flush(&mut l, earlier, FlushReason::Tick).is_none());
        assert_eq!(timer.active_since(), Some(earlier));
        assert_eq!(l.times().total(), 0.0);
    }

    #[test]
    fn paused_timer_accrues_nothing() {
        let mut l = ledger();
        let mut timer = CategoryTimer::new(base());
        timer.switch_to(&mut l, "code", base());
        timer.pause(&mut l, base() + Duration::minutes(30));
        assert!(timer.is_paused());
        assert!(timer
            .flush(&mut l, base() + Duration::minutes(60), FlushReason::Tick)
            .is_none());

        timer.resume(base() + Duration::minutes(60));
        timer.flush(&mut l, base() + Duration::minutes(75), FlushReason::Tick);
        assert_eq!(l.times().get("code"), 45.0);
    }
}
