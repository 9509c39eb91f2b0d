//! The authoritative note set and per-category minute totals for one day.

use crate::{
    error::StoreError,
    model::{minutes_between, NoteEntry, DEFAULT_CATEGORY},
    store::LogStore,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Accumulated minutes per category. Values never go negative.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CategoryTimeTable {
    minutes: BTreeMap<String, f64>,
}

impl CategoryTimeTable {
    /// Seeds every category (plus `default`) at zero.
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut minutes: BTreeMap<String, f64> = categories
            .into_iter()
            .map(|c| (c.into(), 0.0))
            .collect();
        minutes.entry(DEFAULT_CATEGORY.to_string()).or_insert(0.0);
        Self { minutes }
    }

    /// Adds `minutes` to `category`, clamping negative input to zero.
    /// Returns the amount actually applied.
    pub fn add(&mut self, category: &str, minutes: f64) -> f64 {
        let applied = if minutes.is_finite() && minutes > 0.0 {
            minutes
        } else {
            if minutes < 0.0 || !minutes.is_finite() {
                warn!("ignoring invalid duration {minutes} for {category}");
            }
            0.0
        };
        *self.minutes.entry(category.to_string()).or_insert(0.0) += applied;
        applied
    }

    pub fn get(&self, category: &str) -> f64 {
        self.minutes.get(category).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.minutes.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.minutes.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Unions entries keeping the first occurrence of each full-tuple identity.
pub fn dedup_notes<I>(entries: I) -> Vec<NoteEntry>
where
    I: IntoIterator<Item = NoteEntry>,
{
    let mut seen: HashSet<NoteEntry> = HashSet::new();
    let mut out = Vec::new();
    for n in entries {
        if seen.insert(n.clone()) {
            out.push(n);
        }
    }
    out
}

#[derive(Clone, Debug, Default)]
pub struct Ledger {
    notes: Vec<NoteEntry>,
    times: CategoryTimeTable,
}

impl Ledger {
    pub fn new(times: CategoryTimeTable) -> Self {
        Self {
            notes: Vec::new(),
            times,
        }
    }

    /// Loads persisted notes and folds every time-log entry into `times`.
    ///
    /// Never fails: an unreadable log yields an empty ledger.
    pub fn load(store: &dyn LogStore, times: CategoryTimeTable) -> Self {
        let mut ledger = Self::new(times);
        let notes = match store.read_notes() {
            Ok(v) => v,
            Err(err) => {
                warn!("could not read notes for {}: {err}; starting empty", store.date());
                return ledger;
            }
        };

        let notes = dedup_notes(notes);
        for n in &notes {
            if !n.is_time_log() {
                continue;
            }
            match n.logged_minutes() {
                Some(m) => {
                    ledger.times.add(&n.category, m);
                }
                None => warn!("unparsable time log '{}'", n.content),
            }
        }
        ledger.notes = notes;
        info!("loaded {} notes for {}", ledger.notes.len(), store.date());
        ledger
    }

    pub fn notes(&self) -> &[NoteEntry] {
        &self.notes
    }

    pub fn times(&self) -> &CategoryTimeTable {
        &self.times
    }

    pub fn add_time(&mut self, category: &str, minutes: f64) -> f64 {
        self.times.add(category, minutes)
    }

    /// Adds to the in-memory set only; call [`Ledger::merge`] to persist.
    pub fn append(&mut self, entry: NoteEntry) {
        self.notes.push(entry);
    }

    /// Notes ordered by timestamp; entries sharing a second keep insertion order.
    pub fn sorted_notes(&self) -> Vec<NoteEntry> {
        let mut out = self.notes.clone();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        out
    }

    /// Shutdown instant if the most recent note is a shutdown marker.
    pub fn last_shutdown(&self) -> Option<NaiveDateTime> {
        self.notes
            .iter()
            .enumerate()
            .max_by_key(|(i, n)| (n.timestamp, *i))
            .and_then(|(_, n)| n.shutdown_at())
    }

    /// Attributes the time the process was down (same calendar day only) to
    /// `default`, recorded as a time-log entry so reloads see it too.
    /// Returns the minutes added.
    pub fn backfill_idle_gap(&mut self, session_date: NaiveDate, now: NaiveDateTime) -> f64 {
        let Some(shutdown) = self.last_shutdown() else {
            debug!("no trailing shutdown marker; nothing to backfill");
            return 0.0;
        };
        if shutdown.date() != session_date || now.date() != session_date {
            info!("last shutdown {shutdown} is from another day; no backfill");
            return 0.0;
        }

        let gap = minutes_between(shutdown, now);
        if gap <= 0.0 {
            if gap < 0.0 {
                warn!("shutdown marker {shutdown} is after now {now}; clamping gap to zero");
            }
            return 0.0;
        }

        let gap = (gap * 100.0).floor() / 100.0;
        let applied = self.times.add(DEFAULT_CATEGORY, gap);
        self.notes
            .push(NoteEntry::time_logged(DEFAULT_CATEGORY, applied, now.time()));
        info!("backfilled {applied:.2} minutes of downtime since {shutdown}");
        applied
    }

    /// Re-reads the store, unions persisted-first with the in-memory set,
    /// dedups by full identity and rewrites the store with the result.
    ///
    /// The in-memory set is replaced only once the write succeeded. An
    /// unreadable log is backed up before it is overwritten; if the backup
    /// fails the log is left alone.
    pub fn merge(&mut self, store: &mut dyn LogStore) -> Result<usize, StoreError> {
        let persisted = match store.read_notes() {
            Ok(v) => v,
            Err(err) if err.is_corrupt() => {
                let copy = store.back_up()?;
                warn!(
                    "persisted notes unreadable during merge ({err}); overwriting (backup: {})",
                    copy.map(|p| p.display().to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        let persisted_len = persisted.len();

        let merged = dedup_notes(persisted.into_iter().chain(self.notes.iter().cloned()));
        store.replace_notes(&merged)?;
        debug!(
            "merged {} persisted + {} in-memory into {} notes",
            persisted_len,
            self.notes.len(),
            merged.len()
        );
        self.notes = merged;
        Ok(self.notes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;
    use chrono::NaiveTime;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn table() -> CategoryTimeTable {
        CategoryTimeTable::new(["code", "meeting"])
    }

    #[test]
    fn table_seeds_default_and_clamps_negative() {
        let mut tt = table();
        assert_eq!(tt.iter().count(), 3);
        assert_eq!(tt.add("code", -4.0), 0.0);
        assert_eq!(tt.add("code", 2.5), 2.5);
        assert_eq!(tt.get("code"), 2.5);
        assert_eq!(tt.get("unknown"), 0.0);
    }

    #[test]
    fn duplicate_persisted_and_appended_note_merges_to_one() {
        let note = NoteEntry::new("code", t(10, 0, 0), "fixed bug");
        let mut store = MemoryStore {
            notes: vec![note.clone()],
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        ledger.append(note.clone());

        assert_eq!(ledger.merge(&mut store).unwrap(), 1);
        assert_eq!(store.notes, vec![note]);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut store = MemoryStore::default();
        let mut ledger = Ledger::new(table());
        ledger.append(NoteEntry::new("code", t(9, 0, 0), "a"));
        ledger.append(NoteEntry::new("code", t(9, 0, 0), "b"));
        ledger.append(NoteEntry::new("code", t(9, 0, 0), "a").with_subcategory("review"));

        ledger.merge(&mut store).unwrap();
        let once = store.notes.clone();
        ledger.merge(&mut store).unwrap();
        ledger.merge(&mut store).unwrap();

        assert_eq!(store.notes, once);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn entries_differing_in_any_field_are_kept() {
        let base = NoteEntry::new("code", t(9, 0, 0), "a");
        let variants = vec![
            base.clone(),
            base.clone(),
            NoteEntry::new("meeting", t(9, 0, 0), "a"),
            NoteEntry::new("code", t(9, 0, 1), "a"),
            NoteEntry::new("code", t(9, 0, 0), "a").with_subcategory("x"),
            NoteEntry::new("code", t(9, 0, 0), "b"),
        ];
        let out = dedup_notes(variants);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], base);
    }

    #[test]
    fn merge_keeps_persisted_order_first() {
        let persisted = NoteEntry::new("code", t(11, 0, 0), "later but persisted");
        let mut store = MemoryStore {
            notes: vec![persisted.clone()],
            ..Default::default()
        };
        let mut ledger = Ledger::new(table());
        let fresh = NoteEntry::new("code", t(8, 0, 0), "earlier but new");
        ledger.append(fresh.clone());
        ledger.merge(&mut store).unwrap();

        assert_eq!(ledger.notes(), &[persisted.clone(), fresh.clone()]);
        assert_eq!(ledger.sorted_notes(), vec![fresh, persisted]);
    }

    #[test]
    fn load_folds_time_logs_into_table() {
        let store = MemoryStore {
            notes: vec![
                NoteEntry::time_logged("code", 1.5, t(9, 1, 0)),
                NoteEntry::time_logged("code", 2.25, t(9, 3, 0)),
                NoteEntry::new("code", t(9, 4, 0), "Time logged: 1.0 minutes for code"),
                NoteEntry::new("code", t(9, 5, 0), "plain note"),
            ],
            ..Default::default()
        };
        let ledger = Ledger::load(&store, table());
        assert!((ledger.times().get("code") - 4.75).abs() < 1e-9);
        assert_eq!(ledger.notes().len(), 4);
    }

    #[test]
    fn corrupt_log_loads_empty_and_merge_overwrites() {
        let mut store = MemoryStore {
            notes: vec![NoteEntry::time_logged("code", 10.0, t(9, 0, 0))],
            corrupt_reads: true,
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        assert!(ledger.notes().is_empty());
        assert_eq!(ledger.times().total(), 0.0);

        ledger.append(NoteEntry::new("code", t(9, 30, 0), "fresh"));
        ledger.merge(&mut store).unwrap();
        assert_eq!(store.notes.len(), 1);
        assert_eq!(store.backups.get(), 1);
    }

    #[test]
    fn corrupt_log_is_kept_when_backup_fails() {
        let persisted = NoteEntry::time_logged("code", 10.0, t(9, 0, 0));
        let mut store = MemoryStore {
            notes: vec![persisted.clone()],
            corrupt_reads: true,
            fail_backup: true,
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        ledger.append(NoteEntry::new("code", t(9, 30, 0), "fresh"));

        assert!(ledger.merge(&mut store).is_err());
        assert_eq!(store.notes, vec![persisted]);
        assert_eq!(ledger.notes().len(), 1);
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let mut store = MemoryStore {
            notes: vec![NoteEntry::new("code", t(8, 0, 0), "persisted")],
            fail_writes: true,
            ..Default::default()
        };
        let mut ledger = Ledger::new(table());
        ledger.append(NoteEntry::new("code", t(9, 0, 0), "mine"));

        assert!(ledger.merge(&mut store).is_err());
        assert_eq!(ledger.notes().len(), 1);
        assert_eq!(ledger.notes()[0].content, "mine");
    }

    #[test]
    fn backfills_same_day_gap_to_default() {
        let store = MemoryStore {
            notes: vec![
                NoteEntry::time_logged("code", 3.0, t(23, 50, 0)),
                NoteEntry::shutdown_marker(at(1, 23, 50)),
            ],
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        let added = ledger.backfill_idle_gap(day(), at(1, 23, 55));

        assert!((added - 5.0).abs() < 1e-9);
        assert!((ledger.times().get(DEFAULT_CATEGORY) - 5.0).abs() < 1e-9);
        assert_eq!(ledger.last_shutdown(), None);
    }

    #[test]
    fn backfill_ignores_marker_from_other_day() {
        let store = MemoryStore {
            notes: vec![NoteEntry::shutdown_marker(at(1, 23, 50))],
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        let next_day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(ledger.backfill_idle_gap(next_day, at(2, 0, 5)), 0.0);
        assert_eq!(ledger.times().total(), 0.0);
    }

    #[test]
    fn backfill_needs_marker_to_be_most_recent() {
        let store = MemoryStore {
            notes: vec![
                NoteEntry::shutdown_marker(at(1, 12, 0)),
                NoteEntry::time_logged("code", 1.0, t(13, 0, 0)),
            ],
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        assert_eq!(ledger.backfill_idle_gap(day(), at(1, 14, 0)), 0.0);
    }

    #[test]
    fn backfill_survives_reload_without_repeating() {
        let mut store = MemoryStore {
            notes: vec![NoteEntry::shutdown_marker(at(1, 10, 0))],
            ..Default::default()
        };
        let mut ledger = Ledger::load(&store, table());
        ledger.backfill_idle_gap(day(), at(1, 10, 30));
        ledger.merge(&mut store).unwrap();

        let mut reloaded = Ledger::load(&store, table());
        assert!((reloaded.times().get(DEFAULT_CATEGORY) - 30.0).abs() < 1e-9);
        assert_eq!(reloaded.backfill_idle_gap(day(), at(1, 11, 0)), 0.0);
    }
}
