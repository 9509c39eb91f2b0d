use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Catch-all category; idle time and auto-notes land here.
pub const DEFAULT_CATEGORY: &str = "default";

pub const TIME_LOGGED_PREFIX: &str = "Time logged:";
pub const SHUTDOWN_MARKER_PREFIX: &str = "the program shut down at ";
pub const AUTO_NOTE_CONTENT: &str =
    "user did not leave note - leaving auto-note for timestamp and time summation";
const AUTO_NOTE_FLAG: &str = "auto-note";

/// Note timestamps are same-day `HH:MM:SS`, so lexicographic order is chronological.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S";
pub const MARKER_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single journal row.
///
/// Two entries are the same entry iff category, timestamp, subcategory and
/// content are all equal; the derived `Eq`/`Hash` cover exactly those fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteEntry {
    pub category: String,
    #[serde(default)]
    pub subcategory: String,
    pub timestamp: NaiveTime,
    pub content: String,
}

impl NoteEntry {
    pub fn new(category: impl Into<String>, timestamp: NaiveTime, content: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            subcategory: String::new(),
            timestamp: truncate_to_seconds(timestamp),
            content: content.into(),
        }
    }

    pub fn with_subcategory(mut self, subcategory: impl Into<String>) -> Self {
        self.subcategory = subcategory.into();
        self
    }

    /// Synthetic entry recording minutes flushed to `category`.
    pub fn time_logged(category: &str, minutes: f64, at: NaiveTime) -> Self {
        Self::new(
            category,
            at,
            format!("{TIME_LOGGED_PREFIX} {minutes:.2} minutes for {category}"),
        )
    }

    pub fn shutdown_marker(at: NaiveDateTime) -> Self {
        Self::new(
            DEFAULT_CATEGORY,
            at.time(),
            format!("{SHUTDOWN_MARKER_PREFIX}{}", at.format(MARKER_DATETIME_FORMAT)),
        )
    }

    pub fn auto_note(at: NaiveTime) -> Self {
        Self::new(DEFAULT_CATEGORY, at, AUTO_NOTE_CONTENT)
    }

    pub fn is_time_log(&self) -> bool {
        self.content.starts_with(TIME_LOGGED_PREFIX)
    }

    pub fn is_auto_note(&self) -> bool {
        self.content.contains(AUTO_NOTE_FLAG)
    }

    /// Minutes encoded in a synthetic time-log entry.
    ///
    /// Accepts both `1.5` and `1.50` renderings; anything else yields `None`.
    pub fn logged_minutes(&self) -> Option<f64> {
        if !self.is_time_log() {
            return None;
        }
        let minutes: f64 = self.content.split_whitespace().nth(2)?.parse().ok()?;
        minutes.is_finite().then_some(minutes)
    }

    /// Wall-clock instant recorded by a shutdown marker.
    pub fn shutdown_at(&self) -> Option<NaiveDateTime> {
        let idx = self.content.find(SHUTDOWN_MARKER_PREFIX)?;
        let rest = self.content[idx + SHUTDOWN_MARKER_PREFIX.len()..].trim();
        NaiveDateTime::parse_from_str(rest, MARKER_DATETIME_FORMAT).ok()
    }

    pub fn timestamp_str(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftKind {
    WorkIn,
    WorkOut,
    LunchOut,
    LunchIn,
}

impl ShiftKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ShiftKind::WorkIn => "work_in",
            ShiftKind::WorkOut => "work_out",
            ShiftKind::LunchOut => "lunch_out",
            ShiftKind::LunchIn => "lunch_in",
        }
    }
}

impl fmt::Display for ShiftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShiftKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "work_in" => Ok(ShiftKind::WorkIn),
            "work_out" => Ok(ShiftKind::WorkOut),
            "lunch_out" => Ok(ShiftKind::LunchOut),
            "lunch_in" => Ok(ShiftKind::LunchIn),
            other => Err(format!("unknown shift kind '{other}'")),
        }
    }
}

/// One shift-log row. `worked` is set on `work_out`, `duration` on `lunch_in`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShiftEntry {
    #[serde(rename = "type")]
    pub kind: ShiftKind,
    pub timestamp: NaiveTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worked: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl ShiftEntry {
    pub fn new(kind: ShiftKind, timestamp: NaiveTime) -> Self {
        Self {
            kind,
            timestamp: truncate_to_seconds(timestamp),
            worked: None,
            duration: None,
        }
    }
}

pub fn truncate_to_seconds(t: NaiveTime) -> NaiveTime {
    t.with_nanosecond(0).unwrap_or(t)
}

/// Signed minutes from `start` to `end`, millisecond resolution.
pub fn minutes_between(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    (end - start).num_milliseconds() as f64 / 60_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn time_logged_round_trips_minutes() {
        let n = NoteEntry::time_logged("code", 12.34, t(10, 0, 0));
        assert_eq!(n.content, "Time logged: 12.34 minutes for code");
        assert_eq!(n.logged_minutes(), Some(12.34));

        let legacy = NoteEntry::new("code", t(10, 0, 0), "Time logged: 3.5 minutes for code");
        assert_eq!(legacy.logged_minutes(), Some(3.5));

        let garbage = NoteEntry::new("code", t(10, 0, 0), "Time logged: lots minutes for code");
        assert_eq!(garbage.logged_minutes(), None);
    }

    #[test]
    fn shutdown_marker_parses_back() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(23, 50, 0)
            .unwrap();
        let n = NoteEntry::shutdown_marker(at);
        assert_eq!(n.category, DEFAULT_CATEGORY);
        assert_eq!(n.timestamp_str(), "23:50:00");
        assert_eq!(n.shutdown_at(), Some(at));
        assert!(!n.is_time_log());
    }

    #[test]
    fn timestamps_drop_subsecond_precision() {
        let precise = NaiveTime::from_hms_milli_opt(9, 0, 0, 750).unwrap();
        let n = NoteEntry::new("code", precise, "x");
        assert_eq!(n, NoteEntry::new("code", t(9, 0, 0), "x"));
    }

    #[test]
    fn shift_kind_parses_wire_names() {
        for kind in [ShiftKind::WorkIn, ShiftKind::WorkOut, ShiftKind::LunchOut, ShiftKind::LunchIn] {
            assert_eq!(kind.as_str().parse::<ShiftKind>().unwrap(), kind);
        }
        assert!("coffee_break".parse::<ShiftKind>().is_err());
    }
}
