//! Daily summary built from a session snapshot. Everything here is pure; the
//! caller decides where renderings end up.

use crate::{
    ledger::CategoryTimeTable,
    model::{NoteEntry, ShiftEntry, ShiftKind, DEFAULT_CATEGORY},
};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeClass {
    Productive,
    Afk,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CategoryReport {
    pub name: String,
    pub minutes: f64,
    pub class: TimeClass,
    /// User-visible notes in chronological order; time logs are left out.
    pub notes: Vec<NoteEntry>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Totals {
    pub productive_minutes: f64,
    pub afk_minutes: f64,
    pub combined_minutes: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ShiftTotals {
    pub worked_minutes: f64,
    pub lunch_minutes: f64,
    pub completed_shifts: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub date: NaiveDate,
    pub categories: Vec<CategoryReport>,
    pub totals: Totals,
    pub shifts: ShiftTotals,
}

impl Report {
    /// A category counts as AFK when it is `default` and holds at least one
    /// auto-note; then all of its minutes for the day are AFK.
    pub fn build(
        date: NaiveDate,
        notes: &[NoteEntry],
        times: &CategoryTimeTable,
        shift_entries: &[ShiftEntry],
        lunch_total: f64,
    ) -> Report {
        let mut names: BTreeSet<&str> = times.iter().map(|(name, _)| name).collect();
        names.extend(notes.iter().map(|n| n.category.as_str()));

        // `default` goes last, after the named categories.
        let ordered = names
            .iter()
            .copied()
            .filter(|n| *n != DEFAULT_CATEGORY)
            .chain(names.contains(DEFAULT_CATEGORY).then_some(DEFAULT_CATEGORY));

        let mut categories = Vec::new();
        let mut totals = Totals::default();
        for name in ordered {
            let in_category: Vec<&NoteEntry> = notes.iter().filter(|n| n.category == name).collect();
            let minutes = times.get(name);

            let class = if name == DEFAULT_CATEGORY && in_category.iter().any(|n| n.is_auto_note()) {
                TimeClass::Afk
            } else {
                TimeClass::Productive
            };
            match class {
                TimeClass::Afk => totals.afk_minutes += minutes,
                TimeClass::Productive => totals.productive_minutes += minutes,
            }

            let mut visible: Vec<NoteEntry> = in_category
                .into_iter()
                .filter(|n| !n.is_time_log())
                .cloned()
                .collect();
            visible.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

            if minutes > 0.0 || !visible.is_empty() {
                categories.push(CategoryReport {
                    name: name.to_string(),
                    minutes,
                    class,
                    notes: visible,
                });
            }
        }
        totals.combined_minutes = totals.productive_minutes + totals.afk_minutes;

        let shifts = ShiftTotals {
            worked_minutes: shift_entries.iter().filter_map(|e| e.worked).sum(),
            lunch_minutes: lunch_total,
            completed_shifts: shift_entries
                .iter()
                .filter(|e| e.kind == ShiftKind::WorkOut)
                .count(),
        };

        Report {
            date,
            categories,
            totals,
            shifts,
        }
    }

    pub fn category(&self, name: &str) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.name == name)
    }
}

pub fn render_markdown(report: &Report) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", report.date));

    for c in &report.categories {
        let tag = match c.class {
            TimeClass::Afk => " (AFK)",
            TimeClass::Productive => "",
        };
        out.push_str(&format!("## {}{tag} · {}\n", c.name.to_uppercase(), fmt_minutes(c.minutes)));
        for n in &c.notes {
            if n.subcategory.trim().is_empty() {
                out.push_str(&format!("- {} {}\n", n.timestamp_str(), n.content));
            } else {
                out.push_str(&format!("- {} [{}] {}\n", n.timestamp_str(), n.subcategory, n.content));
            }
        }
        out.push('\n');
    }

    let t = &report.totals;
    out.push_str("## Totals\n");
    out.push_str(&format!("- Productive: {}\n", fmt_minutes(t.productive_minutes)));
    out.push_str(&format!("- AFK: {}\n", fmt_minutes(t.afk_minutes)));
    out.push_str(&format!("- Combined: {}\n", fmt_minutes(t.combined_minutes)));

    let s = &report.shifts;
    if s.completed_shifts > 0 || s.lunch_minutes > 0.0 {
        out.push_str("\n## Shifts\n");
        out.push_str(&format!("- Worked: {}\n", fmt_minutes(s.worked_minutes)));
        out.push_str(&format!("- Lunch: {}\n", fmt_minutes(s.lunch_minutes)));
        out.push_str(&format!("- Completed shifts: {}\n", s.completed_shifts));
    }

    out
}

pub fn render_csv(report: &Report) -> String {
    let mut out = String::new();
    out.push_str("date,category,class,minutes,note_count,notes\n");
    for c in &report.categories {
        let class = match c.class {
            TimeClass::Afk => "afk",
            TimeClass::Productive => "productive",
        };
        let notes = c
            .notes
            .iter()
            .map(|n| format!("{} {}", n.timestamp_str(), n.content))
            .collect::<Vec<_>>()
            .join("; ");
        let row = [
            csv_escape(&report.date.to_string()),
            csv_escape(&c.name),
            class.to_string(),
            format!("{:.2}", c.minutes),
            c.notes.len().to_string(),
            csv_escape(&notes),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_escape(s: &str) -> String {
    let needs_quote = s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r');
    if !needs_quote {
        return s.to_string();
    }
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn fmt_minutes(minutes: f64) -> String {
    let m = minutes.round() as i64;
    if m <= 0 {
        return "0m".to_string();
    }
    if m < 60 {
        return format!("{m}m");
    }
    let h = m / 60;
    let rm = m % 60;
    if rm == 0 {
        format!("{h}h")
    } else {
        format!("{h}h {rm}m")
    }
}
