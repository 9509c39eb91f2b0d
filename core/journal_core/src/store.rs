//! Per-day persistence: one SQLite file under `<data_dir>/<YYYY-MM-DD>/`.
//!
//! The store only serializes rows. Deduplication, legality and time folding
//! live in the ledger and the shift machine.

use crate::{
    error::StoreError,
    model::{NoteEntry, ShiftEntry, ShiftKind, TIMESTAMP_FORMAT},
};
use chrono::{Local, NaiveDate, NaiveTime};
use rusqlite::{params, Connection};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};

pub const DB_FILE_NAME: &str = "journal.db";
pub const DATE_DIR_FORMAT: &str = "%Y-%m-%d";

/// Durable record of one day's notes and shift events.
pub trait LogStore: Send {
    fn date(&self) -> NaiveDate;

    /// All persisted notes in insertion order.
    fn read_notes(&self) -> Result<Vec<NoteEntry>, StoreError>;

    /// Atomically replaces every persisted note with `notes`.
    fn replace_notes(&mut self, notes: &[NoteEntry]) -> Result<(), StoreError>;

    fn read_shifts(&self) -> Result<Vec<ShiftEntry>, StoreError>;

    fn append_shift(&mut self, entry: &ShiftEntry) -> Result<(), StoreError>;

    /// Writes a derived file next to the log. Returns `None` when the store
    /// has no directory (in-memory stores).
    fn save_artifact(&self, name: &str, contents: &str) -> Result<Option<PathBuf>, StoreError>;

    /// Copies the log aside before an unreadable note set is overwritten.
    fn back_up(&self) -> Result<Option<PathBuf>, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
    date: NaiveDate,
    dir: Option<PathBuf>,
}

pub fn day_dir(data_dir: &Path, date: NaiveDate) -> PathBuf {
    data_dir.join(date.format(DATE_DIR_FORMAT).to_string())
}

impl SqliteStore {
    /// Opens (creating if needed) the log for `date`.
    ///
    /// A file that is not a readable journal is moved aside and replaced by a
    /// fresh, empty one so that startup never blocks on a damaged log.
    pub fn open(data_dir: &Path, date: NaiveDate) -> Result<Self, StoreError> {
        let dir = day_dir(data_dir, date);
        fs::create_dir_all(&dir)?;
        let path = dir.join(DB_FILE_NAME);

        match Self::open_at(&path) {
            Ok(conn) => Ok(Self {
                conn,
                date,
                dir: Some(dir),
            }),
            Err(err) if err.is_corrupt() => {
                let aside = quarantine(&path)?;
                warn!(
                    "journal {} unreadable ({err}); moved to {} and starting fresh",
                    path.display(),
                    aside.display()
                );
                let conn = Self::open_at(&path)?;
                Ok(Self {
                    conn,
                    date,
                    dir: Some(dir),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn open_in_memory(date: NaiveDate) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn,
            date,
            dir: None,
        })
    }

    fn open_at(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(conn)
    }

    fn touch(conn: &Connection, date: NaiveDate) -> rusqlite::Result<()> {
        let updated_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        conn.execute(
            r#"
INSERT INTO journal_meta (id, session_date, updated_at)
VALUES (1, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET updated_at=excluded.updated_at
            "#,
            (date.format(DATE_DIR_FORMAT).to_string(), updated_at),
        )?;
        Ok(())
    }
}

impl LogStore for SqliteStore {
    fn date(&self) -> NaiveDate {
        self.date
    }

    fn read_notes(&self) -> Result<Vec<NoteEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT category, subcategory, ts, content FROM notes ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for (i, r) in rows.enumerate() {
            let Some((category, subcategory, ts, content)) = skip_bad_row(r, "note", i)? else {
                continue;
            };
            let timestamp = match parse_ts(&ts) {
                Ok(t) => t,
                Err(err) => {
                    warn!("skipping note row {i} ({category}: {content:?}): {err}");
                    continue;
                }
            };
            let mut note = NoteEntry::new(category, timestamp, content);
            note.subcategory = subcategory.unwrap_or_default();
            out.push(note);
        }
        Ok(out)
    }

    fn replace_notes(&mut self, notes: &[NoteEntry]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM notes", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO notes (category, subcategory, ts, content) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for n in notes {
                stmt.execute(params![n.category, n.subcategory, n.timestamp_str(), n.content])?;
            }
        }
        Self::touch(&tx, self.date)?;
        tx.commit()?;
        Ok(())
    }

    fn read_shifts(&self) -> Result<Vec<ShiftEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, ts, worked, duration FROM shifts ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for (i, r) in rows.enumerate() {
            let Some((kind, ts, worked, duration)) = skip_bad_row(r, "shift", i)? else {
                continue;
            };
            let parsed = kind
                .parse::<ShiftKind>()
                .map_err(StoreError::Corrupt)
                .and_then(|kind| Ok((kind, parse_ts(&ts)?)));
            let (kind, timestamp) = match parsed {
                Ok(v) => v,
                Err(err) => {
                    warn!("skipping shift row {i} ({kind} at {ts}): {err}");
                    continue;
                }
            };
            let mut entry = ShiftEntry::new(kind, timestamp);
            entry.worked = worked;
            entry.duration = duration;
            out.push(entry);
        }
        Ok(out)
    }

    fn append_shift(&mut self, entry: &ShiftEntry) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO shifts (kind, ts, worked, duration) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.kind.as_str(),
                entry.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                entry.worked,
                entry.duration
            ],
        )?;
        Self::touch(&tx, self.date)?;
        tx.commit()?;
        Ok(())
    }

    fn save_artifact(&self, name: &str, contents: &str) -> Result<Option<PathBuf>, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let dest = dir.join(name);
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &dest)?;
        info!("wrote {}", dest.display());
        Ok(Some(dest))
    }

    fn back_up(&self) -> Result<Option<PathBuf>, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let stamp = Local::now().format("%H%M%S");
        let dest = dir.join(format!("{DB_FILE_NAME}.corrupt-{stamp}"));
        self.conn
            .execute("VACUUM INTO ?1", [dest.to_string_lossy().as_ref()])?;
        warn!("copied unreadable journal to {}", dest.display());
        Ok(Some(dest))
    }
}

/// Rows whose columns have the wrong SQL type are logged and dropped so the
/// rest of the day stays readable. Engine-level failures still propagate.
fn skip_bad_row<T>(row: rusqlite::Result<T>, what: &str, index: usize) -> Result<Option<T>, StoreError> {
    match row {
        Ok(v) => Ok(Some(v)),
        Err(
            err @ (rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)),
        ) => {
            warn!("skipping {what} row {index}: {err}");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn parse_ts(ts: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(ts.trim(), TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{ts}': {e}")))
}

fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let stamp = Local::now().format("%H%M%S");
    let aside = path.with_file_name(format!("{DB_FILE_NAME}.corrupt-{stamp}"));
    fs::rename(path, &aside)?;
    for suffix in ["-wal", "-shm"] {
        let side = path.with_file_name(format!("{DB_FILE_NAME}{suffix}"));
        if side.exists() {
            let _ = fs::remove_file(side);
        }
    }
    Ok(aside)
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS notes (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  category TEXT NOT NULL,
  ts TEXT NOT NULL,
  content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shifts (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  ts TEXT NOT NULL,
  worked REAL,
  duration REAL
);

CREATE TABLE IF NOT EXISTS journal_meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  session_date TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )?;
    ensure_notes_columns(conn)?;
    Ok(())
}

// Logs written before subcategories existed lack the column.
fn ensure_notes_columns(conn: &Connection) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(notes)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut cols: HashSet<String> = HashSet::new();
    for r in rows {
        cols.insert(r?);
    }

    if !cols.contains("subcategory") {
        conn.execute(
            "ALTER TABLE notes ADD COLUMN subcategory TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    Ok(())
}
