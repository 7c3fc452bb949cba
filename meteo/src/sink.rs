//! Local persistence of report rows.
//!
//! Every row goes to two files under the storage root:
//!
//! - `{YYYY}/{MM}/{DD}.csv`: one file per calendar day, selected by the
//!   [`RotationKey`] passed with the row;
//! - `latest_mean.csv`: every row regardless of date, optionally bounded to
//!   the most recent `retention` rows.
//!
//! Both files are created on first use with a header row. Writes are plain
//! appends; only the retention trim rewrites the latest file (via a
//! temporary file and rename).

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};

use crate::channel::TIME_COLUMN;
use crate::error::{PersistError, Result};

/// Name of the always-appended summary file.
pub const LATEST_FILE: &str = "latest_mean.csv";

/// Selects the daily file a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RotationKey {
    date: NaiveDate,
}

impl RotationKey {
    /// The key for a calendar date.
    pub fn from_date(date: NaiveDate) -> Self {
        Self { date }
    }

    /// Path of the daily file relative to the storage root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!("{:04}", self.date.year()))
            .join(format!("{:02}", self.date.month()))
            .join(format!("{:02}.csv", self.date.day()))
    }
}

impl fmt::Display for RotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date.format("%Y-%m-%d"))
    }
}

/// Append-only destination for report rows.
pub trait RecordSink {
    /// Appends one row (without trailing newline) under `rotation`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if any destination could not be written.
    fn append(&mut self, row: &str, rotation: &RotationKey) -> Result<()>;
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn append(&mut self, row: &str, rotation: &RotationKey) -> Result<()> {
        (**self).append(row, rotation)
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn append(&mut self, row: &str, rotation: &RotationKey) -> Result<()> {
        (**self).append(row, rotation)
    }
}

/// CSV files under a storage root.
#[derive(Debug)]
pub struct CsvStore {
    root: PathBuf,
    header: String,
    retention: Option<usize>,
    latest_rows: Option<usize>,
}

impl CsvStore {
    /// Creates a store rooted at `root`. `columns` are the channel names; the
    /// header row is `time,` followed by them.
    pub fn new<'a>(root: impl Into<PathBuf>, columns: impl IntoIterator<Item = &'a str>) -> Self {
        let mut header = String::from(TIME_COLUMN);
        for column in columns {
            header.push(',');
            header.push_str(column);
        }

        Self {
            root: root.into(),
            header,
            retention: None,
            latest_rows: None,
        }
    }

    /// Keeps at most `rows` data rows in the latest file.
    #[must_use]
    pub fn with_retention(mut self, rows: Option<usize>) -> Self {
        self.retention = rows;
        self
    }

    /// Path of the daily file for `rotation`.
    pub fn daily_path(&self, rotation: &RotationKey) -> PathBuf {
        self.root.join(rotation.relative_path())
    }

    /// Path of the latest file.
    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    /// Appends `row` to `path`, creating it (and its parents) with a header.
    /// Returns `true` if the file was created.
    fn append_to(&self, path: &Path, row: &str) -> std::result::Result<bool, PersistError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PersistError::CreateDir {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PersistError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        let created = file
            .metadata()
            .map(|m| m.len() == 0)
            .map_err(|e| PersistError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut buf = String::with_capacity(self.header.len() + row.len() + 2);
        if created {
            buf.push_str(&self.header);
            buf.push('\n');
        }
        buf.push_str(row);
        buf.push('\n');

        file.write_all(buf.as_bytes())
            .map_err(|e| PersistError::Write {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(created)
    }

    /// Appends to the latest file and trims it to the retention limit.
    fn append_latest(&mut self, row: &str) -> std::result::Result<(), PersistError> {
        let path = self.latest_path();
        let created = self.append_to(&path, row)?;

        let Some(limit) = self.retention else {
            return Ok(());
        };

        let rows = match (created, self.latest_rows) {
            (true, _) => 1,
            (false, Some(rows)) => rows + 1,
            (false, None) => count_rows(&path)?,
        };

        if rows > limit {
            trim_rows(&path, limit)?;
            self.latest_rows = Some(limit);
        } else {
            self.latest_rows = Some(rows);
        }

        Ok(())
    }
}

impl RecordSink for CsvStore {
    fn append(&mut self, row: &str, rotation: &RotationKey) -> Result<()> {
        let daily = self.append_to(&self.daily_path(rotation), row);
        let latest = self.append_latest(row);
        daily?;
        latest?;
        Ok(())
    }
}

/// Number of data rows (excluding the header) in a CSV file.
fn count_rows(path: &Path) -> std::result::Result<usize, PersistError> {
    let file = File::open(path).map_err(|e| PersistError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    let lines = BufReader::new(file).lines().count();
    Ok(lines.saturating_sub(1))
}

/// Rewrites `path` keeping the header and the newest `keep` rows.
fn trim_rows(path: &Path, keep: usize) -> std::result::Result<(), PersistError> {
    let trim_err = |e| PersistError::Trim {
        path: path.to_path_buf(),
        source: e,
    };

    let content = fs::read_to_string(path).map_err(trim_err)?;
    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default();
    let rows: Vec<&str> = lines.collect();
    let kept = &rows[rows.len().saturating_sub(keep)..];

    let mut out = String::with_capacity(content.len());
    out.push_str(header);
    out.push('\n');
    for row in kept {
        out.push_str(row);
        out.push('\n');
    }

    let tmp = path.with_extension("csv.tmp");
    fs::write(&tmp, out).map_err(trim_err)?;
    fs::rename(&tmp, path).map_err(trim_err)?;

    tracing::debug!(path = %path.display(), kept = kept.len(), "trimmed latest file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeteoError;

    fn date(y: i32, m: u32, d: u32) -> RotationKey {
        RotationKey::from_date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_rotation_key_path() {
        let key = date(2024, 3, 7);
        assert_eq!(key.relative_path(), PathBuf::from("2024/03/07.csv"));
        assert_eq!(key.to_string(), "2024-03-07");
    }

    #[test]
    fn test_append_creates_both_files_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvStore::new(dir.path(), ["temperature", "rain"]);
        let key = date(2024, 3, 7);

        store.append("100,21.5,0.2", &key).unwrap();
        store.append("130,21.7,0", &key).unwrap();

        let expected = "time,temperature,rain\n100,21.5,0.2\n130,21.7,0\n";
        assert_eq!(
            fs::read_to_string(dir.path().join("2024/03/07.csv")).unwrap(),
            expected
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(LATEST_FILE)).unwrap(),
            expected
        );
    }

    #[test]
    fn test_rotation_splits_daily_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvStore::new(dir.path(), ["rain"]);

        store.append("1,0.1", &date(2024, 3, 7)).unwrap();
        store.append("2,0.2", &date(2024, 3, 8)).unwrap();

        assert_eq!(
            fs::read_to_string(store.daily_path(&date(2024, 3, 7))).unwrap(),
            "time,rain\n1,0.1\n"
        );
        assert_eq!(
            fs::read_to_string(store.daily_path(&date(2024, 3, 8))).unwrap(),
            "time,rain\n2,0.2\n"
        );
        assert_eq!(
            fs::read_to_string(store.latest_path()).unwrap(),
            "time,rain\n1,0.1\n2,0.2\n"
        );
    }

    #[test]
    fn test_latest_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvStore::new(dir.path(), ["rain"]).with_retention(Some(3));
        let key = date(2024, 3, 7);

        for ts in 1..=5 {
            store.append(&format!("{ts},0"), &key).unwrap();
        }

        assert_eq!(
            fs::read_to_string(store.latest_path()).unwrap(),
            "time,rain\n3,0\n4,0\n5,0\n"
        );
        // the daily file keeps everything
        assert_eq!(count_rows(&store.daily_path(&key)).unwrap(), 5);
    }

    #[test]
    fn test_retention_applies_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LATEST_FILE),
            "time,rain\n1,0\n2,0\n3,0\n4,0\n",
        )
        .unwrap();

        let mut store = CsvStore::new(dir.path(), ["rain"]).with_retention(Some(2));
        store.append("5,0", &date(2024, 3, 7)).unwrap();

        assert_eq!(
            fs::read_to_string(store.latest_path()).unwrap(),
            "time,rain\n4,0\n5,0\n"
        );
    }

    #[test]
    fn test_unwritable_root_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "").unwrap();

        let mut store = CsvStore::new(&blocker, ["rain"]);
        let err = store.append("1,0", &date(2024, 3, 7)).unwrap_err();

        assert!(matches!(err, MeteoError::Persist(_)));
    }
}
