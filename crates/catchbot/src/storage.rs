//! Date-partitioned CSV log of observed results.
//!
//! One file per local calendar date, named `<month>-<day>.csv` without zero
//! padding, under the results directory. Rows are appended, never rewritten;
//! the file switches when the date key changes between two saves.

use crate::types::{CatchError, CatchResult, CrashResult};
use chrono::{Datelike, Local, NaiveDateTime};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// First line of every log file.
pub const HEADER: &str = "gameId,multiplier,timestamp";

const MULTIPLIER_WIDTH: usize = 7;

/// `<month>-<day>`, no zero padding.
pub fn date_key(at: NaiveDateTime) -> String {
    format!("{}-{}", at.month(), at.day())
}

/// `MM:ddTHH:mm:ss`, zero padded.
pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format("%m:%dT%H:%M:%S").to_string()
}

/// Left-pad to the column width, then drop a trailing unit suffix such as `x`.
pub fn format_multiplier(multiplier: &str) -> String {
    let mut padded = format!("{multiplier:>width$}", width = MULTIPLIER_WIDTH);
    if padded.chars().last().is_some_and(|c| !c.is_ascii_digit()) {
        padded.pop();
    }
    padded
}

/// One data row, newline terminated.
pub fn format_row(record: &CrashResult, at: NaiveDateTime) -> String {
    format!(
        "{},{},  {}\n",
        record.game_id,
        format_multiplier(&record.multiplier),
        format_timestamp(at)
    )
}

/// Create `path` with the header, or reset it to the header when it is
/// blank or has no header. Returns the resulting file content.
fn ensure_header(path: &Path) -> CatchResult<String> {
    let header_line = format!("{HEADER}\n");
    if !path.exists() {
        std::fs::write(path, &header_line).map_err(|e| CatchError::persistence(path, e))?;
        info!(path = %path.display(), "created result log with header");
        return Ok(header_line);
    }

    let content = std::fs::read_to_string(path).map_err(|e| CatchError::persistence(path, e))?;
    if content.trim().is_empty() || !content.contains("gameId") {
        std::fs::write(path, &header_line).map_err(|e| CatchError::persistence(path, e))?;
        info!(path = %path.display(), "initialized result log header");
        return Ok(header_line);
    }
    Ok(content)
}

struct ActiveFile {
    date_key: String,
    path: PathBuf,
    file: File,
    last_game_id: Option<String>,
}

/// Game id of the last data row in `content`.
fn last_row_id(content: &str) -> Option<String> {
    content
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("gameId"))
        .find_map(|line| line.split(',').next())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// Append-only result log with daily rotation.
pub struct ResultLog {
    results_dir: PathBuf,
    active: Option<ActiveFile>,
}

impl ResultLog {
    /// Open the log and initialise today's file.
    pub fn open(results_dir: impl Into<PathBuf>) -> CatchResult<Self> {
        Self::open_at(results_dir, Local::now().naive_local())
    }

    /// Open the log as of `now`.
    pub fn open_at(results_dir: impl Into<PathBuf>, now: NaiveDateTime) -> CatchResult<Self> {
        let results_dir = results_dir.into();
        if !results_dir.exists() {
            std::fs::create_dir_all(&results_dir)
                .map_err(|e| CatchError::persistence(&results_dir, e))?;
            info!(path = %results_dir.display(), "created results directory");
        }

        let mut log = Self {
            results_dir,
            active: None,
        };
        log.activate(date_key(now))?;
        Ok(log)
    }

    fn activate(&mut self, key: String) -> CatchResult<()> {
        let path = self.results_dir.join(format!("{key}.csv"));
        let content = ensure_header(&path)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| CatchError::persistence(&path, e))?;

        if self.active.is_some() {
            info!(path = %path.display(), "switched to new date file");
        }
        self.active = Some(ActiveFile {
            date_key: key,
            path,
            file,
            last_game_id: last_row_id(&content),
        });
        Ok(())
    }

    /// Append `record` stamped with the local clock.
    pub fn save(&mut self, record: &CrashResult) -> CatchResult<()> {
        self.save_at(record, Local::now().naive_local())
    }

    /// Append `record` stamped with `at`, switching files if the date changed.
    pub fn save_at(&mut self, record: &CrashResult, at: NaiveDateTime) -> CatchResult<()> {
        let key = date_key(at);
        if self.active.as_ref().map(|a| a.date_key.as_str()) != Some(key.as_str()) {
            self.activate(key)?;
        }

        let row = format_row(record, at);
        let Some(active) = self.active.as_mut() else {
            return Err(CatchError::persistence(
                &self.results_dir,
                std::io::Error::other("result log has no active file"),
            ));
        };
        active
            .file
            .write_all(row.as_bytes())
            .and_then(|()| active.file.flush())
            .map_err(|e| CatchError::persistence(&active.path, e))?;
        active.last_game_id = Some(record.game_id.clone());

        debug!(
            game_id = %record.game_id,
            multiplier = %record.multiplier,
            path = %active.path.display(),
            "saved crash result"
        );
        Ok(())
    }

    pub fn current_file_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    pub fn results_directory(&self) -> &Path {
        &self.results_dir
    }

    /// Game id of the last data row in the current file, if any.
    pub fn last_game_id(&self) -> Option<&str> {
        self.active.as_ref()?.last_game_id.as_deref()
    }
}
