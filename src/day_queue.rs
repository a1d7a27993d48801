//! Day queue: pending raw recordings grouped by calendar day.
//!
//! The grouping is recomputed from the input folder on every reload and is
//! never persisted. Day keys are UTC dates (`YYYY-MM-DD`) of each file's
//! predicted start time and are navigated in ascending order.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info};
use serde::Serialize;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::ProcessingConfig;
use crate::error::OptionExt;
use crate::{Result, ReviewError};

/// A raw recording waiting in the input folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub predicted_start: DateTime<Utc>,
}

impl RawFile {
    /// Calendar day this file is reviewed under.
    pub fn day_key(&self) -> String {
        day_key(&self.predicted_start)
    }
}

pub fn day_key(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d").to_string()
}

fn source_unavailable(path: &Path, e: impl std::fmt::Display) -> ReviewError {
    ReviewError::SourceUnavailable {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Best-effort start time of a recording: the first `<time>` element of the
/// file, or the file's modification time when none can be read.
pub fn predict_start_time(path: &Path) -> Result<DateTime<Utc>> {
    let file = File::open(path).map_err(|e| source_unavailable(path, e))?;

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if let Some(start) = line.find("<time>") {
            let rest = &line[start + "<time>".len()..];
            let Some(end) = rest.find("</time>") else {
                break;
            };
            if let Some(time) = parse_timestamp(&rest[..end]) {
                return Ok(time);
            }
            break;
        }
    }

    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| source_unavailable(path, e))?;
    debug!(
        "[DayQueue] No <time> in {}, using modification time",
        path.display()
    );
    Ok(DateTime::<Utc>::from(modified))
}

/// List supported files in `input`, sorted by predicted start time.
///
/// Either every file is listed or the call fails with
/// [`ReviewError::SourceUnavailable`].
pub fn list_pending(input: &Path, config: &ProcessingConfig) -> Result<Vec<RawFile>> {
    let entries = fs::read_dir(input).map_err(|e| source_unavailable(input, e))?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| source_unavailable(input, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry.metadata().map_err(|e| source_unavailable(&entry.path(), e))?;
        if metadata.is_file() && config.is_supported(&name) {
            candidates.push((name, entry.path(), metadata.len()));
        }
    }

    #[cfg(feature = "parallel")]
    let iter = candidates.into_par_iter();
    #[cfg(not(feature = "parallel"))]
    let iter = candidates.into_iter();

    let mut files = iter
        .map(|(name, path, size)| {
            let predicted_start = predict_start_time(&path)?;
            Ok(RawFile {
                name,
                path,
                size,
                predicted_start,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    files.sort_by(|a, b| {
        a.predicted_start
            .cmp(&b.predicted_start)
            .then_with(|| a.name.cmp(&b.name))
    });
    debug!("[DayQueue] {} pending file(s) in {}", files.len(), input.display());
    Ok(files)
}

/// Pending files grouped by day, with a cursor on the day under review.
#[derive(Debug, Clone, Default)]
pub struct DayQueue {
    days: BTreeMap<String, Vec<RawFile>>,
    current: Option<String>,
}

impl DayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group `files` by day and select the first day.
    pub fn from_files(files: Vec<RawFile>) -> Self {
        let mut queue = Self::new();
        queue.reload(files);
        queue
    }

    /// Replace the grouping with `files`.
    ///
    /// The current day stays selected if it still has files; otherwise the
    /// first day is selected.
    pub fn reload(&mut self, files: Vec<RawFile>) {
        let mut days: BTreeMap<String, Vec<RawFile>> = BTreeMap::new();
        for file in files {
            days.entry(file.day_key()).or_default().push(file);
        }
        self.days = days;

        let keep = self
            .current
            .as_ref()
            .is_some_and(|day| self.days.contains_key(day));
        if !keep {
            self.current = self.days.keys().next().cloned();
        }
        info!(
            "[DayQueue] {} day(s) queued, current {:?}",
            self.days.len(),
            self.current
        );
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    /// Queued day keys in ascending order.
    pub fn day_keys(&self) -> Vec<String> {
        self.days.keys().cloned().collect()
    }

    pub fn current_day(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Files of the current day, oldest first. Empty when no day is selected.
    pub fn current_day_files(&self) -> &[RawFile] {
        self.current
            .as_ref()
            .and_then(|day| self.days.get(day))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, day: &str) -> bool {
        self.days.contains_key(day)
    }

    pub fn select_day(&mut self, day: &str) -> Result<()> {
        let (key, _) = self.days.get_key_value(day).ok_or_day_not_found(day)?;
        self.current = Some(key.clone());
        Ok(())
    }

    /// Move to the next day after the current one, wrapping to the first.
    ///
    /// With `remove_current` the current day is evicted first. Returns the
    /// newly selected day, or `None` once the queue is empty.
    pub fn advance_day(&mut self, remove_current: bool) -> Option<&str> {
        let previous = self.current.take();
        if remove_current {
            if let Some(day) = &previous {
                self.days.remove(day);
            }
        }

        let next = previous
            .as_ref()
            .and_then(|day| {
                self.days
                    .range::<String, _>((
                        std::ops::Bound::Excluded(day),
                        std::ops::Bound::Unbounded,
                    ))
                    .next()
            })
            .or_else(|| self.days.iter().next())
            .map(|(day, _)| day.clone());

        self.current = next;
        self.current.as_deref()
    }

    /// Keep the current day queued and move to the next one.
    pub fn skip(&mut self) -> Option<&str> {
        self.advance_day(false)
    }

    /// Evict `day` from the queue (its files stay on disk). When it is the
    /// current day the next day is selected.
    pub fn remove_day(&mut self, day: &str) -> Result<()> {
        if !self.days.contains_key(day) {
            return Err(ReviewError::DayNotFound {
                day: day.to_string(),
            });
        }
        if self.current.as_deref() == Some(day) {
            self.advance_day(true);
        } else {
            self.days.remove(day);
        }
        Ok(())
    }
}
