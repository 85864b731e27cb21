//! Declarative schedule file.
//!
//! ```json
//! { "entries": [
//!     { "name": "restart warning", "trigger": { "cron": "0 55 5 * * *" },
//!       "action": "say", "args": ["Restart in 5 minutes"] },
//!     { "trigger": { "event": "process.exited" }, "action": "log", "args": ["{payload}"] }
//! ] }
//! ```
//!
//! Cron expressions and `at` instants are evaluated in UTC; the host's
//! local time zone plays no part.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schedule loading error.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Cannot read schedule {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid schedule: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Entry {entry}: invalid cron expression {expression:?}: {error}")]
    Cron {
        entry: String,
        expression: String,
        error: String,
    },
    #[error("Entry {0}: empty event name")]
    EmptyEvent(String),
}

/// When an entry fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Six or seven field cron expression (seconds first, optional year),
    /// matched against UTC wall-clock time.
    Cron(String),
    /// A single instant. An RFC 3339 offset is honoured and converted to UTC.
    At(DateTime<Utc>),
    /// A named event.
    Event(String),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(expression) => write!(f, "cron {expression:?}"),
            Self::At(at) => write!(f, "at {}", at.to_rfc3339()),
            Self::Event(name) => write!(f, "event {name}"),
        }
    }
}

/// One schedule entry: a trigger bound to an action and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub trigger: Trigger,
    pub action: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Entry {
    /// Human-readable label: the name, or the position and action.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("#{index} ({})", self.action))
    }
}

/// Ordered schedule entries. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Schedule {
    /// Load and validate a schedule file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is invalid.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ScheduleError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ScheduleError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let schedule: Self = text.parse()?;
        tracing::info!(path = %path.display(), entries = schedule.entries.len(), "Schedule loaded");
        Ok(schedule)
    }

    /// Check every trigger: cron expressions must parse, event names must
    /// not be empty.
    ///
    /// # Errors
    /// Returns the first invalid entry.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (index, entry) in self.entries.iter().enumerate() {
            match &entry.trigger {
                Trigger::Cron(expression) => {
                    parse_cron(expression).map_err(|error| ScheduleError::Cron {
                        entry: entry.label(index),
                        expression: expression.clone(),
                        error,
                    })?;
                }
                Trigger::Event(name) if name.trim().is_empty() => {
                    return Err(ScheduleError::EmptyEvent(entry.label(index)));
                }
                Trigger::Event(_) | Trigger::At(_) => {}
            }
        }
        Ok(())
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let schedule: Self = serde_json::from_str(s)?;
        schedule.validate()?;
        Ok(schedule)
    }
}

pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    cron::Schedule::from_str(expression).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_trigger_kinds() {
        let schedule: Schedule = r#"{ "entries": [
            { "name": "warn", "trigger": { "cron": "0 55 5 * * *" }, "action": "say", "args": ["soon"] },
            { "trigger": { "at": "2030-01-01T06:00:00+01:00" }, "action": "restart" },
            { "trigger": { "event": "chat" }, "action": "log", "args": ["{payload}"] }
        ] }"#
            .parse()
            .unwrap();

        assert_eq!(schedule.entries.len(), 3);
        assert_eq!(schedule.entries[0].trigger, Trigger::Cron("0 55 5 * * *".into()));
        assert_eq!(schedule.entries[0].label(0), "warn");
        match &schedule.entries[1].trigger {
            Trigger::At(at) => assert_eq!(at.to_rfc3339(), "2030-01-01T05:00:00+00:00"),
            other => panic!("unexpected trigger {other}"),
        }
        assert!(schedule.entries[1].args.is_empty());
        assert_eq!(schedule.entries[2].label(2), "#2 (log)");
    }

    #[test]
    fn test_invalid_cron_rejected_at_load() {
        let err = r#"{ "entries": [ { "trigger": { "cron": "every day" }, "action": "log" } ] }"#
            .parse::<Schedule>()
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Cron { .. }));

        let err = r#"{ "entries": [ { "trigger": { "at": "tomorrow" }, "action": "log" } ] }"#
            .parse::<Schedule>()
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Json(_)));

        let err = r#"{ "entries": [ { "trigger": { "event": " " }, "action": "log" } ] }"#
            .parse::<Schedule>()
            .unwrap_err();
        assert!(matches!(err, ScheduleError::EmptyEvent(_)));
    }

    #[test]
    fn test_empty_document() {
        let schedule: Schedule = "{}".parse().unwrap();
        assert!(schedule.entries.is_empty());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(
            &path,
            r#"{ "entries": [ { "trigger": { "event": "process.exited" }, "action": "log" } ] }"#,
        )
        .unwrap();

        let schedule = Schedule::load(&path).await.unwrap();
        assert_eq!(schedule.entries[0].trigger, Trigger::Event("process.exited".into()));

        let err = Schedule::load(dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Io { .. }));
    }
}
