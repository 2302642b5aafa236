use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

const UTC_DATE_TAG: &str = "UTCDate";
const UTC_TIME_TAG: &str = "UTCTime";

/// One game from an archive: its tag pairs plus the opaque move text.
///
/// Tags keep the order they were first seen in; a key appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameRecord {
    tags: Vec<(String, String)>,
    move_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateTimeError {
    MissingTag(&'static str),
    InvalidTag { tag: &'static str, value: String },
}

impl fmt::Display for DateTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTag(tag) => write!(f, "Expected {tag} in tags"),
            Self::InvalidTag { tag, value } => write!(f, "Conversion error: {tag}='{value}'"),
        }
    }
}

impl std::error::Error for DateTimeError {}

impl GameRecord {
    /// `tags` must not repeat a key.
    pub(crate) fn new(tags: Vec<(String, String)>, move_text: String) -> Self {
        debug_assert!(
            tags.iter()
                .enumerate()
                .all(|(i, (key, _))| tags[..i].iter().all(|(k, _)| k != key)),
            "duplicate tag key in game record"
        );
        Self { tags, move_text }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn tag_keys(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|(k, _)| k.as_str())
    }

    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn move_text(&self) -> &str {
        &self.move_text
    }

    /// Canonical PGN text: tag lines, a blank line if any tags exist, then the moves.
    pub fn to_pgn_string(&self) -> String {
        self.to_string()
    }

    /// Tags as a JSON object, keys in record order.
    pub fn tags_json(&self) -> String {
        let object: Map<String, Value> = self
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(object).to_string()
    }

    /// When the game was played, from the `UTCDate` (`YYYY.MM.DD`) and
    /// `UTCTime` (`HH:MM:SS`) tags.
    pub fn utc_datetime(&self) -> Result<DateTime<Utc>, DateTimeError> {
        let date_raw = self
            .tag(UTC_DATE_TAG)
            .ok_or(DateTimeError::MissingTag(UTC_DATE_TAG))?;
        let time_raw = self
            .tag(UTC_TIME_TAG)
            .ok_or(DateTimeError::MissingTag(UTC_TIME_TAG))?;

        let date = NaiveDate::parse_from_str(date_raw.trim(), "%Y.%m.%d").map_err(|_| {
            DateTimeError::InvalidTag {
                tag: UTC_DATE_TAG,
                value: date_raw.to_string(),
            }
        })?;
        let time = NaiveTime::parse_from_str(time_raw.trim(), "%H:%M:%S").map_err(|_| {
            DateTimeError::InvalidTag {
                tag: UTC_TIME_TAG,
                value: time_raw.to_string(),
            }
        })?;

        Ok(date.and_time(time).and_utc())
    }
}

impl fmt::Display for GameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.tags {
            writeln!(f, "[{key} \"{value}\"]")?;
        }
        if !self.tags.is_empty() {
            writeln!(f)?;
        }
        f.write_str(&self.move_text)
    }
}
