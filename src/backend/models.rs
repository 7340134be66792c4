use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::error::BackendError;

pub const DEFAULT_NUM_QUESTIONS: usize = 5;

const QUIZZES_TABLE: &str = "quizzes";
const QUESTIONS_TABLE: &str = "questions";
const RESULTS_TABLE: &str = "quiz_results";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub week: Option<u32>,
    pub course_id: Option<Uuid>,
    pub num_questions: usize,
    /// Zero means the quiz is untimed.
    pub timer_seconds: u64,
    pub is_enabled: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Availability {
    Available,
    Disabled,
    NotYetOpen,
    Closed,
}

impl Quiz {
    /// Parses a `quizzes` row, defaulting the numeric settings the admin
    /// screens leave blank.
    pub fn from_row(row: &JsonValue) -> Result<Self, BackendError> {
        let id = uuid_field(row, "id").ok_or_else(|| invalid(QUIZZES_TABLE, "missing or invalid id"))?;
        let title = row
            .get("title")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(QUIZZES_TABLE, format!("quiz {id} has no title")))?;

        let num_questions = match int_field(row, "num_questions") {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_NUM_QUESTIONS,
        };
        let timer_seconds = match int_field(row, "timer_seconds") {
            Some(n) if n > 0 => n as u64,
            _ => 0,
        };

        Ok(Self {
            id,
            title,
            week: int_field(row, "week").and_then(|w| u32::try_from(w).ok()),
            course_id: uuid_field(row, "course_id"),
            num_questions,
            timer_seconds,
            is_enabled: row
                .get("is_enabled")
                .and_then(JsonValue::as_bool)
                .unwrap_or(true),
            valid_from: timestamp_field(row, "valid_from"),
            valid_to: timestamp_field(row, "valid_to"),
        })
    }

    pub fn is_timed(&self) -> bool {
        self.timer_seconds > 0
    }

    pub fn availability(&self, now: DateTime<Utc>) -> Availability {
        if !self.is_enabled {
            return Availability::Disabled;
        }
        if let Some(from) = self.valid_from
            && now < from
        {
            return Availability::NotYetOpen;
        }
        if let Some(to) = self.valid_to
            && now > to
        {
            return Availability::Closed;
        }
        Availability::Available
    }

    /// Whole calendar days left until `valid_to`, counted from `today`.
    pub fn days_remaining(&self, today: NaiveDate) -> Option<i64> {
        self.valid_to
            .map(|to| (to.date_naive() - today).num_days())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub text: String,
    pub options: Vec<String>,
    pub correct_option: usize,
}

impl Question {
    pub fn from_row(row: &JsonValue) -> Result<Self, BackendError> {
        let id = uuid_field(row, "id").ok_or_else(|| invalid(QUESTIONS_TABLE, "missing or invalid id"))?;
        let quiz_id = uuid_field(row, "quiz_id")
            .ok_or_else(|| invalid(QUESTIONS_TABLE, format!("question {id} has no quiz_id")))?;
        let text = row
            .get("question_text")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(QUESTIONS_TABLE, format!("question {id} has no text")))?;

        let options = options_field(row)
            .ok_or_else(|| invalid(QUESTIONS_TABLE, format!("question {id} has malformed options")))?;
        if options.is_empty() {
            return Err(invalid(
                QUESTIONS_TABLE,
                format!("question {id} has no options"),
            ));
        }

        let correct_option = int_field(row, "correct_option")
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n < options.len())
            .ok_or_else(|| {
                invalid(
                    QUESTIONS_TABLE,
                    format!(
                        "question {id} has a correct_option outside its {} options",
                        options.len()
                    ),
                )
            })?;

        Ok(Self {
            id,
            quiz_id,
            text,
            options,
            correct_option,
        })
    }

    /// Parses every row, dropping the ones that would break scoring.
    pub fn from_rows(rows: &[JsonValue]) -> Vec<Self> {
        rows.iter()
            .filter_map(|row| match Self::from_row(row) {
                Ok(question) => Some(question),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed question row");
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizResult {
    pub id: String,
    pub quiz_id: Uuid,
    pub student_id: String,
    pub score: u32,
    pub total: u32,
    pub taken_at: Option<DateTime<Utc>>,
}

impl QuizResult {
    pub fn from_row(row: &JsonValue) -> Result<Self, BackendError> {
        let id = match row.get("id") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Err(invalid(RESULTS_TABLE, "missing id")),
        };
        let quiz_id = uuid_field(row, "quiz_id")
            .ok_or_else(|| invalid(RESULTS_TABLE, format!("result {id} has no quiz_id")))?;
        let student_id = row
            .get("student_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(RESULTS_TABLE, format!("result {id} has no student_id")))?;

        Ok(Self {
            id,
            quiz_id,
            student_id,
            score: int_field(row, "score")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            total: int_field(row, "total")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            taken_at: timestamp_field(row, "taken_at"),
        })
    }
}

/// Row written once per completed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewQuizResult {
    pub quiz_id: Uuid,
    pub student_id: String,
    pub score: u32,
    pub total: u32,
    pub taken_at: DateTime<Utc>,
}

fn invalid(table: &'static str, reason: impl Into<String>) -> BackendError {
    BackendError::InvalidRow {
        table,
        reason: reason.into(),
    }
}

fn uuid_field(row: &JsonValue, key: &str) -> Option<Uuid> {
    row.get(key)
        .and_then(JsonValue::as_str)
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
}

// Accepts JSON numbers as well as numeric strings; form inputs
// occasionally land in the table as text.
fn int_field(row: &JsonValue, key: &str) -> Option<i64> {
    match row.get(key)? {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn options_field(row: &JsonValue) -> Option<Vec<String>> {
    let parsed;
    let value = match row.get("options")? {
        JsonValue::String(encoded) => {
            parsed = serde_json::from_str::<JsonValue>(encoded).ok()?;
            &parsed
        }
        other => other,
    };

    value
        .as_array()?
        .iter()
        .map(|opt| opt.as_str().map(str::to_string))
        .collect()
}

fn timestamp_field(row: &JsonValue, key: &str) -> Option<DateTime<Utc>> {
    let raw = row.get(key)?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = parse_timestamp(raw);
    if parsed.is_none() {
        tracing::warn!(field = key, value = raw, "Ignoring unparseable timestamp");
    }
    parsed
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
