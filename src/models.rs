use chrono::{NaiveDate, NaiveTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{TrackerError, TrackerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Applied,
    Interview,
    Rejected,
    Offer,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Applied, Status::Interview, Status::Rejected, Status::Offer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Applied => "Applied",
            Status::Interview => "Interview",
            Status::Rejected => "Rejected",
            Status::Offer => "Offer",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                TrackerError::InvalidStatus(format!(
                    "'{}' (expected one of Applied, Interview, Rejected, Offer)",
                    s
                ))
            })
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse()
            .map_err(|_| FromSqlError::Other(format!("Unknown status '{}'", raw).into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
        }
    }

    /// Lenient parse for values written by older versions.
    pub fn from_legacy(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(TrackerError::Validation(format!(
                "Invalid difficulty '{}' (expected Easy, Medium or Hard)",
                s
            ))),
        }
    }
}

impl ToSql for Difficulty {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// Interview columns that used to live directly on the application row.
/// Read-only: nothing writes them any more.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyInterview {
    pub date: Option<String>,
    pub time: Option<String>,
    pub venue: Option<String>,
    pub completed: bool,
    pub difficulty: Option<String>,
    pub notes: Option<String>,
}

impl LegacyInterview {
    pub fn is_empty(&self) -> bool {
        self.date.as_deref().is_none_or(|d| d.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub company: String,
    pub role: String,
    pub location: String,
    pub job_link: String,
    pub status: Status,
    pub applied_date: NaiveDate,
    pub notes: Option<String>,
    pub legacy: LegacyInterview,
}

/// Raw user input for creating or editing an application.
#[derive(Debug, Clone, Default)]
pub struct ApplicationInput {
    pub company: String,
    pub role: String,
    pub location: String,
    pub job_link: String,
    pub status: String,
    pub applied_date: String,
    pub notes: Option<String>,
}

/// Input that passed validation and can be written as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidApplication {
    pub company: String,
    pub role: String,
    pub location: String,
    pub job_link: String,
    pub status: Status,
    pub applied_date: NaiveDate,
    pub notes: Option<String>,
}

impl ApplicationInput {
    /// `today` bounds the applied date; pass `None` to skip that check (edits).
    pub fn validate(&self, today: Option<NaiveDate>) -> TrackerResult<ValidApplication> {
        let company = required("company", &self.company)?;
        let role = required("role", &self.role)?;
        let location = required("location", &self.location)?;
        let job_link = required("job link", &self.job_link)?;
        if !is_valid_job_link(&job_link) {
            return Err(TrackerError::Validation(format!(
                "job link '{}' must be an http:// or https:// URL",
                job_link
            )));
        }

        let status: Status = self.status.parse()?;
        let applied_date = parse_date("applied date", &self.applied_date)?;
        if let Some(today) = today {
            if applied_date > today {
                return Err(TrackerError::Validation(format!(
                    "applied date {} is in the future",
                    applied_date
                )));
            }
        }

        Ok(ValidApplication {
            company,
            role,
            location,
            job_link,
            status,
            applied_date,
            notes: optional(self.notes.as_deref()),
        })
    }
}

pub fn is_valid_job_link(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

pub fn parse_date(field: &str, raw: &str) -> TrackerResult<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::Validation(format!("{} is required", field)));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        TrackerError::Validation(format!("{} '{}' is not a YYYY-MM-DD date", field, trimmed))
    })
}

pub fn parse_time(field: &str, raw: &str) -> TrackerResult<NaiveTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::Validation(format!("{} is required", field)));
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| TrackerError::Validation(format!("{} '{}' is not an HH:MM time", field, trimmed)))
}

pub fn required(field: &str, raw: &str) -> TrackerResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(TrackerError::Validation(format!("{} is required", field)))
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn optional(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewRecord {
    pub id: i64,
    pub application_id: i64,
    pub company_tag: String,
    pub role_tag: String,
    pub interview_date: NaiveDate,
    pub interview_time: NaiveTime,
    pub venue: String,
    pub completed: bool,
    pub difficulty: Option<Difficulty>,
    pub notes: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterviewSource {
    Record,
    Legacy,
}

/// What presentation sees of an interview, wherever it was stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewView {
    pub application_id: i64,
    pub company: String,
    pub role: String,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub venue: String,
    pub completed: bool,
    pub difficulty: Option<Difficulty>,
    pub notes: Option<String>,
    pub source: InterviewSource,
}

impl From<InterviewRecord> for InterviewView {
    fn from(record: InterviewRecord) -> Self {
        Self {
            application_id: record.application_id,
            company: record.company_tag,
            role: record.role_tag,
            date: record.interview_date,
            time: Some(record.interview_time),
            venue: record.venue,
            completed: record.completed,
            difficulty: record.difficulty,
            notes: record.notes,
            source: InterviewSource::Record,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub credential: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub name: Option<String>,
    pub age: Option<i64>,
    pub bio: Option<String>,
    pub qualifications: Option<String>,
    pub experience: Option<String>,
    pub projects: Option<String>,
    pub skills: Option<String>,
    pub achievements: Option<String>,
    pub portfolio_links: Option<String>,
    pub looking_for: Option<String>,
}

impl ProfileFields {
    /// Overwrite fields with every non-empty value from `other`.
    pub fn merge_from(&mut self, other: &ProfileFields) {
        fn take(target: &mut Option<String>, source: &Option<String>) {
            if let Some(value) = optional(source.as_deref()) {
                *target = Some(value);
            }
        }
        take(&mut self.name, &other.name);
        if other.age.is_some() {
            self.age = other.age;
        }
        take(&mut self.bio, &other.bio);
        take(&mut self.qualifications, &other.qualifications);
        take(&mut self.experience, &other.experience);
        take(&mut self.projects, &other.projects);
        take(&mut self.skills, &other.skills);
        take(&mut self.achievements, &other.achievements);
        take(&mut self.portfolio_links, &other.portfolio_links);
        take(&mut self.looking_for, &other.looking_for);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub account_id: i64,
    pub fields: ProfileFields,
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ApplicationInput {
        ApplicationInput {
            company: " Acme ".to_string(),
            role: "Engineer".to_string(),
            location: "Remote".to_string(),
            job_link: "https://acme.example/jobs/1".to_string(),
            status: "applied".to_string(),
            applied_date: "2024-01-01".to_string(),
            notes: Some("   ".to_string()),
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Interview".parse::<Status>().unwrap(), Status::Interview);
        assert_eq!("offer".parse::<Status>().unwrap(), Status::Offer);
        let err = "Ghosted".parse::<Status>().unwrap_err();
        assert!(matches!(err, TrackerError::InvalidStatus(_)));
    }

    #[test]
    fn test_validate_trims_and_drops_blank_notes() {
        let valid = input().validate(Some(day("2024-02-01"))).unwrap();
        assert_eq!(valid.company, "Acme");
        assert_eq!(valid.status, Status::Applied);
        assert_eq!(valid.notes, None);
    }

    #[test]
    fn test_validate_rejects_bad_links() {
        for link in ["", "acme.example/jobs", "ftp://acme.example/x", "https://"] {
            let mut bad = input();
            bad.job_link = link.to_string();
            let err = bad.validate(None).unwrap_err();
            assert!(matches!(err, TrackerError::Validation(_)), "{link}");
        }
    }

    #[test]
    fn test_validate_rejects_future_date_only_on_create() {
        let mut future = input();
        future.applied_date = "2030-01-01".to_string();
        assert!(future.validate(Some(day("2024-02-01"))).is_err());
        assert!(future.validate(None).is_ok());
    }

    #[test]
    fn test_validate_unknown_status() {
        let mut bad = input();
        bad.status = "Hired".to_string();
        assert!(matches!(bad.validate(None).unwrap_err(), TrackerError::InvalidStatus(_)));
    }

    #[test]
    fn test_parse_time_accepts_seconds() {
        assert_eq!(parse_time("time", "14:00").unwrap(), NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(parse_time("time", "09:30:15").unwrap(), NaiveTime::from_hms_opt(9, 30, 15).unwrap());
        assert!(parse_time("time", "2pm").is_err());
        assert!(parse_time("time", "  ").is_err());
    }

    #[test]
    fn test_profile_merge_keeps_existing_when_empty() {
        let mut stored = ProfileFields {
            bio: Some("old bio".to_string()),
            skills: Some("Rust".to_string()),
            ..Default::default()
        };
        let draft = ProfileFields {
            bio: Some("  ".to_string()),
            skills: Some("Rust, SQL".to_string()),
            looking_for: Some("Backend".to_string()),
            ..Default::default()
        };
        stored.merge_from(&draft);
        assert_eq!(stored.bio.as_deref(), Some("old bio"));
        assert_eq!(stored.skills.as_deref(), Some("Rust, SQL"));
        assert_eq!(stored.looking_for.as_deref(), Some("Backend"));
    }
}
