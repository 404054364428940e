use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{TrackerError, TrackerResult};
use crate::lifecycle;
use crate::models::{
    optional, required, Account, Application, ApplicationInput, LegacyInterview, Profile, ProfileFields,
    Status,
};
use crate::promoter::PromotionReport;
use crate::schema::{self, ReconcileReport};

pub struct Database {
    pub(crate) conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationFilter {
    pub status: Option<Status>,
    pub company: Option<String>,
}

/// An application plus the flags derived from it on read.
#[derive(Debug, Clone)]
pub struct ApplicationSummary {
    pub application: Application,
    pub needs_follow_up: bool,
    pub awaiting_interview_details: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationSummary {
    pub schema: ReconcileReport,
    pub promotion: PromotionReport,
}

pub(crate) const APPLICATION_COLUMNS: &str = "a.id, a.company, a.role, a.location, a.job_link, a.status, a.applied_date, a.notes,
     a.interview_date, a.interview_time, a.interview_venue, a.interview_completed,
     a.interview_difficulty, a.interview_experience_notes";

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> TrackerResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    #[cfg(test)]
    pub fn from_connection(conn: Connection) -> TrackerResult<Self> {
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    fn configure(conn: &Connection) -> TrackerResult<()> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobtrack") {
            proj_dirs.data_dir().join("jobtrack.db")
        } else {
            PathBuf::from("jobtrack.db")
        }
    }

    /// Structural reconciliation followed by promotion of inline legacy
    /// interview data. Must finish before anything else touches the store.
    pub fn migrate(&mut self) -> TrackerResult<MigrationSummary> {
        let schema = schema::reconcile(&mut self.conn)?;
        let promotion = self.promote_legacy_interviews()?;
        info!(path = %self.path.display(), "Store ready");
        Ok(MigrationSummary { schema, promotion })
    }

    // --- Application operations ---

    pub fn create_application(&mut self, input: &ApplicationInput, today: NaiveDate) -> TrackerResult<Application> {
        let valid = input.validate(Some(today))?;
        self.conn.execute(
            "INSERT INTO applications (company, role, location, job_link, status, applied_date, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                valid.company,
                valid.role,
                valid.location,
                valid.job_link,
                valid.status,
                valid.applied_date,
                valid.notes
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(id, company = %valid.company, "Created application");
        self.get_application(id)
    }

    /// Edits never touch an existing interview record's company/role tags.
    pub fn update_application(&mut self, id: i64, input: &ApplicationInput) -> TrackerResult<Application> {
        let valid = input.validate(None)?;
        let changed = self.conn.execute(
            "UPDATE applications
             SET company = ?1, role = ?2, location = ?3, job_link = ?4, status = ?5, applied_date = ?6, notes = ?7
             WHERE id = ?8",
            params![
                valid.company,
                valid.role,
                valid.location,
                valid.job_link,
                valid.status,
                valid.applied_date,
                valid.notes,
                id
            ],
        )?;
        if changed == 0 {
            return Err(not_found(id));
        }
        self.get_application(id)
    }

    pub fn find_application(&self, id: i64) -> TrackerResult<Option<Application>> {
        let sql = format!("SELECT {} FROM applications a WHERE a.id = ?1", APPLICATION_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id], Self::row_to_application)
            .optional()?)
    }

    pub fn get_application(&self, id: i64) -> TrackerResult<Application> {
        self.find_application(id)?.ok_or_else(|| not_found(id))
    }

    pub fn list_applications(&self, filter: &ApplicationFilter, today: NaiveDate) -> TrackerResult<Vec<ApplicationSummary>> {
        let mut sql = format!(
            "SELECT {}, EXISTS (SELECT 1 FROM interviews i WHERE i.application_id = a.id)
             FROM applications a
             WHERE 1=1",
            APPLICATION_COLUMNS
        );

        let mut params: Vec<String> = vec![];

        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND a.status = ?{}", params.len() + 1));
            params.push(status.as_str().to_string());
        }

        if let Some(company) = optional(filter.company.as_deref()) {
            sql.push_str(&format!(" AND a.company LIKE ?{} ESCAPE '\\'", params.len() + 1));
            params.push(contains_pattern(&company));
        }

        sql.push_str(" ORDER BY a.applied_date DESC, a.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            let application = Self::row_to_application(row)?;
            let has_record: bool = row.get(14)?;
            Ok((application, has_record))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (application, has_record) = row?;
            summaries.push(ApplicationSummary {
                needs_follow_up: lifecycle::needs_follow_up(&application, today),
                awaiting_interview_details: application.status == Status::Interview
                    && !has_record
                    && application.legacy.is_empty(),
                application,
            });
        }
        Ok(summaries)
    }

    /// Applied applications past the follow-up window, oldest first, with
    /// the number of days since applying.
    pub fn follow_up_reminders(&self, today: NaiveDate) -> TrackerResult<Vec<(Application, i64)>> {
        let filter = ApplicationFilter {
            status: Some(Status::Applied),
            company: None,
        };
        let mut due: Vec<(Application, i64)> = self
            .list_applications(&filter, today)?
            .into_iter()
            .filter(|s| s.needs_follow_up)
            .map(|s| {
                let days = lifecycle::days_since_applied(&s.application, today);
                (s.application, days)
            })
            .collect();
        due.sort_by(|a, b| {
            a.0.applied_date
                .cmp(&b.0.applied_date)
                .then(a.0.id.cmp(&b.0.id))
        });
        Ok(due)
    }

    /// Deleting an application removes its interview record with it.
    pub fn delete_application(&mut self, id: i64) -> TrackerResult<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute("DELETE FROM applications WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(not_found(id));
        }
        tx.commit()?;
        debug!(id, "Deleted application");
        Ok(())
    }

    pub(crate) fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
        Ok(Application {
            id: row.get(0)?,
            company: row.get(1)?,
            role: row.get(2)?,
            location: row.get(3)?,
            job_link: row.get(4)?,
            status: row.get(5)?,
            applied_date: row.get(6)?,
            notes: row.get(7)?,
            legacy: LegacyInterview {
                date: lenient_text(row, 8)?,
                time: lenient_text(row, 9)?,
                venue: lenient_text(row, 10)?,
                completed: row.get::<_, Option<i64>>(11)?.unwrap_or(0) != 0,
                difficulty: lenient_text(row, 12)?,
                notes: lenient_text(row, 13)?,
            },
        })
    }

    // --- Account operations ---

    /// `credential` is stored as given; hashing happens before it gets here.
    pub fn create_account(&mut self, name: &str, email: &str, credential: &str) -> TrackerResult<Account> {
        let name = required("name", name)?;
        let email = required("email", email)?;
        let credential = required("credential", credential)?;
        if !email.contains('@') {
            return Err(TrackerError::Validation(format!("'{}' is not an email address", email)));
        }

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let taken: Option<i64> = tx
            .query_row(
                "SELECT id FROM accounts WHERE LOWER(email) = LOWER(?1)",
                [&email],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(TrackerError::Validation(format!("email '{}' is already registered", email)));
        }
        tx.execute(
            "INSERT INTO accounts (name, email, credential, created_at) VALUES (?1, ?2, ?3, datetime('now'))",
            params![name, email, credential],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        self.get_account(id)
    }

    pub fn get_account(&self, id: i64) -> TrackerResult<Account> {
        self.conn
            .query_row(
                "SELECT id, name, email, credential, COALESCE(created_at, '') FROM accounts WHERE id = ?1",
                [id],
                Self::row_to_account,
            )
            .optional()?
            .ok_or_else(|| TrackerError::NotFound(format!("account #{}", id)))
    }

    pub fn list_accounts(&self) -> TrackerResult<Vec<Account>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, email, credential, COALESCE(created_at, '') FROM accounts ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::row_to_account)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
        Ok(Account {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            credential: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    // --- Profile operations ---

    pub fn get_profile(&self, account_id: i64) -> TrackerResult<Option<Profile>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, account_id, name, age, bio, qualifications, experience, projects, skills,
                        achievements, portfolio_links, looking_for, updated_at
                 FROM profiles WHERE account_id = ?1",
                [account_id],
                |row| {
                    Ok(Profile {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        fields: ProfileFields {
                            name: row.get(2)?,
                            age: row.get(3)?,
                            bio: row.get(4)?,
                            qualifications: row.get(5)?,
                            experience: row.get(6)?,
                            projects: row.get(7)?,
                            skills: row.get(8)?,
                            achievements: row.get(9)?,
                            portfolio_links: row.get(10)?,
                            looking_for: row.get(11)?,
                        },
                        updated_at: row.get(12)?,
                    })
                },
            )
            .optional()?)
    }

    /// Insert or replace the single profile belonging to an account.
    pub fn save_profile(&mut self, account_id: i64, fields: &ProfileFields) -> TrackerResult<Profile> {
        self.get_account(account_id)?;
        if let Some(age) = fields.age {
            if !(0..=150).contains(&age) {
                return Err(TrackerError::Validation(format!("age {} is out of range", age)));
            }
        }

        self.conn.execute(
            "INSERT INTO profiles (account_id, name, age, bio, qualifications, experience, projects, skills,
                                   achievements, portfolio_links, looking_for, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'), datetime('now'))
             ON CONFLICT(account_id) DO UPDATE SET
                name = excluded.name,
                age = excluded.age,
                bio = excluded.bio,
                qualifications = excluded.qualifications,
                experience = excluded.experience,
                projects = excluded.projects,
                skills = excluded.skills,
                achievements = excluded.achievements,
                portfolio_links = excluded.portfolio_links,
                looking_for = excluded.looking_for,
                updated_at = datetime('now')",
            params![
                account_id,
                optional(fields.name.as_deref()),
                fields.age,
                optional(fields.bio.as_deref()),
                optional(fields.qualifications.as_deref()),
                optional(fields.experience.as_deref()),
                optional(fields.projects.as_deref()),
                optional(fields.skills.as_deref()),
                optional(fields.achievements.as_deref()),
                optional(fields.portfolio_links.as_deref()),
                optional(fields.looking_for.as_deref()),
            ],
        )?;

        self.get_profile(account_id)?
            .ok_or_else(|| TrackerError::NotFound(format!("profile for account #{}", account_id)))
    }
}

/// LIKE pattern matching `text` literally anywhere in the value.
fn contains_pattern(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

pub(crate) fn not_found(id: i64) -> TrackerError {
    TrackerError::NotFound(format!("application #{}", id))
}

/// Read a column as text whatever its storage class; legacy layouts kept
/// dates and times in loosely typed columns.
pub(crate) fn lenient_text(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    })
}
