//! Interview records: confirmation, completion, and promotion of the interview
//! columns older versions kept inline on each application.

use chrono::{NaiveDate, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::db::{lenient_text, not_found, Database, APPLICATION_COLUMNS};
use crate::error::{TrackerError, TrackerResult};
use crate::models::{
    optional, parse_date, parse_time, required, Application, Difficulty, InterviewRecord, InterviewSource,
    InterviewView, Status,
};
use crate::schema;

/// Venue recorded when older data left it blank.
pub const DEFAULT_VENUE: &str = "Online";

/// Validated date, time and venue for confirming an interview.
#[derive(Debug, Clone, PartialEq)]
pub struct InterviewSlot {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub venue: String,
}

impl InterviewSlot {
    pub fn parse(date: &str, time: &str, venue: &str) -> TrackerResult<Self> {
        Ok(Self {
            date: parse_date("interview date", date)?,
            time: parse_time("interview time", time)?,
            venue: required("venue", venue)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub promoted: usize,
    pub backfilled: usize,
    pub skipped: usize,
}

/// An interview row as stored, before its date and time are trusted.
struct StoredInterview {
    id: i64,
    application_id: i64,
    company_tag: Option<String>,
    role_tag: Option<String>,
    date: Option<String>,
    time: Option<String>,
    venue: Option<String>,
    completed: bool,
    difficulty: Option<String>,
    notes: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl StoredInterview {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            company_tag: lenient_text(row, 2)?,
            role_tag: lenient_text(row, 3)?,
            date: lenient_text(row, 4)?,
            time: lenient_text(row, 5)?,
            venue: lenient_text(row, 6)?,
            completed: row.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
            difficulty: lenient_text(row, 8)?,
            notes: lenient_text(row, 9)?,
            created_at: lenient_text(row, 10)?,
            updated_at: lenient_text(row, 11)?,
        })
    }

    fn into_record(self) -> Option<InterviewRecord> {
        let date = parse_date("interview date", self.date.as_deref().unwrap_or_default()).ok();
        let time = parse_time("interview time", self.time.as_deref().unwrap_or_default()).ok();
        let (Some(interview_date), Some(interview_time)) = (date, time) else {
            warn!(
                id = self.id,
                application_id = self.application_id,
                "Skipping interview row with unreadable date or time"
            );
            return None;
        };
        Some(InterviewRecord {
            id: self.id,
            application_id: self.application_id,
            company_tag: self.company_tag.unwrap_or_default(),
            role_tag: self.role_tag.unwrap_or_default(),
            interview_date,
            interview_time,
            venue: optional(self.venue.as_deref()).unwrap_or_else(|| DEFAULT_VENUE.to_string()),
            completed: self.completed,
            difficulty: Difficulty::from_legacy(self.difficulty.as_deref()),
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Older interview tables kept the venue in a `venue` column.
fn record_select(conn: &Connection) -> TrackerResult<String> {
    let venue = if schema::has_column(conn, "interviews", "venue")? {
        "COALESCE(i.interview_venue, i.venue)"
    } else {
        "i.interview_venue"
    };
    Ok(format!(
        "SELECT i.id, i.application_id, i.company_tag, i.role_tag, i.interview_date, i.interview_time,
                {venue}, i.interview_completed, i.interview_difficulty, i.interview_experience_notes,
                i.created_at, i.updated_at
         FROM interviews i"
    ))
}

fn find_record(conn: &Connection, application_id: i64) -> TrackerResult<Option<InterviewRecord>> {
    let sql = format!("{} WHERE i.application_id = ?1", record_select(conn)?);
    let stored = conn
        .query_row(&sql, [application_id], StoredInterview::from_row)
        .optional()?;
    Ok(stored.and_then(StoredInterview::into_record))
}

/// Build a view from an application's inline interview columns, if usable.
fn legacy_view(application: &Application) -> Option<InterviewView> {
    let legacy = &application.legacy;
    let date = parse_date("interview date", legacy.date.as_deref()?).ok()?;
    Some(InterviewView {
        application_id: application.id,
        company: application.company.clone(),
        role: application.role.clone(),
        date,
        time: legacy
            .time
            .as_deref()
            .and_then(|t| parse_time("interview time", t).ok()),
        venue: optional(legacy.venue.as_deref()).unwrap_or_else(|| DEFAULT_VENUE.to_string()),
        completed: legacy.completed,
        difficulty: Difficulty::from_legacy(legacy.difficulty.as_deref()),
        notes: optional(legacy.notes.as_deref()),
        source: InterviewSource::Legacy,
    })
}

fn confirm_in(conn: &Connection, application_id: i64, slot: &InterviewSlot) -> TrackerResult<InterviewRecord> {
    let owner: Option<(Status, String, String)> = conn
        .query_row(
            "SELECT status, company, role FROM applications WHERE id = ?1",
            [application_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((status, company, role)) = owner else {
        return Err(not_found(application_id));
    };
    if status != Status::Interview {
        return Err(TrackerError::InvalidState(format!(
            "application #{} is {}, set it to Interview before confirming",
            application_id, status
        )));
    }

    // The unique index on application_id turns a second confirmation into an
    // update. Tags are only written on insert.
    conn.execute(
        "INSERT INTO interviews (application_id, company_tag, role_tag, interview_date, interview_time,
                                 interview_venue, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'), datetime('now'))
         ON CONFLICT(application_id) DO UPDATE SET
            interview_date = excluded.interview_date,
            interview_time = excluded.interview_time,
            interview_venue = excluded.interview_venue,
            updated_at = datetime('now')",
        params![application_id, company, role, slot.date, slot.time, slot.venue],
    )?;

    find_record(conn, application_id)?.ok_or_else(|| {
        TrackerError::NotFound(format!("interview for application #{}", application_id))
    })
}

impl Database {
    pub(crate) fn interview_records(&self) -> TrackerResult<Vec<InterviewRecord>> {
        let sql = record_select(&self.conn)?;
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], StoredInterview::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            if let Some(record) = row?.into_record() {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Inline interviews of applications that have no record yet.
    pub(crate) fn legacy_interviews(&self) -> TrackerResult<Vec<InterviewView>> {
        let sql = format!(
            "SELECT {} FROM applications a
             WHERE a.interview_date IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM interviews i WHERE i.application_id = a.id)",
            APPLICATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Database::row_to_application)?;
        let mut views = Vec::new();
        for row in rows {
            if let Some(view) = legacy_view(&row?) {
                views.push(view);
            }
        }
        Ok(views)
    }

    pub fn find_interview_record(&self, application_id: i64) -> TrackerResult<Option<InterviewRecord>> {
        find_record(&self.conn, application_id)
    }

    /// Prefers the interview record and falls back to inline legacy columns.
    pub fn get_interview(&self, application_id: i64) -> TrackerResult<Option<InterviewView>> {
        let application = self.get_application(application_id)?;
        if let Some(record) = self.find_interview_record(application_id)? {
            return Ok(Some(record.into()));
        }
        Ok(legacy_view(&application))
    }

    /// First confirmation snapshots company and role; later ones only move
    /// the date, time and venue.
    pub fn confirm_interview(&mut self, application_id: i64, slot: &InterviewSlot) -> TrackerResult<InterviewRecord> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = confirm_in(&tx, application_id, slot)?;
        tx.commit()?;
        debug!(application_id, date = %record.interview_date, "Interview confirmed");
        Ok(record)
    }

    /// Move the application to Interview and confirm, all or nothing.
    pub fn schedule_interview(&mut self, application_id: i64, slot: &InterviewSlot) -> TrackerResult<InterviewRecord> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE applications SET status = ?1 WHERE id = ?2",
            params![Status::Interview, application_id],
        )?;
        if changed == 0 {
            return Err(not_found(application_id));
        }
        let record = confirm_in(&tx, application_id, slot)?;
        tx.commit()?;
        Ok(record)
    }

    /// Repeatable; a second call overwrites difficulty and notes.
    pub fn complete_interview(
        &mut self,
        application_id: i64,
        difficulty: Option<Difficulty>,
        notes: Option<&str>,
    ) -> TrackerResult<InterviewRecord> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE interviews
             SET interview_completed = 1,
                 interview_difficulty = ?1,
                 interview_experience_notes = ?2,
                 updated_at = datetime('now')
             WHERE application_id = ?3",
            params![difficulty, optional(notes), application_id],
        )?;
        if changed == 0 {
            return Err(TrackerError::NotFound(format!(
                "no confirmed interview for application #{}",
                application_id
            )));
        }
        let record = find_record(&tx, application_id)?.ok_or_else(|| {
            TrackerError::NotFound(format!("interview for application #{}", application_id))
        })?;
        tx.commit()?;
        Ok(record)
    }

    /// Copy inline legacy interview data into interview records and fill in
    /// missing company/role tags. Idempotent.
    pub fn promote_legacy_interviews(&mut self) -> TrackerResult<PromotionReport> {
        let mut report = PromotionReport::default();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for (tag, source) in [("company_tag", "company"), ("role_tag", "role")] {
            report.backfilled += tx.execute(
                &format!(
                    "UPDATE interviews
                     SET {tag} = (SELECT a.{source} FROM applications a WHERE a.id = interviews.application_id)
                     WHERE ({tag} IS NULL OR {tag} = '')
                       AND EXISTS (SELECT 1 FROM applications a WHERE a.id = interviews.application_id)"
                ),
                [],
            )?;
        }

        let pending: Vec<Application> = {
            let sql = format!(
                "SELECT {} FROM applications a
                 WHERE a.interview_date IS NOT NULL AND TRIM(a.interview_date) != ''
                   AND NOT EXISTS (SELECT 1 FROM interviews i WHERE i.application_id = a.id)",
                APPLICATION_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([], Database::row_to_application)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for application in pending {
            let Some(view) = legacy_view(&application) else {
                warn!(id = application.id, "Legacy interview date is unreadable; leaving it inline");
                report.skipped += 1;
                continue;
            };
            let Some(time) = view.time else {
                warn!(id = application.id, "Legacy interview has no usable time; leaving it inline");
                report.skipped += 1;
                continue;
            };
            tx.execute(
                "INSERT INTO interviews (application_id, company_tag, role_tag, interview_date, interview_time,
                                         interview_venue, interview_completed, interview_difficulty,
                                         interview_experience_notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'), datetime('now'))",
                params![
                    application.id,
                    application.company,
                    application.role,
                    view.date,
                    time,
                    view.venue,
                    view.completed,
                    view.difficulty,
                    view.notes
                ],
            )?;
            report.promoted += 1;
        }

        tx.commit()?;
        if report.promoted > 0 || report.backfilled > 0 {
            info!(
                promoted = report.promoted,
                backfilled = report.backfilled,
                skipped = report.skipped,
                "Promoted legacy interview data"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{day, fresh_db, input};
    use crate::lifecycle::InterviewTiming;
    use crate::models::ApplicationInput;

    fn slot(date: &str, time: &str, venue: &str) -> InterviewSlot {
        InterviewSlot::parse(date, time, venue).unwrap()
    }

    fn interview_count(db: &Database) -> i64 {
        db.conn
            .query_row("SELECT COUNT(*) FROM interviews", [], |r| r.get(0))
            .unwrap()
    }

    fn interviewing(db: &mut Database, company: &str) -> Application {
        let app = db
            .create_application(&input(company, "Applied", "2024-01-01"), day("2024-01-02"))
            .unwrap();
        db.set_status(app.id, "Interview").unwrap()
    }

    #[test]
    fn test_slot_validation() {
        assert!(matches!(
            InterviewSlot::parse("", "14:00", "Zoom").unwrap_err(),
            TrackerError::Validation(_)
        ));
        assert!(InterviewSlot::parse("2024-02-30", "14:00", "Zoom").is_err());
        assert!(InterviewSlot::parse("2024-01-10", "25:00", "Zoom").is_err());
        assert!(InterviewSlot::parse("2024-01-10", "14:00", "   ").is_err());
    }

    #[test]
    fn test_acme_reconfirmation_keeps_snapshot() {
        let mut db = fresh_db();
        let app = interviewing(&mut db, "Acme");

        let first = db.confirm_interview(app.id, &slot("2024-01-10", "14:00", "Zoom")).unwrap();
        assert_eq!(first.company_tag, "Acme");
        assert_eq!(first.role_tag, "Engineer");

        let mut edit = ApplicationInput {
            company: "Acme Corp".to_string(),
            ..input("Acme", "Interview", "2024-01-01")
        };
        edit.role = "Staff Engineer".to_string();
        db.update_application(app.id, &edit).unwrap();

        let second = db.confirm_interview(app.id, &slot("2024-01-11", "15:30", "Office")).unwrap();
        assert_eq!(interview_count(&db), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.interview_date, day("2024-01-11"));
        assert_eq!(second.venue, "Office");
        assert_eq!(second.company_tag, "Acme");
        assert_eq!(second.role_tag, "Engineer");
    }

    #[test]
    fn test_confirm_requires_interview_status() {
        let mut db = fresh_db();
        let app = db
            .create_application(&input("Acme", "Applied", "2024-01-01"), day("2024-01-02"))
            .unwrap();
        let err = db.confirm_interview(app.id, &slot("2024-01-10", "14:00", "Zoom")).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));
        assert_eq!(interview_count(&db), 0);

        let err = db.confirm_interview(404, &slot("2024-01-10", "14:00", "Zoom")).unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[test]
    fn test_leaving_interview_keeps_record() {
        let mut db = fresh_db();
        let app = interviewing(&mut db, "Acme");
        db.confirm_interview(app.id, &slot("2024-01-10", "14:00", "Zoom")).unwrap();

        db.set_status(app.id, "Offer").unwrap();
        assert!(db.find_interview_record(app.id).unwrap().is_some());

        // confirming again needs the status back on Interview
        let err = db.confirm_interview(app.id, &slot("2024-01-12", "14:00", "Zoom")).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));
    }

    #[test]
    fn test_schedule_sets_status_and_confirms() {
        let mut db = fresh_db();
        let app = db
            .create_application(&input("Acme", "Applied", "2024-01-01"), day("2024-01-02"))
            .unwrap();
        let record = db.schedule_interview(app.id, &slot("2024-01-10", "09:00", "HQ")).unwrap();
        assert_eq!(record.company_tag, "Acme");
        assert_eq!(db.get_application(app.id).unwrap().status, Status::Interview);

        assert!(matches!(
            db.schedule_interview(77, &slot("2024-01-10", "09:00", "HQ")).unwrap_err(),
            TrackerError::NotFound(_)
        ));
    }

    #[test]
    fn test_complete_interview() {
        let mut db = fresh_db();
        let app = interviewing(&mut db, "Acme");

        let err = db.complete_interview(app.id, Some(Difficulty::Hard), None).unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));

        db.confirm_interview(app.id, &slot("2024-01-10", "14:00", "Zoom")).unwrap();
        let done = db.complete_interview(app.id, Some(Difficulty::Hard), Some("system design")).unwrap();
        assert!(done.completed);
        assert_eq!(done.difficulty, Some(Difficulty::Hard));

        let again = db.complete_interview(app.id, None, Some("  ")).unwrap();
        assert!(again.completed);
        assert_eq!(again.difficulty, None);
        assert_eq!(again.notes, None);

        // re-confirming does not reopen it
        let moved = db.confirm_interview(app.id, &slot("2024-01-12", "14:00", "Zoom")).unwrap();
        assert!(moved.completed);
    }

    #[test]
    fn test_delete_cascades_to_interview() {
        let mut db = fresh_db();
        let app = interviewing(&mut db, "Acme");
        db.confirm_interview(app.id, &slot("2024-01-10", "14:00", "Zoom")).unwrap();

        db.delete_application(app.id).unwrap();
        assert_eq!(interview_count(&db), 0);
    }

    #[test]
    fn test_list_interviews_classifies_around_the_date() {
        let mut db = fresh_db();
        let app = interviewing(&mut db, "Acme");
        db.confirm_interview(app.id, &slot("2024-01-10", "14:00", "Zoom")).unwrap();

        let on_day = db.list_interviews(day("2024-01-10"), 2).unwrap();
        assert_eq!(on_day.upcoming[0].timing, InterviewTiming::Today);

        let before = db.list_interviews(day("2024-01-09"), 0).unwrap();
        assert_eq!(before.upcoming[0].timing, InterviewTiming::Upcoming);

        let after = db.list_interviews(day("2024-01-11"), 2).unwrap();
        assert!(after.upcoming.is_empty());
        assert_eq!(after.past[0].timing, InterviewTiming::Past);
        assert!(after.past[0].missed);
    }

    #[test]
    fn test_concurrent_confirmations_leave_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");

        let mut db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        let app = interviewing(&mut db, "Acme");

        let handles: Vec<_> = ["Zoom", "Office"]
            .into_iter()
            .map(|venue| {
                let path = path.clone();
                let app_id = app.id;
                std::thread::spawn(move || {
                    let mut conn = Database::open(&path).unwrap();
                    conn.confirm_interview(app_id, &slot("2024-01-10", "14:00", venue))
                        .unwrap()
                })
            })
            .collect();
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap().id).collect();

        assert_eq!(ids[0], ids[1]);
        assert_eq!(interview_count(&db), 1);
    }

    fn inline_legacy_db() -> Database {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company TEXT NOT NULL,
                role TEXT NOT NULL,
                location TEXT NOT NULL,
                job_link TEXT NOT NULL,
                status TEXT NOT NULL,
                applied_date DATE NOT NULL,
                notes TEXT,
                interview_date DATE,
                interview_time TIME,
                interview_venue VARCHAR(255),
                interview_completed TINYINT(1) NOT NULL DEFAULT 0,
                interview_difficulty VARCHAR(50),
                interview_experience_notes TEXT
            );
            INSERT INTO applications (company, role, location, job_link, status, applied_date,
                                      interview_date, interview_time, interview_venue, interview_completed,
                                      interview_difficulty)
            VALUES
                ('Acme', 'Engineer', 'Remote', 'https://acme.example', 'Interview', '2024-01-01',
                 '2024-01-10', '14:00:00', NULL, 1, 'Medium'),
                ('Globex', 'SRE', 'Berlin', 'https://globex.example', 'Interview', '2024-01-02',
                 '2024-01-15', NULL, 'HQ', 0, NULL),
                ('Initech', 'Dev', 'Austin', 'https://initech.example', 'Applied', '2024-01-03',
                 NULL, NULL, NULL, 0, NULL);
            "#,
        )
        .unwrap();
        Database::from_connection(conn).unwrap()
    }

    #[test]
    fn test_promotes_inline_interviews_once() {
        let mut db = inline_legacy_db();
        let summary = db.migrate().unwrap();
        assert_eq!(summary.promotion.promoted, 1);
        assert_eq!(summary.promotion.skipped, 1);

        let record = db.find_interview_record(1).unwrap().unwrap();
        assert_eq!(record.company_tag, "Acme");
        assert_eq!(record.venue, DEFAULT_VENUE);
        assert!(record.completed);
        assert_eq!(record.difficulty, Some(Difficulty::Medium));

        // legacy columns are left as they were
        let app = db.get_application(1).unwrap();
        assert_eq!(app.legacy.date.as_deref(), Some("2024-01-10"));

        let again = db.migrate().unwrap();
        assert_eq!(again.promotion.promoted, 0);
        assert_eq!(interview_count(&db), 1);
    }

    #[test]
    fn test_read_path_falls_back_to_inline_columns() {
        let mut db = inline_legacy_db();
        db.migrate().unwrap();

        let promoted = db.get_interview(1).unwrap().unwrap();
        assert_eq!(promoted.source, InterviewSource::Record);

        let fallback = db.get_interview(2).unwrap().unwrap();
        assert_eq!(fallback.source, InterviewSource::Legacy);
        assert_eq!(fallback.venue, "HQ");
        assert_eq!(fallback.time, None);

        assert!(db.get_interview(3).unwrap().is_none());
        assert!(matches!(db.get_interview(9).unwrap_err(), TrackerError::NotFound(_)));

        let board = db.list_interviews(day("2024-01-12"), 2).unwrap();
        assert_eq!(board.upcoming.len(), 1);
        assert_eq!(board.upcoming[0].interview.source, InterviewSource::Legacy);
        assert_eq!(board.past.len(), 1);
    }

    #[test]
    fn test_backfills_tags_and_reads_legacy_venue() {
        let mut db = Database::from_connection(crate::schema::tests::legacy_store()).unwrap();
        let summary = db.migrate().unwrap();
        assert_eq!(summary.promotion.backfilled, 2);

        let record = db.find_interview_record(1).unwrap().unwrap();
        assert_eq!(record.company_tag, "Acme");
        assert_eq!(record.role_tag, "Engineer");
        assert_eq!(record.venue, "Zoom");
        assert_eq!(record.interview_time, NaiveTime::from_hms_opt(14, 0, 0).unwrap());

        // confirming on the upgraded layout updates the same row
        db.confirm_interview(1, &slot("2024-01-12", "10:00", "Office")).unwrap();
        let moved = db.find_interview_record(1).unwrap().unwrap();
        assert_eq!(moved.venue, "Office");
        assert_eq!(interview_count(&db), 1);
    }
}
