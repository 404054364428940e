//! Status transitions and the time-derived flags computed on read.

use chrono::{Duration, NaiveDate};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{not_found, Database};
use crate::error::TrackerResult;
use crate::models::{Application, InterviewView, Status};

/// An Applied application this many days old (or older) wants a follow-up.
pub const FOLLOW_UP_AFTER_DAYS: i64 = 3;

/// Default lookahead for highlighting an upcoming interview as "soon".
pub const DEFAULT_SOON_DAYS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterviewTiming {
    Past,
    Today,
    Soon,
    Upcoming,
}

impl InterviewTiming {
    pub fn label(&self) -> &'static str {
        match self {
            InterviewTiming::Past => "past",
            InterviewTiming::Today => "today",
            InterviewTiming::Soon => "soon",
            InterviewTiming::Upcoming => "upcoming",
        }
    }
}

pub fn days_since_applied(application: &Application, as_of: NaiveDate) -> i64 {
    (as_of - application.applied_date).num_days()
}

pub fn needs_follow_up(application: &Application, as_of: NaiveDate) -> bool {
    application.status == Status::Applied && days_since_applied(application, as_of) >= FOLLOW_UP_AFTER_DAYS
}

/// Soon means strictly after today and at most `soon_days` ahead.
pub fn classify_interview(date: NaiveDate, as_of: NaiveDate, soon_days: i64) -> InterviewTiming {
    if date == as_of {
        InterviewTiming::Today
    } else if date > as_of {
        if date <= as_of + Duration::days(soon_days.max(0)) {
            InterviewTiming::Soon
        } else {
            InterviewTiming::Upcoming
        }
    } else {
        InterviewTiming::Past
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterviewEntry {
    pub interview: InterviewView,
    pub timing: InterviewTiming,
    /// Past and never marked completed.
    pub missed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InterviewBoard {
    pub upcoming: Vec<InterviewEntry>,
    pub past: Vec<InterviewEntry>,
}

/// Split interviews into upcoming (soonest first) and past (newest first).
/// Completed interviews are always past.
pub fn build_board(interviews: Vec<InterviewView>, as_of: NaiveDate, soon_days: i64) -> InterviewBoard {
    let mut board = InterviewBoard::default();
    for interview in interviews {
        let timing = classify_interview(interview.date, as_of, soon_days);
        let missed = timing == InterviewTiming::Past && !interview.completed;
        let entry = InterviewEntry {
            interview,
            timing,
            missed,
        };
        if entry.interview.completed || timing == InterviewTiming::Past {
            board.past.push(entry);
        } else {
            board.upcoming.push(entry);
        }
    }
    board
        .upcoming
        .sort_by_key(|e| (e.interview.date, e.interview.time, e.interview.application_id));
    board.past.sort_by_key(|e| {
        (
            std::cmp::Reverse(e.interview.date),
            std::cmp::Reverse(e.interview.time),
            e.interview.application_id,
        )
    });
    board
}

impl Database {
    /// Any recognized status may follow any other. Leaving Interview keeps
    /// the interview record.
    pub fn set_status(&mut self, id: i64, new_status: &str) -> TrackerResult<Application> {
        let status: Status = new_status.parse()?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE applications SET status = ?1 WHERE id = ?2",
            rusqlite::params![status, id],
        )?;
        if changed == 0 {
            return Err(not_found(id));
        }
        tx.commit()?;

        debug!(id, %status, "Status changed");
        self.get_application(id)
    }

    pub fn list_interviews(&self, as_of: NaiveDate, soon_days: i64) -> TrackerResult<InterviewBoard> {
        let mut views: Vec<InterviewView> = self.interview_records()?.into_iter().map(InterviewView::from).collect();
        let legacy = self.legacy_interviews()?;
        if !legacy.is_empty() {
            warn!(count = legacy.len(), "Listing interviews still stored inline on applications");
        }
        views.extend(legacy);
        Ok(build_board(views, as_of, soon_days))
    }
}
