//! Startup schema reconciliation.
//!
//! Brings whatever tables exist up to the shape the rest of the crate reads
//! and writes. Columns are only ever added or relaxed, never dropped, and row
//! contents are never rewritten. The whole pass runs in one transaction so a
//! failure leaves the store exactly as it was.

use regex::{Captures, Regex};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{TrackerError, TrackerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// SQLite's column affinity rules (section 3.1 of the datatype docs).
    fn of(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }

    /// NUMERIC and BLOB columns keep text values as text, so legacy DATE,
    /// TIME and TIMESTAMP columns can back our TEXT columns.
    fn can_hold(self, found: Affinity) -> bool {
        self == found || matches!(found, Affinity::Blob | Affinity::Numeric)
    }
}

struct ColumnSpec {
    name: &'static str,
    /// Declaration used by ALTER TABLE ADD COLUMN on an older table.
    add: &'static str,
}

struct ForeignKeySpec {
    column: &'static str,
    parent: &'static str,
}

struct TableSpec {
    name: &'static str,
    create: &'static str,
    columns: &'static [ColumnSpec],
    /// Columns that cannot be added after the fact.
    key_columns: &'static [&'static str],
    parent: Option<ForeignKeySpec>,
    unique_indexes: &'static [(&'static str, &'static str)],
}

const fn col(name: &'static str, add: &'static str) -> ColumnSpec {
    ColumnSpec { name, add }
}

const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "applications",
        create: r#"
            CREATE TABLE applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company TEXT NOT NULL,
                role TEXT NOT NULL,
                location TEXT NOT NULL,
                job_link TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Applied',
                applied_date TEXT NOT NULL,
                notes TEXT,
                interview_date TEXT,
                interview_time TEXT,
                interview_venue TEXT,
                interview_completed INTEGER NOT NULL DEFAULT 0,
                interview_difficulty TEXT,
                interview_experience_notes TEXT
            )"#,
        columns: &[
            col("company", "TEXT NOT NULL DEFAULT ''"),
            col("role", "TEXT NOT NULL DEFAULT ''"),
            col("location", "TEXT NOT NULL DEFAULT ''"),
            col("job_link", "TEXT NOT NULL DEFAULT ''"),
            col("status", "TEXT NOT NULL DEFAULT 'Applied'"),
            col("applied_date", "TEXT NOT NULL DEFAULT '1970-01-01'"),
            col("notes", "TEXT"),
            col("interview_date", "TEXT"),
            col("interview_time", "TEXT"),
            col("interview_venue", "TEXT"),
            col("interview_completed", "INTEGER NOT NULL DEFAULT 0"),
            col("interview_difficulty", "TEXT"),
            col("interview_experience_notes", "TEXT"),
        ],
        key_columns: &["id"],
        parent: None,
        unique_indexes: &[],
    },
    TableSpec {
        name: "interviews",
        create: r#"
            CREATE TABLE interviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                company_tag TEXT NOT NULL DEFAULT '',
                role_tag TEXT NOT NULL DEFAULT '',
                interview_date TEXT NOT NULL,
                interview_time TEXT NOT NULL,
                interview_venue TEXT NOT NULL,
                interview_completed INTEGER NOT NULL DEFAULT 0,
                interview_difficulty TEXT,
                interview_experience_notes TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            )"#,
        columns: &[
            col("company_tag", "TEXT NOT NULL DEFAULT ''"),
            col("role_tag", "TEXT NOT NULL DEFAULT ''"),
            col("interview_date", "TEXT"),
            col("interview_time", "TEXT"),
            col("interview_venue", "TEXT"),
            col("interview_completed", "INTEGER NOT NULL DEFAULT 0"),
            col("interview_difficulty", "TEXT"),
            col("interview_experience_notes", "TEXT"),
            // ADD COLUMN only accepts constant defaults.
            col("created_at", "TEXT"),
            col("updated_at", "TEXT"),
        ],
        key_columns: &["id", "application_id"],
        parent: Some(ForeignKeySpec {
            column: "application_id",
            parent: "applications",
        }),
        unique_indexes: &[("uq_interviews_application", "interviews(application_id)")],
    },
    TableSpec {
        name: "accounts",
        create: r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                credential TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )"#,
        columns: &[
            col("name", "TEXT NOT NULL DEFAULT ''"),
            col("email", "TEXT NOT NULL DEFAULT ''"),
            col("credential", "TEXT NOT NULL DEFAULT ''"),
            col("created_at", "TEXT"),
        ],
        key_columns: &["id"],
        parent: None,
        unique_indexes: &[("uq_accounts_email", "accounts(email COLLATE NOCASE)")],
    },
    TableSpec {
        name: "profiles",
        create: r#"
            CREATE TABLE profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT,
                age INTEGER,
                bio TEXT,
                qualifications TEXT,
                experience TEXT,
                projects TEXT,
                skills TEXT,
                achievements TEXT,
                portfolio_links TEXT,
                looking_for TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            )"#,
        columns: &[
            col("name", "TEXT"),
            col("age", "INTEGER"),
            col("bio", "TEXT"),
            col("qualifications", "TEXT"),
            col("experience", "TEXT"),
            col("projects", "TEXT"),
            col("skills", "TEXT"),
            col("achievements", "TEXT"),
            col("portfolio_links", "TEXT"),
            col("looking_for", "TEXT"),
            col("created_at", "TEXT"),
            col("updated_at", "TEXT"),
        ],
        key_columns: &["id", "account_id"],
        parent: Some(ForeignKeySpec {
            column: "account_id",
            parent: "accounts",
        }),
        unique_indexes: &[("uq_profiles_account", "profiles(account_id)")],
    },
];

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created_tables: Vec<String>,
    pub added_columns: Vec<String>,
    pub rebuilt_tables: Vec<String>,
    pub created_indexes: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created_tables.is_empty()
            && self.added_columns.is_empty()
            && self.rebuilt_tables.is_empty()
            && self.created_indexes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ExistingColumn {
    name: String,
    declared: String,
    not_null: bool,
    default: Option<String>,
    pk: bool,
}

/// Bring every table to its target shape. Safe to run any number of times.
pub fn reconcile(conn: &mut Connection) -> TrackerResult<ReconcileReport> {
    conn.pragma_update(None, "foreign_keys", false)?;
    let outcome = reconcile_in_transaction(conn);
    conn.pragma_update(None, "foreign_keys", true)?;

    match outcome {
        Ok(report) => {
            if report.is_noop() {
                debug!("Schema already up to date");
            } else {
                info!(
                    created = ?report.created_tables,
                    added = ?report.added_columns,
                    rebuilt = ?report.rebuilt_tables,
                    indexes = ?report.created_indexes,
                    "Schema reconciled"
                );
            }
            Ok(report)
        }
        Err(TrackerError::Store(inner)) if is_contention(&inner) => {
            warn!("Schema reconciliation could not lock the store: {}", inner);
            Err(TrackerError::Store(inner))
        }
        Err(e) => {
            error!("Schema reconciliation aborted, store left unchanged: {}", e);
            Err(match e {
                TrackerError::Store(inner) => TrackerError::StructuralMigration(inner.to_string()),
                other => other,
            })
        }
    }
}

/// Another connection holds the store; retrying later can succeed.
fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn reconcile_in_transaction(conn: &mut Connection) -> TrackerResult<ReconcileReport> {
    // Take the write lock up front: a deferred read-then-write upgrade
    // deadlocks against a second process starting on the same file.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut report = ReconcileReport::default();

    for table in TABLES {
        reconcile_table(&tx, table, &mut report)?;
    }

    tx.commit()?;
    Ok(report)
}

fn reconcile_table(tx: &Transaction, spec: &TableSpec, report: &mut ReconcileReport) -> TrackerResult<()> {
    if !table_exists(tx, spec.name)? {
        tx.execute_batch(spec.create)?;
        report.created_tables.push(spec.name.to_string());
    } else {
        let existing = table_columns(tx, spec.name)?;

        for key in spec.key_columns {
            if !existing.iter().any(|c| c.name == *key) {
                return Err(TrackerError::StructuralMigration(format!(
                    "{} has no '{}' column and it cannot be added safely",
                    spec.name, key
                )));
            }
        }

        check_types(spec, &existing)?;

        for column in spec.columns {
            if !existing.iter().any(|c| c.name == column.name) {
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    spec.name, column.name, column.add
                ))?;
                report.added_columns.push(format!("{}.{}", spec.name, column.name));
            }
        }

        let existing = table_columns(tx, spec.name)?;
        let strict_legacy: Vec<&ExistingColumn> = existing
            .iter()
            .filter(|c| is_strict_legacy(spec, c))
            .collect();
        let missing_parent = match &spec.parent {
            Some(fk) => !has_cascading_fk(tx, spec.name, fk)?,
            None => false,
        };

        if !strict_legacy.is_empty() || missing_parent {
            debug!(
                table = spec.name,
                strict = ?strict_legacy.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                missing_parent,
                "Rebuilding table"
            );
            rebuild_table(tx, spec, &existing)?;
            report.rebuilt_tables.push(spec.name.to_string());
        }
    }

    for (index, target) in spec.unique_indexes {
        if !index_exists(tx, index)? {
            tx.execute_batch(&format!("CREATE UNIQUE INDEX {} ON {}", index, target))
                .map_err(|e| {
                    TrackerError::StructuralMigration(format!(
                        "cannot enforce uniqueness {} on {}: {}",
                        index, target, e
                    ))
                })?;
            report.created_indexes.push(index.to_string());
        }
    }

    Ok(())
}

fn check_types(spec: &TableSpec, existing: &[ExistingColumn]) -> TrackerResult<()> {
    let expected = table_shape(spec)?;
    for column in existing {
        let Some(target) = expected.iter().find(|(name, _)| *name == column.name) else {
            continue;
        };
        let found = Affinity::of(&column.declared);
        if !target.1.can_hold(found) {
            return Err(TrackerError::StructuralMigration(format!(
                "{}.{} is declared '{}' but {:?} is required",
                spec.name, column.name, column.declared, target.1
            )));
        }
    }
    Ok(())
}

/// Target column affinities, read from an in-memory copy of the CREATE statement.
fn table_shape(spec: &TableSpec) -> TrackerResult<Vec<(String, Affinity)>> {
    let scratch = Connection::open_in_memory()?;
    scratch.execute_batch(spec.create)?;
    Ok(table_columns(&scratch, spec.name)?
        .into_iter()
        .map(|c| {
            let affinity = Affinity::of(&c.declared);
            (c.name, affinity)
        })
        .collect())
}

/// A NOT NULL column without a default that we never write blocks every insert.
fn is_strict_legacy(spec: &TableSpec, column: &ExistingColumn) -> bool {
    column.not_null
        && column.default.is_none()
        && !column.pk
        && !spec.key_columns.contains(&column.name.as_str())
        && !spec.columns.iter().any(|c| c.name == column.name)
}

/// Recreate a table with relaxed legacy constraints and the parent foreign
/// key, copying every column and row verbatim. The staging table is the
/// stored CREATE statement with only those edits applied, so defaults and
/// CHECK or UNIQUE constraints carry over as written.
fn rebuild_table(tx: &Transaction, spec: &TableSpec, existing: &[ExistingColumn]) -> TrackerResult<()> {
    let create: String = tx.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [spec.name],
        |row| row.get(0),
    )?;
    let dependents: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT sql FROM sqlite_master
             WHERE type IN ('index', 'trigger') AND tbl_name = ?1 AND sql IS NOT NULL
             ORDER BY type, name",
        )?;
        let rows = stmt.query_map([spec.name], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let staging = format!("{}_reconcile", spec.name);
    let columns = existing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ");

    tx.execute_batch(&staging_definition(&create, &staging, spec, existing)?)?;
    tx.execute_batch(&format!(
        "INSERT INTO {staging} ({columns}) SELECT {columns} FROM {table}",
        table = spec.name
    ))?;
    tx.execute_batch(&format!("DROP TABLE {}", spec.name))?;
    tx.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", staging, spec.name))?;
    for sql in dependents {
        tx.execute_batch(&sql)?;
    }

    let orphans = {
        let mut stmt = tx.prepare(&format!("PRAGMA foreign_key_check({})", spec.name))?;
        let mut rows = stmt.query([])?;
        let mut count = 0usize;
        while rows.next()?.is_some() {
            count += 1;
        }
        count
    };
    if orphans > 0 {
        return Err(TrackerError::StructuralMigration(format!(
            "{} has {} row(s) pointing at missing parents; refusing to add the foreign key",
            spec.name, orphans
        )));
    }

    Ok(())
}

/// Rewrite a stored CREATE TABLE statement into the staging table: strict
/// legacy columns lose NOT NULL and the owner column gets the cascading
/// reference. Everything else is kept as written.
fn staging_definition(
    create: &str,
    staging: &str,
    spec: &TableSpec,
    existing: &[ExistingColumn],
) -> TrackerResult<String> {
    let create = strip_comments(create);
    let (open, close) = definition_body(&create).ok_or_else(|| {
        TrackerError::StructuralMigration(format!("cannot read the definition of {}", spec.name))
    })?;

    let mut definitions = Vec::new();
    for piece in split_top_level(&create[open + 1..close]) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if is_table_constraint(piece) {
            // replaced by the column-level reference below
            if let Some(fk) = &spec.parent {
                if foreign_key_column(piece)?.is_some_and(|c| c.eq_ignore_ascii_case(fk.column)) {
                    continue;
                }
            }
            definitions.push(piece.to_string());
            continue;
        }

        let name = leading_identifier(piece);
        let mut def = piece.to_string();
        let strict = existing
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(&name) && is_strict_legacy(spec, c));
        if strict {
            def = drop_not_null(&def)?;
        }
        if let Some(fk) = &spec.parent {
            if fk.column.eq_ignore_ascii_case(&name) {
                def = format!(
                    "{} REFERENCES {}(id) ON DELETE CASCADE",
                    drop_references(&def)?,
                    fk.parent
                );
            }
        }
        definitions.push(def);
    }

    Ok(format!(
        "CREATE TABLE {} ({}){}",
        staging,
        definitions.join(", "),
        &create[close + 1..]
    ))
}

fn pattern(source: &str) -> TrackerResult<Regex> {
    Regex::new(source).map_err(|e| TrackerError::StructuralMigration(e.to_string()))
}

/// Removes `--` and `/* */` comments outside quoted text.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(ch) = chars.next() {
        if let Some(close) = quote {
            out.push(ch);
            if ch == close {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                out.push(ch);
            }
            '[' => {
                quote = Some(']');
                out.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Byte offsets of the parentheses around a CREATE TABLE body.
fn definition_body(sql: &str) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    let mut open = None;
    let mut quote: Option<char> = None;
    for (i, ch) in sql.char_indices() {
        if let Some(close) = quote {
            if ch == close {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '[' => quote = Some(']'),
            '(' => {
                if open.is_none() {
                    open = Some(i);
                }
                depth += 1;
            }
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return open.map(|o| (o, i));
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits on commas that are not nested in parentheses or quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        if let Some(close) = quote {
            if ch == close {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '[' => quote = Some(']'),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

fn first_word(piece: &str) -> &str {
    piece
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
}

fn is_table_constraint(piece: &str) -> bool {
    matches!(
        first_word(piece).to_ascii_uppercase().as_str(),
        "CONSTRAINT" | "PRIMARY" | "UNIQUE" | "CHECK" | "FOREIGN"
    )
}

/// Column name at the start of a column definition, unquoted.
fn leading_identifier(piece: &str) -> String {
    let piece = piece.trim_start();
    let mut chars = piece.chars();
    match chars.next() {
        Some(open @ ('"' | '`' | '[')) => {
            let close = if open == '[' { ']' } else { open };
            chars.take_while(|c| *c != close).collect()
        }
        _ => first_word(piece).to_string(),
    }
}

/// The column of a single-column table-level FOREIGN KEY constraint.
fn foreign_key_column(piece: &str) -> TrackerResult<Option<String>> {
    let re = pattern(r#"(?i)^(?:CONSTRAINT\s+\S+\s+)?FOREIGN\s+KEY\s*\(\s*["`\[]?(\w+)["`\]]?\s*\)"#)?;
    Ok(re.captures(piece.trim()).map(|caps| caps[1].to_string()))
}

/// Drops a column's NOT NULL constraint, leaving `IS NOT NULL` expressions alone.
fn drop_not_null(def: &str) -> TrackerResult<String> {
    let re = pattern(r"(?i)(\bIS\s+)?\bNOT\s+NULL\b(?:\s+ON\s+CONFLICT\s+\w+)?")?;
    Ok(re
        .replace_all(def, |caps: &Captures| {
            if caps.get(1).is_some() {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned())
}

/// Drops a column-level REFERENCES clause with its actions.
fn drop_references(def: &str) -> TrackerResult<String> {
    let re = pattern(
        r#"(?i)\s+(?:CONSTRAINT\s+\S+\s+)?REFERENCES\s+["`\[]?\w+["`\]]?(?:\s*\([^)]*\))?(?:\s+ON\s+(?:DELETE|UPDATE)\s+(?:SET\s+NULL|SET\s+DEFAULT|CASCADE|RESTRICT|NO\s+ACTION)|\s+MATCH\s+\w+)*(?:\s+(?:NOT\s+)?DEFERRABLE(?:\s+INITIALLY\s+(?:DEFERRED|IMMEDIATE))?)?"#,
    )?;
    Ok(re.replace_all(def, "").into_owned())
}

fn table_exists(conn: &Connection, table: &str) -> TrackerResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn index_exists(conn: &Connection, index: &str) -> TrackerResult<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [index],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_columns(conn: &Connection, table: &str) -> TrackerResult<Vec<ExistingColumn>> {
    let mut stmt = conn.prepare(
        r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
    )?;
    let rows = stmt.query_map([table], |row| {
        Ok(ExistingColumn {
            name: row.get(0)?,
            declared: row.get(1)?,
            not_null: row.get::<_, i64>(2)? != 0,
            default: row.get(3)?,
            pk: row.get::<_, i64>(4)? != 0,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn has_cascading_fk(conn: &Connection, table: &str, fk: &ForeignKeySpec) -> TrackerResult<bool> {
    let count: i64 = conn.query_row(
        r#"SELECT COUNT(*) FROM pragma_foreign_key_list(?1)
           WHERE "from" = ?2 AND "table" = ?3 AND UPPER(on_delete) = 'CASCADE'"#,
        params![table, fk.column, fk.parent],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Whether a column exists; used by read paths that tolerate legacy layouts.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> TrackerResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    /// Stable description of every table, column, foreign key and index.
    pub(crate) fn describe(conn: &Connection) -> Vec<String> {
        let mut out = Vec::new();
        let mut stmt = conn
            .prepare("SELECT type, name, tbl_name, sql FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name")
            .unwrap();
        let rows: Vec<(String, String, String, Option<String>)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for (kind, name, table, sql) in rows {
            out.push(format!("{kind}|{name}|{table}|{}", sql.unwrap_or_default()));
        }
        out
    }

    pub(crate) fn legacy_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company VARCHAR(255) NOT NULL,
                role VARCHAR(255) NOT NULL,
                job_link TEXT NOT NULL,
                status VARCHAR(50) NOT NULL,
                applied_date DATE NOT NULL,
                notes TEXT
            );
            CREATE TABLE interviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                application_id INTEGER NOT NULL,
                interview_date DATE NOT NULL,
                interview_time TIME NOT NULL,
                venue VARCHAR(255) NOT NULL,
                status VARCHAR(50) NOT NULL
            );
            INSERT INTO applications (company, role, job_link, status, applied_date)
                VALUES ('Acme', 'Engineer', 'https://acme.example/1', 'Interview', '2024-01-01');
            INSERT INTO interviews (application_id, interview_date, interview_time, venue, status)
                VALUES (1, '2024-01-10', '14:00', 'Zoom', 'Scheduled');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_fresh_store_created_then_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        let first = reconcile(&mut conn).unwrap();
        assert_eq!(
            first.created_tables,
            vec!["applications", "interviews", "accounts", "profiles"]
        );
        let shape = describe(&conn);

        let second = reconcile(&mut conn).unwrap();
        assert!(second.is_noop(), "{second:?}");
        assert_eq!(describe(&conn), shape);
    }

    #[test]
    fn test_legacy_store_upgraded_without_losing_data() {
        let mut conn = legacy_store();
        let report = reconcile(&mut conn).unwrap();

        assert!(report.added_columns.contains(&"applications.location".to_string()));
        assert!(report.added_columns.contains(&"applications.interview_date".to_string()));
        assert!(report.added_columns.contains(&"interviews.company_tag".to_string()));
        assert!(report.added_columns.contains(&"interviews.interview_venue".to_string()));
        assert_eq!(report.rebuilt_tables, vec!["interviews"]);
        assert!(report.created_indexes.contains(&"uq_interviews_application".to_string()));

        // legacy columns survive with their data
        assert!(has_column(&conn, "interviews", "venue").unwrap());
        assert!(has_column(&conn, "interviews", "status").unwrap());
        let (venue, date): (String, String) = conn
            .query_row("SELECT venue, interview_date FROM interviews WHERE id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(venue, "Zoom");
        assert_eq!(date, "2024-01-10");

        // relaxed: inserts that ignore the legacy columns now succeed
        conn.execute(
            "INSERT INTO applications (company, role, location, job_link, status, applied_date)
             VALUES ('Globex', 'SRE', 'Berlin', 'https://globex.example', 'Interview', '2024-02-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO interviews (application_id, interview_date, interview_time, interview_venue)
             VALUES (2, '2024-02-10', '10:00', 'Office')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_legacy_store_is_idempotent() {
        let mut conn = legacy_store();
        reconcile(&mut conn).unwrap();
        let shape = describe(&conn);

        let again = reconcile(&mut conn).unwrap();
        assert!(again.is_noop(), "{again:?}");
        assert_eq!(describe(&conn), shape);
    }

    #[test]
    fn test_rebuilt_table_cascades_deletes() {
        let mut conn = legacy_store();
        reconcile(&mut conn).unwrap();

        conn.execute("DELETE FROM applications WHERE id = 1", []).unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM interviews", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_conflicting_type_is_fatal_and_rolled_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company TEXT NOT NULL,
                role TEXT NOT NULL,
                job_link TEXT NOT NULL,
                status TEXT NOT NULL,
                applied_date TEXT NOT NULL
            );
            CREATE TABLE interviews (
                id INTEGER PRIMARY KEY,
                application_id INTEGER NOT NULL,
                interview_venue INTEGER
            );
            "#,
        )
        .unwrap();
        let before = describe(&conn);

        let err = reconcile(&mut conn).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert_eq!(describe(&conn), before);
    }

    #[test]
    fn test_duplicate_interviews_block_uniqueness() {
        let mut conn = legacy_store();
        conn.execute(
            "INSERT INTO interviews (application_id, interview_date, interview_time, venue, status)
             VALUES (1, '2024-01-11', '15:00', 'Office', 'Scheduled')",
            [],
        )
        .unwrap();

        let err = reconcile(&mut conn).unwrap_err();
        assert!(matches!(err, TrackerError::StructuralMigration(_)));
        assert!(!has_column(&conn, "interviews", "company_tag").unwrap());
    }

    #[test]
    fn test_orphan_rows_block_foreign_key() {
        let mut conn = legacy_store();
        conn.execute(
            "INSERT INTO interviews (application_id, interview_date, interview_time, venue, status)
             VALUES (99, '2024-01-11', '15:00', 'Office', 'Scheduled')",
            [],
        )
        .unwrap();

        let err = reconcile(&mut conn).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_owner_column_is_fatal() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE interviews (id INTEGER PRIMARY KEY, job_id INTEGER NOT NULL)")
            .unwrap();
        let err = reconcile(&mut conn).unwrap_err();
        assert!(matches!(err, TrackerError::StructuralMigration(_)));
    }

    /// A legacy applications table with one row, plus the given interviews table.
    fn store_with_interviews(interviews: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company VARCHAR(255) NOT NULL,
                role VARCHAR(255) NOT NULL,
                job_link TEXT NOT NULL,
                status VARCHAR(50) NOT NULL,
                applied_date DATE NOT NULL,
                notes TEXT
            );
            INSERT INTO applications (company, role, job_link, status, applied_date)
                VALUES ('Acme', 'Engineer', 'https://acme.example/1', 'Interview', '2024-01-01');
            "#,
        )
        .unwrap();
        conn.execute_batch(interviews).unwrap();
        conn
    }

    fn constrained_store() -> Connection {
        store_with_interviews(
            r#"
            CREATE TABLE interviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                application_id INTEGER NOT NULL, -- owner (no reference yet), see below
                interview_date TEXT NOT NULL,
                interview_time TEXT NOT NULL,
                interview_venue TEXT NOT NULL,
                round INTEGER NOT NULL DEFAULT 1 CHECK (round > 0),
                outcome VARCHAR(20) NOT NULL CHECK (outcome IN ('pending', 'passed', 'failed')),
                external_ref TEXT UNIQUE,
                /* timestamps */
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO interviews
                (application_id, interview_date, interview_time, interview_venue, outcome, external_ref, created_at)
                VALUES (1, '2024-01-10', '14:00', 'Zoom', 'pending', 'ext-1', '2024-01-01 09:00:00');
            "#,
        )
    }

    #[test]
    fn test_rebuild_keeps_defaults_and_constraints() {
        let mut conn = constrained_store();
        let report = reconcile(&mut conn).unwrap();
        assert_eq!(report.rebuilt_tables, vec!["interviews"]);

        let created: String = conn
            .query_row("SELECT created_at FROM interviews WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(created, "2024-01-01 09:00:00");

        // outcome was relaxed; expression and keyword defaults still apply
        conn.execute(
            "INSERT INTO applications (company, role, location, job_link, status, applied_date)
             VALUES ('Globex', 'SRE', 'Berlin', 'https://globex.example', 'Interview', '2024-02-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO interviews (application_id, interview_date, interview_time, interview_venue)
             VALUES (2, '2024-02-10', '10:00', 'Office')",
            [],
        )
        .unwrap();
        let (round, created, updated): (i64, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT round, created_at, updated_at FROM interviews WHERE application_id = 2",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(round, 1);
        assert!(created.is_some());
        assert!(updated.is_some());

        // CHECK and inline UNIQUE constraints survive
        assert!(conn.execute("UPDATE interviews SET round = 0 WHERE id = 1", []).is_err());
        assert!(conn
            .execute("UPDATE interviews SET outcome = 'ghosted' WHERE id = 1", [])
            .is_err());
        assert!(conn
            .execute("UPDATE interviews SET external_ref = 'ext-1' WHERE application_id = 2", [])
            .is_err());
        let autoindexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'index' AND tbl_name = 'interviews' AND name LIKE 'sqlite_autoindex_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(autoindexes, 1);

        conn.execute("DELETE FROM applications WHERE id = 1", []).unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM interviews", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 1);

        let again = reconcile(&mut conn).unwrap();
        assert!(again.is_noop(), "{again:?}");
    }

    #[test]
    fn test_rebuild_keeps_triggers() {
        let mut conn = constrained_store();
        conn.execute_batch(
            "CREATE TRIGGER interviews_touch AFTER UPDATE OF interview_venue ON interviews
             BEGIN
                 UPDATE interviews SET updated_at = 'touched' WHERE id = NEW.id;
             END;",
        )
        .unwrap();
        reconcile(&mut conn).unwrap();

        conn.execute("UPDATE interviews SET interview_venue = 'Office' WHERE id = 1", [])
            .unwrap();
        let updated: String = conn
            .query_row("SELECT updated_at FROM interviews WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(updated, "touched");
    }

    #[rstest]
    #[case::table_level(
        "CREATE TABLE interviews (
            id INTEGER PRIMARY KEY,
            application_id INTEGER NOT NULL,
            interview_date TEXT NOT NULL,
            interview_time TEXT NOT NULL,
            interview_venue TEXT NOT NULL,
            FOREIGN KEY (application_id) REFERENCES applications(id)
        )"
    )]
    #[case::column_level(
        "CREATE TABLE interviews (
            id INTEGER PRIMARY KEY,
            application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE SET NULL,
            interview_date TEXT NOT NULL,
            interview_time TEXT NOT NULL,
            interview_venue TEXT NOT NULL
        )"
    )]
    fn test_weak_reference_replaced_by_cascade(#[case] interviews: &str) {
        let mut conn = store_with_interviews(interviews);
        conn.execute(
            "INSERT INTO interviews (application_id, interview_date, interview_time, interview_venue)
             VALUES (1, '2024-01-10', '14:00', 'Zoom')",
            [],
        )
        .unwrap();

        let report = reconcile(&mut conn).unwrap();
        assert_eq!(report.rebuilt_tables, vec!["interviews"]);

        let references: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT on_delete FROM pragma_foreign_key_list('interviews')")
                .unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(references, vec!["CASCADE"]);

        conn.execute("DELETE FROM applications WHERE id = 1", []).unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM interviews", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_definition_helpers() {
        let sql = strip_comments(
            "CREATE TABLE t (a TEXT DEFAULT 'x, y', -- note, (unbalanced\n b INTEGER CHECK (b IN (1, 2)), /* c, */ UNIQUE (a, b))",
        );
        let (open, close) = definition_body(&sql).unwrap();
        let pieces: Vec<&str> = split_top_level(&sql[open + 1..close])
            .into_iter()
            .map(str::trim)
            .collect();
        assert_eq!(
            pieces,
            vec!["a TEXT DEFAULT 'x, y'", "b INTEGER CHECK (b IN (1, 2))", "UNIQUE (a, b)"]
        );
        assert!(is_table_constraint(pieces[2]));
        assert_eq!(leading_identifier("\"round\" INTEGER"), "round");
        assert_eq!(leading_identifier("[venue] TEXT"), "venue");

        assert_eq!(
            drop_not_null("status TEXT NOT NULL CHECK (status IS NOT NULL)").unwrap(),
            "status TEXT  CHECK (status IS NOT NULL)"
        );
        assert_eq!(
            foreign_key_column("FOREIGN KEY (\"application_id\") REFERENCES applications(id)").unwrap(),
            Some("application_id".to_string())
        );
        assert_eq!(
            drop_references("application_id INTEGER NOT NULL REFERENCES applications (id) ON DELETE SET NULL")
                .unwrap(),
            "application_id INTEGER NOT NULL"
        );
    }

    #[test]
    fn test_affinity_rules() {
        assert_eq!(Affinity::of("VARCHAR(255)"), Affinity::Text);
        assert_eq!(Affinity::of("TINYINT(1)"), Affinity::Integer);
        assert_eq!(Affinity::of("DATE"), Affinity::Numeric);
        assert_eq!(Affinity::of(""), Affinity::Blob);
        assert!(Affinity::Text.can_hold(Affinity::Numeric));
        assert!(!Affinity::Text.can_hold(Affinity::Integer));
        assert!(!Affinity::Integer.can_hold(Affinity::Text));
    }
}
