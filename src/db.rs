use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::admission;

pub const DB_FILE: &str = "admissions.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            level TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            matricule TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            post_name TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL,
            sex TEXT NOT NULL,
            birth_place TEXT,
            birth_date TEXT NOT NULL,
            guardian_name TEXT,
            guardian_phone TEXT,
            address TEXT,
            class_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            status TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    // The enrollment duplicate check scans (last_name, first_name, birth_date).
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_identity
         ON students(last_name, first_name, birth_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS candidatures(
            id TEXT PRIMARY KEY,
            request_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            post_name TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL,
            sex TEXT NOT NULL,
            birth_place TEXT,
            birth_date TEXT NOT NULL,
            guardian_name TEXT,
            guardian_phone TEXT,
            address TEXT,
            requested_class_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            status TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            submitted_at TEXT NOT NULL,
            eval_score REAL,
            eval_comment TEXT,
            eval_recommendation TEXT,
            evaluated_by TEXT,
            evaluated_at TEXT,
            registration_fee REAL,
            tuition_fee REAL,
            discount_pct REAL,
            enrolled_student_id TEXT,
            FOREIGN KEY(requested_class_id) REFERENCES classes(id),
            FOREIGN KEY(enrolled_student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_candidatures_decision_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidatures_status ON candidatures(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidatures_class ON candidatures(requested_class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidatures_year ON candidatures(academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS candidature_documents(
            candidature_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            comment TEXT,
            verified_by TEXT,
            verified_at TEXT,
            PRIMARY KEY(candidature_id, kind),
            FOREIGN KEY(candidature_id) REFERENCES candidatures(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidature_documents_candidature
         ON candidature_documents(candidature_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_fees(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            registration_fee REAL NOT NULL,
            tuition_fee REAL NOT NULL,
            discount_pct REAL NOT NULL,
            total REAL NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(student_id, academic_year),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_fees_student ON student_fees(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS counters(
            kind TEXT NOT NULL,
            year INTEGER NOT NULL,
            last_seq INTEGER NOT NULL,
            PRIMARY KEY(kind, year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// The decision audit fields arrived after the first workspaces shipped.
fn ensure_candidatures_decision_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "candidatures", "decided_by")? {
        conn.execute("ALTER TABLE candidatures ADD COLUMN decided_by TEXT", [])?;
    }
    if !table_has_column(conn, "candidatures", "decided_at")? {
        conn.execute("ALTER TABLE candidatures ADD COLUMN decided_at TEXT", [])?;
    }
    if !table_has_column(conn, "candidatures", "decision_comment")? {
        conn.execute(
            "ALTER TABLE candidatures ADD COLUMN decision_comment TEXT",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Allocate the next matricule for `year`. Must run inside the caller's
/// transaction so the counter bump commits or rolls back together with the
/// student row that uses the number; the UNIQUE constraint on
/// `students.matricule` is the backstop.
pub fn allocate_matricule(conn: &Connection, year: i32) -> anyhow::Result<String> {
    let seq = counter_next(conn, "matricule", year, |conn| {
        max_seq_like(
            conn,
            "SELECT matricule FROM students WHERE matricule LIKE ?",
            &format!("{}%", year),
            |s| admission::matricule_seq(s, year),
        )
    })?;
    Ok(admission::format_matricule(year, seq))
}

/// Allocate the next intake request number for `year`.
pub fn allocate_request_no(conn: &Connection, year: i32) -> anyhow::Result<String> {
    let seq = counter_next(conn, "request_no", year, |conn| {
        max_seq_like(
            conn,
            "SELECT request_no FROM candidatures WHERE request_no LIKE ?",
            &format!("ADM-{}-%", year),
            |s| admission::request_no_seq(s, year),
        )
    })?;
    Ok(admission::format_request_no(year, seq))
}

/// Read-bump a per-year counter row, seeding it from pre-existing rows the
/// first time a year is seen so databases created before the counter table
/// keep their numbering.
fn counter_next<F>(conn: &Connection, kind: &str, year: i32, seed: F) -> anyhow::Result<i64>
where
    F: FnOnce(&Connection) -> anyhow::Result<i64>,
{
    let current: Option<i64> = conn
        .query_row(
            "SELECT last_seq FROM counters WHERE kind = ? AND year = ?",
            (kind, year),
            |r| r.get(0),
        )
        .optional()?;
    let next = match current {
        Some(last) => last + 1,
        None => seed(conn)? + 1,
    };
    conn.execute(
        "INSERT INTO counters(kind, year, last_seq) VALUES(?, ?, ?)
         ON CONFLICT(kind, year) DO UPDATE SET last_seq = excluded.last_seq",
        (kind, year, next),
    )?;
    Ok(next)
}

// Each number kind has its own prefix shape, so the caller supplies the
// LIKE pattern along with the parser that extracts the sequence.
fn max_seq_like<F>(conn: &Connection, sql: &str, like: &str, parse: F) -> anyhow::Result<i64>
where
    F: Fn(&str) -> Option<i64>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([like], |r| r.get::<_, String>(0))?;
    let mut max_seq = 0i64;
    for row in rows {
        if let Some(seq) = parse(&row?) {
            max_seq = max_seq.max(seq);
        }
    }
    Ok(max_seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_db_is_idempotent() {
        let ws = temp_workspace("admissiond-db-open");
        {
            let conn = open_db(&ws).expect("first open");
            conn.execute(
                "INSERT INTO classes(id, name) VALUES('c1', 'Test Class')",
                [],
            )
            .expect("insert class");
        }
        let conn = open_db(&ws).expect("second open");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn counters_allocate_sequentially_per_year() {
        let ws = temp_workspace("admissiond-db-counters");
        let conn = open_db(&ws).expect("open");
        assert_eq!(allocate_matricule(&conn, 2026).unwrap(), "20260001");
        assert_eq!(allocate_matricule(&conn, 2026).unwrap(), "20260002");
        assert_eq!(allocate_matricule(&conn, 2027).unwrap(), "20270001");
        assert_eq!(allocate_request_no(&conn, 2026).unwrap(), "ADM-2026-0001");
        assert_eq!(allocate_request_no(&conn, 2026).unwrap(), "ADM-2026-0002");
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn matricule_counter_seeds_from_existing_students() {
        let ws = temp_workspace("admissiond-db-seed");
        let conn = open_db(&ws).expect("open");
        conn.execute(
            "INSERT INTO classes(id, name) VALUES('c1', 'Seed Class')",
            [],
        )
        .expect("class");
        // A student imported before the counter table existed.
        conn.execute(
            "INSERT INTO students(id, matricule, last_name, first_name, sex,
                                  birth_date, class_id, academic_year, status, enrolled_at)
             VALUES('s1', '20260017', 'Kalonji', 'Grace', 'F',
                    '2014-03-02', 'c1', '2025-2026', 'active', '2026-01-10T00:00:00Z')",
            [],
        )
        .expect("student");
        assert_eq!(allocate_matricule(&conn, 2026).unwrap(), "20260018");
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn request_no_counter_seeds_from_existing_candidatures() {
        let ws = temp_workspace("admissiond-db-seed-request-no");
        let conn = open_db(&ws).expect("open");
        conn.execute(
            "INSERT INTO classes(id, name) VALUES('c1', 'Seed Class')",
            [],
        )
        .expect("class");
        // An intake recorded before the counter table existed. Its prefixed
        // request number must seed the counter, not be skipped by it.
        conn.execute(
            "INSERT INTO candidatures(id, request_no, last_name, first_name, sex,
                                      birth_date, requested_class_id, academic_year,
                                      status, priority, submitted_at)
             VALUES('ca1', 'ADM-2026-0007', 'Tshibangu', 'Marcel', 'M',
                    '2013-09-21', 'c1', '2025-2026', 'pending', 'normal',
                    '2026-02-01T08:00:00Z')",
            [],
        )
        .expect("candidature");
        assert_eq!(allocate_request_no(&conn, 2026).unwrap(), "ADM-2026-0008");
        assert_eq!(allocate_request_no(&conn, 2026).unwrap(), "ADM-2026-0009");
        let _ = std::fs::remove_dir_all(ws);
    }
}
