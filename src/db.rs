use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    // The reconcile worker holds a second connection to the same file.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_school ON classrooms(school_id)",
        [],
    )?;

    // value: JSON array of [start, end] ISO-date string pairs, one per
    // sub-period. Malformed pairs are tolerated at read time.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            value TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_periods_school ON periods(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS shifts(
            school_id TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            hour INTEGER NOT NULL,
            starts_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            PRIMARY KEY(school_id, weekday, hour),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    // value: JSON array of 7 weekday rows (Monday-first), each an array of
    // subject-id strings, '' for an empty slot.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL UNIQUE,
            value TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            hour INTEGER,
            period_id TEXT NOT NULL,
            period_key INTEGER NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(period_id) REFERENCES periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_classroom_date ON lessons(classroom_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_period ON lessons(period_id)",
        [],
    )?;

    // Grade rows ride the lesson id, which is why reschedules must keep it.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_grades(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            value INTEGER NOT NULL,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_grades_lesson ON lesson_grades(lesson_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            lesson_id TEXT NOT NULL,
            action TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_classroom ON audit_log(classroom_id)",
        [],
    )?;

    Ok(())
}
