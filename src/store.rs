use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::calendar::parse_iso_date;

/// A concrete, datable class session. Owned by the reconciliation engine;
/// grade rows hang off `id`, which is why moves must keep it stable.
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub id: String,
    pub classroom_id: String,
    pub subject_id: String,
    pub date: NaiveDate,
    pub hour: Option<i64>,
    pub period_id: String,
    pub period_key: i64,
}

/// An academic term: ordered `[start, end]` date-string pairs, one per
/// sub-period. Kept as raw strings so the resolver can skip malformed pairs.
#[derive(Debug, Clone)]
pub struct Period {
    pub id: String,
    pub school_id: String,
    pub name: String,
    pub value: Vec<(String, String)>,
}

/// A classroom's weekly template: 7 weekday rows of subject-id slots.
#[derive(Debug, Clone)]
pub struct Timetable {
    pub id: String,
    pub classroom_id: String,
    pub school_id: String,
    pub value: Vec<Vec<String>>,
}

/// The datastore surface the reconciliation engine is allowed to touch.
/// One round trip per call; each batch runs in a single transaction.
pub trait TimetableStore {
    fn find_lessons(&self, classroom_id: &str, from: NaiveDate, to: NaiveDate)
        -> Result<Vec<Lesson>>;
    fn create_lessons_batch(&self, lessons: &[Lesson]) -> Result<()>;
    fn update_lessons_batch(&self, lessons: &[Lesson]) -> Result<()>;
    fn delete_lessons_batch(&self, lesson_ids: &[String]) -> Result<()>;
    fn find_periods_for_school(&self, school_id: &str) -> Result<Vec<Period>>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteStore { conn }
    }
}

fn date_string(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Runs one batch inside a transaction on a shared connection handle.
pub fn in_transaction<F>(conn: &Connection, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    conn.execute_batch("BEGIN")?;
    match f() {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

impl TimetableStore for SqliteStore<'_> {
    fn find_lessons(
        &self,
        classroom_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Lesson>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, classroom_id, subject_id, date, hour, period_id, period_key
             FROM lessons
             WHERE classroom_id = ? AND date >= ? AND date <= ?
             ORDER BY date, hour, id",
        )?;
        let rows = stmt.query_map(
            params![classroom_id, date_string(from), date_string(to)],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<i64>>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, i64>(6)?,
                ))
            },
        )?;
        let mut lessons = Vec::new();
        for row in rows {
            let (id, classroom_id, subject_id, raw_date, hour, period_id, period_key) = row?;
            let Some(date) = parse_iso_date(&raw_date) else {
                continue;
            };
            lessons.push(Lesson {
                id,
                classroom_id,
                subject_id,
                date,
                hour,
                period_id,
                period_key,
            });
        }
        Ok(lessons)
    }

    fn create_lessons_batch(&self, lessons: &[Lesson]) -> Result<()> {
        if lessons.is_empty() {
            return Ok(());
        }
        in_transaction(self.conn, || {
            let mut stmt = self.conn.prepare(
                "INSERT INTO lessons(id, classroom_id, subject_id, date, hour, period_id, period_key)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
            )?;
            for lesson in lessons {
                stmt.execute(params![
                    lesson.id,
                    lesson.classroom_id,
                    lesson.subject_id,
                    date_string(lesson.date),
                    lesson.hour,
                    lesson.period_id,
                    lesson.period_key,
                ])?;
            }
            Ok(())
        })
    }

    fn update_lessons_batch(&self, lessons: &[Lesson]) -> Result<()> {
        if lessons.is_empty() {
            return Ok(());
        }
        in_transaction(self.conn, || {
            let mut stmt = self.conn.prepare(
                "UPDATE lessons SET date = ?, hour = ?, period_id = ?, period_key = ?
                 WHERE id = ?",
            )?;
            for lesson in lessons {
                stmt.execute(params![
                    date_string(lesson.date),
                    lesson.hour,
                    lesson.period_id,
                    lesson.period_key,
                    lesson.id,
                ])?;
            }
            Ok(())
        })
    }

    fn delete_lessons_batch(&self, lesson_ids: &[String]) -> Result<()> {
        if lesson_ids.is_empty() {
            return Ok(());
        }
        in_transaction(self.conn, || {
            let mut stmt = self.conn.prepare("DELETE FROM lessons WHERE id = ?")?;
            for id in lesson_ids {
                stmt.execute([id])?;
            }
            Ok(())
        })
    }

    fn find_periods_for_school(&self, school_id: &str) -> Result<Vec<Period>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, school_id, name, value FROM periods WHERE school_id = ? ORDER BY rowid",
        )?;
        let rows = stmt.query_map([school_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut periods = Vec::new();
        for row in rows {
            let (id, school_id, name, raw_value) = row?;
            periods.push(Period {
                id,
                school_id,
                name,
                value: parse_period_value(&raw_value),
            });
        }
        Ok(periods)
    }
}

/// Period value as stored: JSON array of [start, end] string pairs. Anything
/// that is not a two-string entry becomes an empty pair the resolver skips.
pub fn parse_period_value(raw: &str) -> Vec<(String, String)> {
    let parsed: Vec<Vec<String>> = serde_json::from_str(raw).unwrap_or_default();
    parsed
        .into_iter()
        .map(|pair| {
            let mut it = pair.into_iter();
            let start = it.next().unwrap_or_default();
            let end = it.next().unwrap_or_default();
            (start, end)
        })
        .collect()
}

pub fn period_value_string(pairs: &[(String, String)]) -> String {
    let arr: Vec<Vec<&String>> = pairs.iter().map(|(a, b)| vec![a, b]).collect();
    serde_json::to_string(&arr).unwrap_or_else(|_| "[]".to_string())
}

/// Template value as stored: JSON array of 7 weekday rows of subject-id
/// strings.
pub fn parse_template_value(raw: &str) -> Vec<Vec<String>> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Loads a classroom's timetable together with its school (via the classroom
/// row). Not part of the engine's store trait; handlers and the job worker
/// use it to assemble the engine's input.
pub fn load_timetable(conn: &Connection, classroom_id: &str) -> Result<Option<Timetable>> {
    let row = conn
        .query_row(
            "SELECT t.id, t.classroom_id, c.school_id, t.value
             FROM timetables t
             JOIN classrooms c ON c.id = t.classroom_id
             WHERE t.classroom_id = ?",
            [classroom_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(id, classroom_id, school_id, raw_value)| Timetable {
        id,
        classroom_id,
        school_id,
        value: parse_template_value(&raw_value),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn failed_transaction_rolls_back_a_shift_replacement() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn.execute("INSERT INTO schools(id, name) VALUES('sch1', 'School 1')", [])
            .expect("school");
        conn.execute(
            "INSERT INTO shifts(school_id, weekday, hour, starts_at, ends_at)
             VALUES('sch1', 0, 0, '08:30', '09:15')",
            [],
        )
        .expect("shift");

        let result = in_transaction(&conn, || {
            conn.execute("DELETE FROM shifts WHERE school_id = 'sch1'", [])?;
            conn.execute(
                "INSERT INTO shifts(school_id, weekday, hour, starts_at, ends_at)
                 VALUES('sch1', 1, 0, '08:30', '09:15')",
                [],
            )?;
            anyhow::bail!("entry rejected")
        });
        assert!(result.is_err());

        // The pre-existing row survives, the partial replacement does not.
        let (count, weekday): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MIN(weekday) FROM shifts WHERE school_id = 'sch1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("count");
        assert_eq!(count, 1);
        assert_eq!(weekday, 0);
    }
}
