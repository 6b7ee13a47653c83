use anyhow::Result;
use chrono::{Duration, NaiveDate};
use std::fmt;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::calendar::{
    is_holiday, monday_of, period_bounds, resolve_by_approx_date, resolve_key, week_key, Weekday,
};
use crate::matcher::{match_day, DayPlan, SlotAction, WeekIndex};
use crate::store::{Period, Timetable, TimetableStore};

/// No active period exists for the school; nothing can be reconciled.
#[derive(Debug)]
pub struct MissingPeriodError {
    pub school_id: String,
}

impl fmt::Display for MissingPeriodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no active period for school {}", self.school_id)
    }
}

impl std::error::Error for MissingPeriodError {}

pub struct ReconcileRequest<'a> {
    pub timetable: &'a Timetable,
    pub template: &'a [Vec<String>],
    /// true: the sync window opens at this week's Monday. false: at next
    /// week's Monday, leaving the in-flight week untouched.
    pub current_week_only: bool,
    pub disable_logging: bool,
    /// Reference "today". Maintenance tooling passes an explicit date.
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub period_id: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Brings a classroom's lessons into agreement with its timetable template.
///
/// Runs the passes described in the module-level flow: index existing lessons
/// by ISO week and subject, back-fill untouched pre-window weeks
/// (create-only), walk the sync window matching each day's slots, delete
/// whatever in-window lessons no slot claimed, then execute exactly one
/// batched delete, create and update against the store. Repeating the call
/// with no external changes yields an all-zero outcome.
pub fn reconcile<S, A>(store: &S, audit: &A, req: &ReconcileRequest) -> Result<ReconcileOutcome>
where
    S: TimetableStore,
    A: AuditSink,
{
    let timetable = req.timetable;
    let period = active_period(store, &timetable.school_id, req.as_of)?;
    let Some((period_start, period_end)) = period_bounds(&period.value) else {
        return Err(MissingPeriodError {
            school_id: timetable.school_id.clone(),
        }
        .into());
    };

    let this_monday = monday_of(req.as_of);
    let mut window_start = if req.current_week_only {
        this_monday
    } else {
        this_monday + Duration::days(7)
    };
    if window_start < period_start {
        window_start = period_start;
    }

    let lessons = store.find_lessons(&timetable.classroom_id, period_start, period_end)?;
    let mut index = WeekIndex::build(lessons);

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    let description = format!("timetable:{}", timetable.id);

    // Back-fill: seed weeks before the window that have no lessons at all.
    // Never consumes existing lessons, so populated weeks stay untouched.
    let mut date = period_start;
    while date < window_start && date <= period_end {
        if !is_holiday(date) && index.week_count(week_key(date)) == 0 {
            let period_key = resolve_key(&period.value, date);
            if period_key != 0 {
                if let Some(row) = req.template.get(Weekday::from_date(date).index()) {
                    let actions = match_day(
                        &mut index,
                        &DayPlan {
                            date,
                            row,
                            classroom_id: &timetable.classroom_id,
                            period_id: &period.id,
                            period_key: period_key as i64,
                            create_only: true,
                        },
                    );
                    for action in actions {
                        if let SlotAction::Create(lesson) = action {
                            creates.push(lesson);
                        }
                    }
                }
            }
        }
        date += Duration::days(1);
    }

    // Main pass over the sync window, with audit events flushed once per
    // processed week rather than per day.
    let mut week_events: Vec<AuditEvent> = Vec::new();
    let mut date = window_start;
    let mut day_offset: i64 = 0;
    while date <= period_end {
        let period_key = resolve_key(&period.value, date);
        if !is_holiday(date) && period_key != 0 {
            if let Some(row) = req.template.get(Weekday::from_date(date).index()) {
                let actions = match_day(
                    &mut index,
                    &DayPlan {
                        date,
                        row,
                        classroom_id: &timetable.classroom_id,
                        period_id: &period.id,
                        period_key: period_key as i64,
                        create_only: false,
                    },
                );
                for action in actions {
                    match action {
                        SlotAction::Create(lesson) => {
                            week_events.push(AuditEvent {
                                classroom_id: timetable.classroom_id.clone(),
                                lesson_id: lesson.id.clone(),
                                action: AuditAction::Create,
                                description: description.clone(),
                            });
                            creates.push(lesson);
                        }
                        SlotAction::Update(lesson) => {
                            week_events.push(AuditEvent {
                                classroom_id: timetable.classroom_id.clone(),
                                lesson_id: lesson.id.clone(),
                                action: AuditAction::Update,
                                description: description.clone(),
                            });
                            updates.push(lesson);
                        }
                    }
                }
            }
        }
        day_offset += 1;
        if day_offset % 7 == 0 {
            flush_events(audit, req.disable_logging, &mut week_events)?;
        }
        date += Duration::days(1);
    }
    flush_events(audit, req.disable_logging, &mut week_events)?;

    // Deletion pass: in-window lessons no template slot claimed. Anything
    // dated before the window is history and stays. Deletions are only
    // audited for the first two ISO weeks of the window.
    let logged_weeks = [week_key(window_start), week_key(window_start + Duration::days(7))];
    let mut deletes = Vec::new();
    let mut delete_events = Vec::new();
    for lesson in index.unconsumed() {
        if lesson.date < window_start {
            continue;
        }
        if logged_weeks.contains(&week_key(lesson.date)) {
            delete_events.push(AuditEvent {
                classroom_id: timetable.classroom_id.clone(),
                lesson_id: lesson.id.clone(),
                action: AuditAction::Delete,
                description: description.clone(),
            });
        }
        deletes.push(lesson.id.clone());
    }
    flush_events(audit, req.disable_logging, &mut delete_events)?;

    store.delete_lessons_batch(&deletes)?;
    store.create_lessons_batch(&creates)?;
    store.update_lessons_batch(&updates)?;

    Ok(ReconcileOutcome {
        period_id: period.id.clone(),
        created: creates.len(),
        updated: updates.len(),
        deleted: deletes.len(),
    })
}

fn flush_events<A: AuditSink>(
    audit: &A,
    disable_logging: bool,
    events: &mut Vec<AuditEvent>,
) -> Result<()> {
    if !disable_logging && !events.is_empty() {
        audit.record(events)?;
    }
    events.clear();
    Ok(())
}

/// The school's period covering `as_of`, with the ±15-day probe so a run a
/// few days before term start (or during a vacation gap) still resolves.
fn active_period<S: TimetableStore>(
    store: &S,
    school_id: &str,
    as_of: NaiveDate,
) -> Result<Period> {
    let periods = store.find_periods_for_school(school_id)?;
    periods
        .into_iter()
        .find(|p| resolve_by_approx_date(&p.value, as_of) != 0)
        .ok_or_else(|| {
            MissingPeriodError {
                school_id: school_id.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SqliteAudit;
    use crate::db;
    use crate::store::{period_value_string, Lesson, SqliteStore};
    use rusqlite::Connection;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    /// 2024-25 first term: two quarters with a vacation week between.
    const QUARTERS: &[(&str, &str)] = &[
        ("2024-09-01", "2024-10-22"),
        ("2024-10-31", "2024-12-29"),
    ];

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn
    }

    fn seed_school(conn: &Connection) -> Timetable {
        conn.execute(
            "INSERT INTO schools(id, name) VALUES('sch1', 'School 1')",
            [],
        )
        .expect("school");
        conn.execute(
            "INSERT INTO classrooms(id, school_id, name) VALUES('room1', 'sch1', '5-A')",
            [],
        )
        .expect("classroom");
        let value = period_value_string(
            &QUARTERS
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect::<Vec<_>>(),
        );
        conn.execute(
            "INSERT INTO periods(id, school_id, name, value) VALUES('per1', 'sch1', 'Term 1', ?)",
            [value],
        )
        .expect("period");
        Timetable {
            id: "tt1".to_string(),
            classroom_id: "room1".to_string(),
            school_id: "sch1".to_string(),
            value: Vec::new(),
        }
    }

    fn monday_math_template() -> Vec<Vec<String>> {
        let mut rows = vec![vec![String::new(); 6]; 7];
        rows[0][1] = "math".to_string();
        rows
    }

    fn run(
        conn: &Connection,
        timetable: &Timetable,
        template: &[Vec<String>],
        as_of: &str,
    ) -> ReconcileOutcome {
        let store = SqliteStore::new(conn);
        let audit = SqliteAudit::new(conn);
        reconcile(
            &store,
            &audit,
            &ReconcileRequest {
                timetable,
                template,
                current_week_only: true,
                disable_logging: false,
                as_of: d(as_of),
            },
        )
        .expect("reconcile")
    }

    fn lesson_rows(conn: &Connection) -> Vec<(String, String, Option<i64>, String)> {
        let mut stmt = conn
            .prepare("SELECT id, date, hour, subject_id FROM lessons ORDER BY date, hour, id")
            .expect("prepare");
        stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
    }

    #[test]
    fn fresh_period_creates_one_lesson_per_monday_and_is_idempotent() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        let template = monday_math_template();

        let first = run(&conn, &timetable, &template, "2024-09-20");
        // 17 Mondays from 2024-09-02 through 2024-12-23, minus the vacation
        // Monday 2024-10-28.
        assert_eq!(first.created, 16);
        assert_eq!(first.updated, 0);
        assert_eq!(first.deleted, 0);
        assert_eq!(first.period_id, "per1");

        let rows = lesson_rows(&conn);
        assert_eq!(rows.len(), 16);
        for (_, date, hour, subject) in &rows {
            assert_eq!(Weekday::from_date(d(date)).index(), 0, "on {date}");
            assert_eq!(*hour, Some(1));
            assert_eq!(subject, "math");
        }
        assert!(!rows.iter().any(|(_, date, _, _)| date == "2024-10-28"));

        let second = run(&conn, &timetable, &template, "2024-09-20");
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.deleted, 0);
    }

    #[test]
    fn repeated_subject_on_one_weekday_settles_after_first_run() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        // Math twice every Monday, hours 1 and 3. Both existing lessons sit
        // on the target date, so the matcher has to keep each in its own
        // slot instead of swapping the pair on every run.
        let mut template = monday_math_template();
        template[0][3] = "math".to_string();

        let first = run(&conn, &timetable, &template, "2024-09-20");
        assert_eq!(first.created, 32);
        assert_eq!(first.updated, 0);
        assert_eq!(first.deleted, 0);

        let second = run(&conn, &timetable, &template, "2024-09-20");
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.deleted, 0);
    }

    #[test]
    fn hour_move_updates_the_same_lesson_identity() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        let template = monday_math_template();
        run(&conn, &timetable, &template, "2024-09-20");
        let before = lesson_rows(&conn);

        let mut moved = monday_math_template();
        moved[0][1] = String::new();
        moved[0][3] = "math".to_string();
        let outcome = run(&conn, &timetable, &moved, "2024-09-20");
        // Window opens at Monday 2024-09-16: the two back-filled Mondays
        // before it are history, the 14 in-window lessons move in place.
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 14);
        assert_eq!(outcome.deleted, 0);

        let after = lesson_rows(&conn);
        let ids_before: Vec<_> = before.iter().map(|r| r.0.clone()).collect();
        let ids_after: Vec<_> = after.iter().map(|r| r.0.clone()).collect();
        assert_eq!(ids_before, ids_after);
        for (_, date, hour, _) in &after {
            if d(date) < d("2024-09-16") {
                assert_eq!(*hour, Some(1), "pre-window lesson on {date} moved");
            } else {
                assert_eq!(*hour, Some(3), "in-window lesson on {date} not moved");
            }
        }
    }

    #[test]
    fn removing_a_subject_deletes_only_in_window_lessons() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        let template = monday_math_template();
        run(&conn, &timetable, &template, "2024-09-20");

        let empty = vec![vec![String::new(); 6]; 7];
        let outcome = run(&conn, &timetable, &empty, "2024-09-20");
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.deleted, 14);

        let rows = lesson_rows(&conn);
        assert_eq!(rows.len(), 2);
        for (_, date, _, _) in &rows {
            assert!(d(date) < d("2024-09-16"), "lesson on {date} should be gone");
        }
    }

    #[test]
    fn no_lessons_on_holidays_or_vacation() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        // Every day, every slot.
        let template = vec![vec!["math".to_string(); 2]; 7];
        run(&conn, &timetable, &template, "2024-09-20");

        for (_, date, _, _) in &lesson_rows(&conn) {
            let date = d(date);
            assert!(!is_holiday(date), "lesson on holiday {date}");
            let value: Vec<(String, String)> = QUARTERS
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect();
            assert_ne!(resolve_key(&value, date), 0, "lesson on vacation {date}");
        }
        let rows = lesson_rows(&conn);
        // 2024-09-01 is both in the period and a holiday.
        assert!(!rows.iter().any(|(_, date, _, _)| date == "2024-09-01"));
        assert!(!rows.iter().any(|(_, date, _, _)| date == "2024-10-25"));
    }

    #[test]
    fn backfill_skips_weeks_that_already_have_any_lesson() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        // A stray lesson for an unrelated subject in the week of 09-02.
        let store = SqliteStore::new(&conn);
        store
            .create_lessons_batch(&[Lesson {
                id: "stray".to_string(),
                classroom_id: "room1".to_string(),
                subject_id: "art".to_string(),
                date: d("2024-09-03"),
                hour: Some(0),
                period_id: "per1".to_string(),
                period_key: 1,
            }])
            .expect("stray");

        let template = monday_math_template();
        run(&conn, &timetable, &template, "2024-09-20");

        let rows = lesson_rows(&conn);
        // Back-fill seeded 09-09 but left the stray's week alone.
        assert!(!rows
            .iter()
            .any(|(_, date, _, subject)| date == "2024-09-02" && subject == "math"));
        assert!(rows
            .iter()
            .any(|(_, date, _, subject)| date == "2024-09-09" && subject == "math"));
        assert!(rows.iter().any(|(id, _, _, _)| id == "stray"));
    }

    #[test]
    fn missing_period_fails_fast() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        conn.execute("DELETE FROM periods", []).expect("clear");
        let store = SqliteStore::new(&conn);
        let audit = SqliteAudit::new(&conn);
        let template = monday_math_template();
        let err = reconcile(
            &store,
            &audit,
            &ReconcileRequest {
                timetable: &timetable,
                template: &template,
                current_week_only: true,
                disable_logging: true,
                as_of: d("2024-09-20"),
            },
        )
        .expect_err("should fail");
        assert!(err.downcast_ref::<MissingPeriodError>().is_some());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM lessons", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn next_week_window_leaves_current_week_alone() {
        let conn = test_conn();
        let timetable = seed_school(&conn);
        let template = monday_math_template();
        run(&conn, &timetable, &template, "2024-09-20");

        let mut moved = monday_math_template();
        moved[0][1] = String::new();
        moved[0][3] = "math".to_string();
        let store = SqliteStore::new(&conn);
        let audit = SqliteAudit::new(&conn);
        let outcome = reconcile(
            &store,
            &audit,
            &ReconcileRequest {
                timetable: &timetable,
                template: &moved,
                current_week_only: false,
                disable_logging: true,
                as_of: d("2024-09-20"),
            },
        )
        .expect("reconcile");
        // Window opens 2024-09-23; the 2024-09-16 lesson stays at hour 1.
        assert_eq!(outcome.updated, 13);
        let rows = lesson_rows(&conn);
        let week16 = rows
            .iter()
            .find(|(_, date, _, _)| date == "2024-09-16")
            .expect("lesson on 09-16");
        assert_eq!(week16.2, Some(1));
    }
}
