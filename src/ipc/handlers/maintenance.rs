use crate::audit::SqliteAudit;
use crate::calendar::parse_iso_date;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schools::{db_conn, required_str, school_exists};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{reconcile, ReconcileRequest};
use crate::store::{load_timetable, SqliteStore};
use chrono::Local;
use serde_json::json;

/// Bulk re-sync for one school: every classroom with a timetable, run
/// synchronously with logging disabled. One classroom failing does not stop
/// the rest; its error string rides along in the result.
fn handle_sync_school(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let as_of = match req.params.get("asOf").and_then(|v| v.as_str()) {
        Some(raw) => match parse_iso_date(raw) {
            Some(d) => d,
            None => return err(&req.id, "bad_params", "asOf must be YYYY-MM-DD", None),
        },
        None => Local::now().date_naive(),
    };
    match school_exists(conn, &school_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "school not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT c.id FROM classrooms c
         JOIN timetables t ON t.classroom_id = c.id
         WHERE c.school_id = ?
         ORDER BY c.name, c.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classroom_ids = match stmt
        .query_map([&school_id], |r| r.get::<_, String>(0))
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let store = SqliteStore::new(conn);
    let audit = SqliteAudit::new(conn);
    let mut results = Vec::with_capacity(classroom_ids.len());
    for classroom_id in classroom_ids {
        let timetable = match load_timetable(conn, &classroom_id) {
            Ok(Some(v)) => v,
            Ok(None) => continue,
            Err(e) => {
                results.push(json!({ "classroomId": classroom_id, "error": e.to_string() }));
                continue;
            }
        };
        let outcome = reconcile(
            &store,
            &audit,
            &ReconcileRequest {
                timetable: &timetable,
                template: &timetable.value,
                current_week_only: true,
                disable_logging: true,
                as_of,
            },
        );
        match outcome {
            Ok(outcome) => results.push(json!({
                "classroomId": classroom_id,
                "periodId": outcome.period_id,
                "created": outcome.created,
                "updated": outcome.updated,
                "deleted": outcome.deleted,
            })),
            Err(e) => {
                results.push(json!({ "classroomId": classroom_id, "error": e.to_string() }))
            }
        }
    }
    ok(&req.id, json!({ "classrooms": results }))
}

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, lesson_id, action, description, created_at
         FROM audit_log WHERE classroom_id = ? ORDER BY rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let events = match stmt
        .query_map([&classroom_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lessonId": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "description": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "events": events }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sync.school" => Some(handle_sync_school(state, req)),
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
