use crate::audit::SqliteAudit;
use crate::calendar::parse_iso_date;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schools::{classroom_school, required_str};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{reconcile, MissingPeriodError, ReconcileRequest};
use crate::store::{load_timetable, SqliteStore};
use chrono::Local;
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Template value from params: exactly 7 weekday rows (Monday-first) of
/// subject-id strings. Slots are trimmed; empty string means no lesson.
fn parse_template_param(v: Option<&serde_json::Value>) -> Result<Vec<Vec<String>>, String> {
    let Some(arr) = v.and_then(|v| v.as_array()) else {
        return Err("missing value".to_string());
    };
    if arr.len() != 7 {
        return Err("value must have exactly 7 weekday rows".to_string());
    }
    let mut rows = Vec::with_capacity(7);
    for row in arr {
        let slots = row
            .as_array()
            .ok_or_else(|| "value rows must be arrays of strings".to_string())?;
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let subject = slot
                .as_str()
                .ok_or_else(|| "value slots must be strings".to_string())?;
            out.push(subject.trim().to_string());
        }
        rows.push(out);
    }
    Ok(rows)
}

fn parse_bool(v: Option<&serde_json::Value>, default: bool) -> Result<bool, &'static str> {
    match v {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v.as_bool().ok_or("must be boolean"),
    }
}

fn handle_timetables_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut value = match parse_template_param(req.params.get("value")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let school_id = match classroom_school(conn, &classroom_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "classroom not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Rows cannot run past the school's shift slot count for that weekday.
    let day_slots = match state.shift_cache.day_slots(conn, &school_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for (weekday, row) in value.iter_mut().enumerate() {
        let slots = day_slots[weekday];
        if slots > 0 && row.len() > slots {
            row.truncate(slots);
        }
    }

    let existing = conn
        .query_row(
            "SELECT id FROM timetables WHERE classroom_id = ?",
            [&classroom_id],
            |r| r.get::<_, String>(0),
        )
        .optional();
    let timetable_id = match existing {
        Ok(Some(id)) => id,
        Ok(None) => Uuid::new_v4().to_string(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let raw_value = serde_json::to_string(&value).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO timetables(id, classroom_id, value, updated_at) VALUES(?, ?, ?, ?)
         ON CONFLICT(classroom_id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![timetable_id, classroom_id, raw_value, now_ts()],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // The write is what triggers reconciliation, in the background.
    let queued = match &state.queue {
        Some(queue) => {
            queue.enqueue(&classroom_id);
            true
        }
        None => false,
    };
    ok(&req.id, json!({ "timetableId": timetable_id, "queued": queued }))
}

fn handle_timetables_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_timetable(conn, &classroom_id) {
        Ok(Some(timetable)) => ok(
            &req.id,
            json!({
                "timetableId": timetable.id,
                "classroomId": timetable.classroom_id,
                "schoolId": timetable.school_id,
                "value": timetable.value,
            }),
        ),
        Ok(None) => err(&req.id, "not_found", "timetable not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Synchronous reconciliation entry used by maintenance tooling and tests.
/// `asOf` overrides "today" so a re-sync can be anchored to a reference date.
fn handle_timetables_sync(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current_week_only = match parse_bool(req.params.get("isCurrentWeekOnly"), true) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("isCurrentWeekOnly {}", m), None),
    };
    let disable_logging = match parse_bool(req.params.get("disableLogging"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("disableLogging {}", m), None),
    };
    let as_of = match req.params.get("asOf").and_then(|v| v.as_str()) {
        Some(raw) => match parse_iso_date(raw) {
            Some(d) => d,
            None => return err(&req.id, "bad_params", "asOf must be YYYY-MM-DD", None),
        },
        None => Local::now().date_naive(),
    };

    let timetable = match load_timetable(conn, &classroom_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "timetable not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let store = SqliteStore::new(conn);
    let audit = SqliteAudit::new(conn);
    let outcome = reconcile(
        &store,
        &audit,
        &ReconcileRequest {
            timetable: &timetable,
            template: &timetable.value,
            current_week_only,
            disable_logging,
            as_of,
        },
    );
    match outcome {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "periodId": outcome.period_id,
                "created": outcome.created,
                "updated": outcome.updated,
                "deleted": outcome.deleted,
            }),
        ),
        Err(e) => {
            if e.downcast_ref::<MissingPeriodError>().is_some() {
                err(&req.id, "period_required", e.to_string(), None)
            } else {
                err(&req.id, "sync_failed", format!("{e:?}"), None)
            }
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetables.upsert" => Some(handle_timetables_upsert(state, req)),
        "timetables.open" => Some(handle_timetables_open(state, req)),
        "timetables.sync" => Some(handle_timetables_sync(state, req)),
        _ => None,
    }
}
