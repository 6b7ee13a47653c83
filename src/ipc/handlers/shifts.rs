use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schools::{db_conn, required_str, school_exists};
use crate::ipc::types::{AppState, Request};
use crate::store::in_transaction;
use rusqlite::params;
use serde_json::json;

struct ShiftEntry {
    weekday: i64,
    hour: i64,
    starts_at: String,
    ends_at: String,
}

fn parse_entries(v: Option<&serde_json::Value>) -> Result<Vec<ShiftEntry>, String> {
    let Some(arr) = v.and_then(|v| v.as_array()) else {
        return Err("missing entries".to_string());
    };
    let mut out = Vec::with_capacity(arr.len());
    for entry in arr {
        let weekday = entry
            .get("weekday")
            .and_then(|v| v.as_i64())
            .filter(|w| (0..7).contains(w))
            .ok_or_else(|| "entries[].weekday must be 0..6 (Monday-first)".to_string())?;
        let hour = entry
            .get("hour")
            .and_then(|v| v.as_i64())
            .filter(|h| *h >= 0)
            .ok_or_else(|| "entries[].hour must be >= 0".to_string())?;
        let starts_at = entry
            .get("startsAt")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "entries[].startsAt is required".to_string())?;
        let ends_at = entry
            .get("endsAt")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "entries[].endsAt is required".to_string())?;
        out.push(ShiftEntry {
            weekday,
            hour,
            starts_at,
            ends_at,
        });
    }
    Ok(out)
}

/// Replaces a school's whole shift table and drops its cached slot counts.
fn handle_shifts_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entries = match parse_entries(req.params.get("entries")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match school_exists(conn, &school_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "school not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Delete and re-insert atomically so a failed insert cannot leave the
    // school's shift table half replaced.
    let replaced = in_transaction(conn, || {
        conn.execute("DELETE FROM shifts WHERE school_id = ?", [&school_id])?;
        for entry in &entries {
            conn.execute(
                "INSERT OR REPLACE INTO shifts(school_id, weekday, hour, starts_at, ends_at)
                 VALUES(?, ?, ?, ?, ?)",
                params![
                    school_id,
                    entry.weekday,
                    entry.hour,
                    entry.starts_at,
                    entry.ends_at
                ],
            )?;
        }
        Ok(())
    });
    if let Err(e) = replaced {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    state.shift_cache.invalidate(&school_id);
    ok(&req.id, json!({ "count": entries.len() }))
}

fn handle_shifts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT weekday, hour, starts_at, ends_at FROM shifts
         WHERE school_id = ? ORDER BY weekday, hour",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let entries = match stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "weekday": r.get::<_, i64>(0)?,
                "hour": r.get::<_, i64>(1)?,
                "startsAt": r.get::<_, String>(2)?,
                "endsAt": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "shifts.upsert" => Some(handle_shifts_upsert(state, req)),
        "shifts.list" => Some(handle_shifts_list(state, req)),
        _ => None,
    }
}
