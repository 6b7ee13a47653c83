use crate::calendar::{parse_iso_date, resolve_key};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schools::{db_conn, required_str, school_exists};
use crate::ipc::types::{AppState, Request};
use crate::store::{parse_period_value, period_value_string};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Period value from params: an array of [start, end] string pairs. Dates
/// are not validated here; the resolver tolerates malformed pairs, matching
/// how legacy data behaves.
fn parse_value_param(v: Option<&serde_json::Value>) -> Result<Vec<(String, String)>, String> {
    let Some(raw) = v else {
        return Err("missing value".to_string());
    };
    let arr = raw
        .as_array()
        .ok_or_else(|| "value must be an array of [start, end] pairs".to_string())?;
    let mut pairs = Vec::with_capacity(arr.len());
    for entry in arr {
        let pair = entry
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| "value entries must be [start, end] pairs".to_string())?;
        let start = pair[0]
            .as_str()
            .ok_or_else(|| "value dates must be strings".to_string())?;
        let end = pair[1]
            .as_str()
            .ok_or_else(|| "value dates must be strings".to_string())?;
        pairs.push((start.trim().to_string(), end.trim().to_string()));
    }
    if pairs.is_empty() {
        return Err("value must contain at least one sub-period".to_string());
    }
    Ok(pairs)
}

fn handle_periods_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let pairs = match parse_value_param(req.params.get("value")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    match school_exists(conn, &school_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "school not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let value = period_value_string(&pairs);
    let period_id = req
        .params
        .get("periodId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    match period_id {
        Some(period_id) => {
            let updated = conn.execute(
                "UPDATE periods SET name = ?, value = ? WHERE id = ? AND school_id = ?",
                params![name, value, period_id, school_id],
            );
            match updated {
                Ok(0) => err(&req.id, "not_found", "period not found", None),
                Ok(_) => ok(&req.id, json!({ "periodId": period_id })),
                Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
            }
        }
        None => {
            let period_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO periods(id, school_id, name, value) VALUES(?, ?, ?, ?)",
                params![period_id, school_id, name, value],
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            ok(&req.id, json!({ "periodId": period_id }))
        }
    }
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn
        .prepare("SELECT id, name, value FROM periods WHERE school_id = ? ORDER BY rowid")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let periods = match stmt
        .query_map([&school_id], |r| {
            let raw_value: String = r.get(2)?;
            let pairs = parse_period_value(&raw_value);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "value": pairs.iter().map(|(a, b)| vec![a, b]).collect::<Vec<_>>(),
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "periods": periods }))
}

fn handle_periods_resolve_key(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw_date = match required_str(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(date) = parse_iso_date(&raw_date) else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let raw_value = match conn
        .query_row(
            "SELECT value FROM periods WHERE id = ?",
            [&period_id],
            |r| r.get::<_, String>(0),
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "period not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let key = resolve_key(&parse_period_value(&raw_value), date);
    ok(&req.id, json!({ "key": key }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "periods.upsert" => Some(handle_periods_upsert(state, req)),
        "periods.list" => Some(handle_periods_list(state, req)),
        "periods.resolveKey" => Some(handle_periods_resolve_key(state, req)),
        _ => None,
    }
}
