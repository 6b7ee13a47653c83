use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn school_exists(conn: &Connection, school_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM schools WHERE id = ? LIMIT 1",
        [school_id],
        |_r| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
}

pub fn classroom_school(conn: &Connection, classroom_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT school_id FROM classrooms WHERE id = ?",
        [classroom_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
}

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)",
        params![school_id, name],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schoolId": school_id }))
}

fn handle_schools_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM schools ORDER BY name, id") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let schools = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "schools": schools }))
}

fn handle_classrooms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match school_exists(conn, &school_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "school not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let classroom_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classrooms(id, school_id, name) VALUES(?, ?, ?)",
        params![classroom_id, school_id, name],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "classroomId": classroom_id }))
}

fn handle_classrooms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn
        .prepare("SELECT id, name FROM classrooms WHERE school_id = ? ORDER BY name, id")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classrooms = match stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "classrooms": classrooms }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.create" => Some(handle_schools_create(state, req)),
        "schools.list" => Some(handle_schools_list(state, req)),
        "classrooms.create" => Some(handle_classrooms_create(state, req)),
        "classrooms.list" => Some(handle_classrooms_list(state, req)),
        _ => None,
    }
}
