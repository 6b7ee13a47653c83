use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schools::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, types::Value, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_lessons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let from = req
        .params
        .get("from")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let to = req
        .params
        .get("to")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let mut sql = String::from(
        "SELECT id, subject_id, date, hour, period_id, period_key
         FROM lessons WHERE classroom_id = ?",
    );
    let mut values: Vec<Value> = vec![Value::Text(classroom_id)];
    if let Some(from) = from {
        sql.push_str(" AND date >= ?");
        values.push(Value::Text(from));
    }
    if let Some(to) = to {
        sql.push_str(" AND date <= ?");
        values.push(Value::Text(to));
    }
    sql.push_str(" ORDER BY date, hour, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let lessons = match stmt
        .query_map(rusqlite::params_from_iter(values), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "hour": r.get::<_, Option<i64>>(3)?,
                "periodId": r.get::<_, String>(4)?,
                "periodKey": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "lessons": lessons }))
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_name = match required_str(req, "studentName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(value) = req.params.get("value").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "value must be an integer", None);
    };
    let lesson_exists = conn
        .query_row(
            "SELECT 1 FROM lessons WHERE id = ? LIMIT 1",
            [&lesson_id],
            |_r| Ok(()),
        )
        .optional();
    match lesson_exists {
        Ok(Some(())) => {}
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO lesson_grades(id, lesson_id, student_name, value) VALUES(?, ?, ?, ?)",
        params![grade_id, lesson_id, student_name, value],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": grade_id }))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, student_name, value FROM lesson_grades WHERE lesson_id = ? ORDER BY rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grades = match stmt
        .query_map([&lesson_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentName": r.get::<_, String>(1)?,
                "value": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "grades": grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lessons.list" => Some(handle_lessons_list(state, req)),
        "lessons.grades.upsert" => Some(handle_grades_upsert(state, req)),
        "lessons.grades.list" => Some(handle_grades_list(state, req)),
        _ => None,
    }
}
