use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// Sends a request and unwraps `result`, failing the test on any error.
pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

/// Workspace + school + classroom + a two-quarter 2024 period, the common
/// fixture for reconciliation tests. Returns (schoolId, classroomId, periodId).
pub fn setup_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        stdin,
        reader,
        "setup-2",
        "schools.create",
        json!({ "name": "School 21" }),
    );
    let school_id = school
        .get("schoolId")
        .and_then(|v| v.as_str())
        .expect("schoolId")
        .to_string();
    let classroom = request_ok(
        stdin,
        reader,
        "setup-3",
        "classrooms.create",
        json!({ "schoolId": school_id, "name": "5-A" }),
    );
    let classroom_id = classroom
        .get("classroomId")
        .and_then(|v| v.as_str())
        .expect("classroomId")
        .to_string();
    let period = request_ok(
        stdin,
        reader,
        "setup-4",
        "periods.upsert",
        json!({
            "schoolId": school_id,
            "name": "2024-25 Term 1",
            "value": [["2024-09-01", "2024-10-22"], ["2024-10-31", "2024-12-29"]]
        }),
    );
    let period_id = period
        .get("periodId")
        .and_then(|v| v.as_str())
        .expect("periodId")
        .to_string();
    (school_id, classroom_id, period_id)
}

/// 7x6 template with only Monday's second slot filled.
pub fn monday_math_template() -> serde_json::Value {
    let mut rows = vec![vec!["".to_string(); 6]; 7];
    rows[0][1] = "math".to_string();
    json!(rows)
}
