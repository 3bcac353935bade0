use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
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
        "expected ok for {}: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn save_params(name: &str, roll: &str, marks: f64) -> serde_json::Value {
    json!({
        "name": name,
        "rollNumber": roll,
        "dob": "2014-06-15",
        "class": "7",
        "section": "C",
        "examTerm": "Annual",
        "fullMarks": 100.0,
        "subjects": [
            { "name": "English", "marks": marks },
            { "name": "Math", "marks": marks },
        ],
    })
}

#[test]
fn deleting_a_record_closes_the_rank_gap() {
    let workspace = temp_dir("schoold-delete-rerank");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.save",
        save_params("Gauri", "1", 90.0),
    );
    let middle = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.save",
        save_params("Harsh", "2", 80.0),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.save",
        save_params("Isha", "3", 70.0),
    );

    let middle_id = middle
        .get("record")
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("middle id")
        .to_string();

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.delete",
        json!({ "id": middle_id }),
    );
    assert_eq!(
        deleted
            .get("deleted")
            .and_then(|r| r.get("name"))
            .and_then(|v| v.as_str()),
        Some("Harsh")
    );
    // Isha moves from rank 3 to 2; Gauri stays 1 and is not rewritten.
    let written = deleted
        .get("written")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("written ids");
    assert_eq!(written.len(), 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.list",
        json!({ "class": "7", "section": "C", "examTerm": "Annual" }),
    );
    let results = listed
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0].get("name").and_then(|v| v.as_str()),
        Some("Gauri")
    );
    assert_eq!(results[0].get("rank").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(results[1].get("name").and_then(|v| v.as_str()), Some("Isha"));
    assert_eq!(results[1].get("rank").and_then(|v| v.as_i64()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_an_unknown_id_reports_not_found() {
    let workspace = temp_dir("schoold-delete-missing");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "results.delete",
        json!({ "id": "no-such-record" }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
