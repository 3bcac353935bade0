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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

fn save_params(name: &str, roll: &str, english: f64, math: f64) -> serde_json::Value {
    json!({
        "name": name,
        "rollNumber": roll,
        "dob": "2013-04-04",
        "class": "9",
        "section": "A",
        "examTerm": "Final",
        "fullMarks": 100.0,
        "rankPolicy": { "excludeFailing": true, "passThreshold": 33.0 },
        "subjects": [
            { "name": "English", "marks": english },
            { "name": "Math", "marks": math },
        ],
    })
}

#[test]
fn failing_students_get_rank_zero_under_exclusion_policy() {
    let workspace = temp_dir("schoold-fail-exclusion");
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
        save_params("Nisha", "1", 90.0, 85.0),
    );
    // Priya fails Math (20 < 33) even though her percent beats Omar's.
    let failing = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.save",
        save_params("Priya", "2", 95.0, 20.0),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.save",
        save_params("Omar", "3", 50.0, 45.0),
    );

    let record = failing.get("record").expect("record");
    assert_eq!(record.get("passFail").and_then(|v| v.as_str()), Some("Fail"));
    assert_eq!(
        record.get("failedSubjects").and_then(|v| v.as_i64()),
        Some(1)
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.list",
        json!({ "class": "9", "section": "A", "examTerm": "Final" }),
    );
    let results = listed
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("results");
    let rank_of = |name: &str| {
        results
            .iter()
            .find(|r| r.get("name").and_then(|v| v.as_str()) == Some(name))
            .and_then(|r| r.get("rank"))
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| panic!("no rank for {}", name))
    };
    assert_eq!(rank_of("Nisha"), 1);
    assert_eq!(rank_of("Omar"), 2);
    assert_eq!(rank_of("Priya"), 0);

    // Listing puts ranked members first and rank-0 members at the end.
    let listed_names: Vec<&str> = results
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(listed_names, vec!["Nisha", "Omar", "Priya"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn default_policy_ranks_failing_students_by_percent() {
    let workspace = temp_dir("schoold-fail-default");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut params = save_params("Qadir", "1", 95.0, 20.0);
    params.as_object_mut().unwrap().remove("rankPolicy");
    let saved = request_ok(&mut stdin, &mut reader, "2", "results.save", params);
    let record = saved.get("record").expect("record");
    // Still marked as failing, but ranked with everyone else.
    assert_eq!(record.get("passFail").and_then(|v| v.as_str()), Some("Fail"));
    assert_eq!(record.get("rank").and_then(|v| v.as_i64()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
