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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn save_params(name: &str, roll: &str, class: &str, section: &str) -> serde_json::Value {
    json!({
        "name": name,
        "rollNumber": roll,
        "dob": "2014-05-05",
        "class": class,
        "section": section,
        "examTerm": "Term 1",
        "fullMarks": 100.0,
        "subjects": [{ "name": "English", "marks": 60.0 }],
    })
}

#[test]
fn teachers_are_confined_to_their_own_class_and_section() {
    let workspace = temp_dir("schoold-teacher-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.save",
        save_params("Asha", "1", "5", "A"),
    );
    let own_id = own
        .get("record")
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("own id")
        .to_string();
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.save",
        save_params("Bipin", "1", "6", "B"),
    );
    let other_id = other
        .get("record")
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("other id")
        .to_string();

    // Saving outside the teacher's own class is refused up front.
    let mut cross_save = save_params("Chirag", "2", "6", "B");
    for (k, v) in [
        ("role", json!("teacher")),
        ("teacherClass", json!("5")),
        ("teacherSection", json!("A")),
    ] {
        cross_save.as_object_mut().unwrap().insert(k.into(), v);
    }
    let refused = request(&mut stdin, &mut reader, "4", "results.save", cross_save);
    assert_eq!(error_code(&refused), Some("unauthorized"));

    let cross_get = request(
        &mut stdin,
        &mut reader,
        "5",
        "results.get",
        json!({
            "id": other_id,
            "role": "teacher", "teacherClass": "5", "teacherSection": "A"
        }),
    );
    assert_eq!(error_code(&cross_get), Some("unauthorized"));

    let cross_delete = request(
        &mut stdin,
        &mut reader,
        "6",
        "results.delete",
        json!({
            "id": other_id,
            "role": "teacher", "teacherClass": "5", "teacherSection": "A"
        }),
    );
    assert_eq!(error_code(&cross_delete), Some("unauthorized"));

    // Listing as a teacher is forced onto their class regardless of filters.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.list",
        json!({
            "class": "6", "section": "B",
            "role": "teacher", "teacherClass": "5", "teacherSection": "A"
        }),
    );
    let results = listed
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].get("id").and_then(|v| v.as_str()),
        Some(own_id.as_str())
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.get",
        json!({
            "id": own_id,
            "role": "teacher", "teacherClass": "5", "teacherSection": "A"
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
