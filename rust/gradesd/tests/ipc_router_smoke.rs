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
    let exe = env!("CARGO_BIN_EXE_gradesd");
    let mut child = Command::new(exe)
        .env_remove("GRADESD_CONFIG")
        .env_remove("GRADESD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradesd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

/// Next response line, skipping unsolicited event lines.
fn read_response(reader: &mut BufReader<ChildStdout>, method: &str) -> serde_json::Value {
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        if value.get("event").is_none() {
            return value;
        }
    }
}

fn request(
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

    let value = read_response(reader, method);
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded",
        method
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

struct Seed {
    class_id: String,
    subject_id: String,
    teacher_id: String,
    students: Vec<String>,
}

/// One class of three students, one subject, one qualified teacher.
fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
    assign_teacher: bool,
) -> Seed {
    request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(stdin, reader, "seed-class", "classes.create", json!({ "name": "4e C" }));
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "name": "Mathematiques" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let teacher = request_ok(
        stdin,
        reader,
        "seed-teacher",
        "teachers.create",
        json!({ "name": "K. Yao", "subjectIds": [subject_id] }),
    );
    let teacher_id = teacher["teacher"]["id"].as_str().expect("teacher id").to_string();
    request_ok(
        stdin,
        reader,
        "seed-cs",
        "classSubjects.upsert",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "teacherId": if assign_teacher { json!(teacher_id) } else { json!(null) },
            "coefficient": 4,
        }),
    );
    let students = ["Adjoua", "Bamba", "Coulibaly"]
        .iter()
        .enumerate()
        .map(|(i, last)| {
            let r = request_ok(
                stdin,
                reader,
                &format!("seed-student-{i}"),
                "students.create",
                json!({ "classId": class_id, "firstName": "Eleve", "lastName": last }),
            );
            r["student"]["id"].as_str().expect("student id").to_string()
        })
        .collect();
    Seed {
        class_id,
        subject_id,
        teacher_id,
        students,
    }
}

fn open_params(seed: &Seed) -> serde_json::Value {
    json!({
        "classId": seed.class_id,
        "subjectId": seed.subject_id,
        "termId": "trimestre-1",
        "type": "test",
        "description": "Equations",
        "gradeDate": "2025-01-20",
        "weight": 2,
    })
}

#[test]
fn every_method_family_is_routed() {
    let workspace = temp_dir("gradesd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert_eq!(health["sessionOpen"].as_bool(), Some(false));
    assert_eq!(health["config"]["autosaveDelayMs"].as_u64(), Some(30_000));

    // Store-backed methods refuse to run without a workspace.
    for (i, method) in ["classes.list", "grades.list", "entry.open"].iter().enumerate() {
        let code = request_err_code(&mut stdin, &mut reader, &format!("nows-{i}"), method, json!({}));
        assert_eq!(code, "no_workspace", "{method}");
    }

    let seed = seed(&mut stdin, &mut reader, &workspace, true);

    let probes: Vec<(&str, serde_json::Value)> = vec![
        ("classes.list", json!({})),
        ("students.list", json!({ "classId": seed.class_id })),
        ("teachers.list", json!({ "subjectId": seed.subject_id })),
        ("classSubjects.list", json!({ "classId": seed.class_id })),
        (
            "grades.list",
            json!({ "classId": seed.class_id, "subjectId": seed.subject_id, "termId": "t1" }),
        ),
        ("grades.pendingValidations", json!({})),
        ("grades.classStatistics", json!({ "classId": seed.class_id, "termId": "t1" })),
        (
            "grades.studentAverages",
            json!({ "classId": seed.class_id, "subjectId": seed.subject_id, "termId": "t1" }),
        ),
        ("entry.open", open_params(&seed)),
        ("entry.state", json!({})),
        ("entry.teachers", json!({})),
        ("entry.save", json!({})),
        ("entry.cancel", json!({})),
        ("entry.close", json!({})),
    ];
    for (i, (method, params)) in probes.into_iter().enumerate() {
        request_ok(&mut stdin, &mut reader, &format!("probe-{i}"), method, params);
    }

    let classes = request_ok(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(classes["classes"][0]["studentCount"].as_u64(), Some(3));

    let code = request_err_code(&mut stdin, &mut reader, "3", "entry.state", json!({}));
    assert_eq!(code, "no_session");

    let code = request_err_code(&mut stdin, &mut reader, "4", "grades.list", json!({}));
    assert_eq!(code, "bad_params");

    let mut bad_weight = open_params(&seed);
    bad_weight["weight"] = json!(0);
    let code = request_err_code(&mut stdin, &mut reader, "5", "entry.open", bad_weight);
    assert_eq!(code, "bad_params");

    let mut unknown_subject = open_params(&seed);
    unknown_subject["subjectId"] = json!("nope");
    let code = request_err_code(&mut stdin, &mut reader, "6", "entry.open", unknown_subject);
    assert_eq!(code, "not_found");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "grades.history",
        json!({ "gradeId": "missing" }),
    );
    assert_eq!(code, "not_found");

    let code = request_err_code(&mut stdin, &mut reader, "8", "reports.render", json!({}));
    assert_eq!(code, "not_implemented");

    let health = request_ok(&mut stdin, &mut reader, "9", "health", json!({}));
    assert!(health["workspacePath"].is_string());

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_line_gets_bad_json() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let value = read_response(&mut reader, "bad line");
    assert_eq!(value["error"]["code"].as_str(), Some("bad_json"));

    // The sidecar keeps serving after a bad line.
    request_ok(&mut stdin, &mut reader, "1", "health", json!({}));

    drop(stdin);
    let _ = child.wait();
}
