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
    let exe = env!("CARGO_BIN_EXE_admissiond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn admissiond");
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
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value.pointer("/error/code").and_then(|v| v.as_str())
}

fn actor(name: &str, permissions: &[&str]) -> serde_json::Value {
    json!({ "name": name, "permissions": permissions })
}

fn seed_candidature(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    last_name: &str,
    first_name: &str,
    birth_date: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "admissions.create",
        json!({
            "lastName": last_name,
            "firstName": first_name,
            "sex": "M",
            "birthDate": birth_date,
            "requestedClassId": class_id,
            "academicYear": "2026-2027",
            "actor": actor("Odia", &["admissions.intake"])
        }),
    );
    created
        .get("candidatureId")
        .and_then(|v| v.as_str())
        .expect("candidatureId")
        .to_string()
}

#[test]
fn evaluation_rejects_out_of_range_scores_and_bad_recommendations() {
    let workspace = temp_dir("admissiond-eval-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "7e B", "actor": actor("Direction", &["school.manage"]) }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let candidature = seed_candidature(
        &mut stdin,
        &mut reader,
        "3",
        &class_id,
        "Kazadi",
        "Moise",
        "2014-05-12",
    );

    let cases = [
        ("4", json!({ "score": 21.0, "recommendation": "accept" })),
        ("5", json!({ "score": -0.5, "recommendation": "accept" })),
        ("6", json!({ "score": 14.0, "recommendation": "maybe" })),
    ];
    for (id, mut params) in cases {
        params["candidatureId"] = json!(candidature);
        params["actor"] = actor("Mukendi", &["admissions.evaluate"]);
        let resp = request(&mut stdin, &mut reader, id, "admissions.evaluate", params);
        assert_eq!(error_code(&resp), Some("bad_params"), "case {}", id);
    }

    let unknown = request(
        &mut stdin,
        &mut reader,
        "7",
        "admissions.evaluate",
        json!({
            "candidatureId": "no-such-id",
            "score": 14.0,
            "recommendation": "accept",
            "actor": actor("Mukendi", &["admissions.evaluate"])
        }),
    );
    assert_eq!(error_code(&unknown), Some("not_found"));

    // None of the rejected calls left an evaluation behind.
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "admissions.open",
        json!({ "candidatureId": candidature }),
    );
    assert!(opened
        .pointer("/candidature/evaluation/score")
        .map(|v| v.is_null())
        .unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn re_evaluation_replaces_the_previous_verdict() {
    let workspace = temp_dir("admissiond-eval-replace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "5e C", "actor": actor("Direction", &["school.manage"]) }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let candidature = seed_candidature(
        &mut stdin,
        &mut reader,
        "3",
        &class_id,
        "Mbala",
        "Tresor",
        "2014-08-21",
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "admissions.evaluate",
        json!({
            "candidatureId": candidature,
            "score": 9.0,
            "recommendation": "refuse",
            "comment": "dossier faible",
            "actor": actor("Kazadi", &["admissions.evaluate"])
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "admissions.evaluate",
        json!({
            "candidatureId": candidature,
            "score": 16.0,
            "recommendation": "accept",
            "actor": actor("Mbala", &["admissions.evaluate"])
        }),
    );

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "admissions.open",
        json!({ "candidatureId": candidature }),
    );
    let evaluation = opened
        .pointer("/candidature/evaluation")
        .cloned()
        .expect("evaluation block");
    assert_eq!(evaluation.get("score").and_then(|v| v.as_f64()), Some(16.0));
    assert_eq!(
        evaluation.get("recommendation").and_then(|v| v.as_str()),
        Some("accept")
    );
    assert_eq!(
        evaluation.get("evaluatedBy").and_then(|v| v.as_str()),
        Some("Mbala")
    );
    // The second evaluator gave no comment, so the old one is gone too.
    assert!(evaluation
        .get("comment")
        .map(|v| v.is_null())
        .unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn begin_review_only_moves_pending_candidatures() {
    let workspace = temp_dir("admissiond-eval-review");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "8e A", "actor": actor("Direction", &["school.manage"]) }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let candidature = seed_candidature(
        &mut stdin,
        &mut reader,
        "3",
        &class_id,
        "Lukusa",
        "Blaise",
        "2012-12-01",
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "admissions.beginReview",
        json!({
            "candidatureId": candidature,
            "actor": actor("Mukendi", &["admissions.evaluate"])
        }),
    );
    assert_eq!(
        first.get("status").and_then(|v| v.as_str()),
        Some("in_review")
    );

    // Already in review: the transition is not repeatable.
    let second = request(
        &mut stdin,
        &mut reader,
        "5",
        "admissions.beginReview",
        json!({
            "candidatureId": candidature,
            "actor": actor("Mukendi", &["admissions.evaluate"])
        }),
    );
    assert_eq!(error_code(&second), Some("terminal_status"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_recommend_stamps_ids_without_touching_scores() {
    let workspace = temp_dir("admissiond-eval-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "4e B", "actor": actor("Direction", &["school.manage"]) }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let scored = seed_candidature(
        &mut stdin,
        &mut reader,
        "3",
        &class_id,
        "Kalonji",
        "Serge",
        "2013-06-17",
    );
    let unscored = seed_candidature(
        &mut stdin,
        &mut reader,
        "4",
        &class_id,
        "Tshibangu",
        "Olivier",
        "2013-10-29",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "admissions.evaluate",
        json!({
            "candidatureId": scored,
            "score": 12.0,
            "recommendation": "wait",
            "actor": actor("Kazadi", &["admissions.evaluate"])
        }),
    );

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "admissions.bulkRecommend",
        json!({
            "candidatureIds": [scored, unscored, "ghost-id"],
            "recommendation": "accept",
            "actor": actor("Jury", &["admissions.evaluate"])
        }),
    );
    assert_eq!(bulk.get("updated").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(bulk.get("skipped").and_then(|v| v.as_u64()), Some(1));
    let errors = bulk
        .get("errors")
        .and_then(|v| v.as_array())
        .expect("errors array");
    assert_eq!(
        errors[0].get("code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    // The earlier score survives; only recommendation and stamp moved.
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "admissions.open",
        json!({ "candidatureId": scored }),
    );
    let evaluation = opened
        .pointer("/candidature/evaluation")
        .cloned()
        .expect("evaluation block");
    assert_eq!(evaluation.get("score").and_then(|v| v.as_f64()), Some(12.0));
    assert_eq!(
        evaluation.get("recommendation").and_then(|v| v.as_str()),
        Some("accept")
    );
    assert_eq!(
        evaluation.get("evaluatedBy").and_then(|v| v.as_str()),
        Some("Jury")
    );

    // The unscored one got the stamp but still has no score.
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "admissions.open",
        json!({ "candidatureId": unscored }),
    );
    assert!(opened
        .pointer("/candidature/evaluation/score")
        .map(|v| v.is_null())
        .unwrap_or(false));
    assert_eq!(
        opened
            .pointer("/candidature/evaluation/recommendation")
            .and_then(|v| v.as_str()),
        Some("accept")
    );

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "admissions.bulkRecommend",
        json!({
            "candidatureIds": [],
            "recommendation": "wait",
            "actor": actor("Jury", &["admissions.evaluate"])
        }),
    );
    assert_eq!(empty.get("updated").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(empty.get("skipped").and_then(|v| v.as_u64()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
