use chrono::Datelike;
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

/// Mirror of the September cutover used for the school-year default.
fn current_academic_year() -> String {
    let today = chrono::Utc::now().date_naive();
    let y = today.year();
    if today.month() >= 9 {
        format!("{}-{}", y, y + 1)
    } else {
        format!("{}-{}", y - 1, y)
    }
}

#[test]
fn fresh_workspace_starts_with_defaults() {
    let workspace = temp_dir("admissiond-setup-defaults");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));

    assert_eq!(setup.pointer("/school/name").and_then(|v| v.as_str()), Some(""));
    assert_eq!(
        setup
            .pointer("/school/academicYear")
            .and_then(|v| v.as_str()),
        Some(current_academic_year().as_str())
    );
    assert_eq!(
        setup
            .pointer("/admissions/defaultRegistrationFee")
            .and_then(|v| v.as_f64()),
        Some(50000.0)
    );
    assert_eq!(
        setup
            .pointer("/admissions/defaultTuitionFee")
            .and_then(|v| v.as_f64()),
        Some(150000.0)
    );
    assert_eq!(
        setup
            .pointer("/admissions/requireReviewBeforeDecision")
            .and_then(|v| v.as_bool()),
        Some(false)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn setup_updates_merge_and_persist() {
    let workspace = temp_dir("admissiond-setup-update");
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
        "setup.update",
        json!({
            "section": "school",
            "values": { "name": "College Saint-Joseph", "academicYear": "2027-2028" },
            "actor": actor("Direction", &["school.manage"])
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "admissions",
            "values": { "defaultRegistrationFee": 60000.0 },
            "actor": actor("Direction", &["school.manage"])
        }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(
        setup.pointer("/school/name").and_then(|v| v.as_str()),
        Some("College Saint-Joseph")
    );
    assert_eq!(
        setup
            .pointer("/school/academicYear")
            .and_then(|v| v.as_str()),
        Some("2027-2028")
    );
    // The patch only named one fee; the other keeps its default.
    assert_eq!(
        setup
            .pointer("/admissions/defaultRegistrationFee")
            .and_then(|v| v.as_f64()),
        Some(60000.0)
    );
    assert_eq!(
        setup
            .pointer("/admissions/defaultTuitionFee")
            .and_then(|v| v.as_f64()),
        Some(150000.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn setup_update_validates_fields_and_permissions() {
    let workspace = temp_dir("admissiond-setup-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let unknown_key = request(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({
            "section": "school",
            "values": { "motto": "Travail et discipline" },
            "actor": actor("Direction", &["school.manage"])
        }),
    );
    assert_eq!(error_code(&unknown_key), Some("bad_params"));

    let skipped_year = request(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "school",
            "values": { "academicYear": "2025-2027" },
            "actor": actor("Direction", &["school.manage"])
        }),
    );
    assert_eq!(error_code(&skipped_year), Some("bad_params"));

    let negative_fee = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({
            "section": "admissions",
            "values": { "defaultTuitionFee": -200.0 },
            "actor": actor("Direction", &["school.manage"])
        }),
    );
    assert_eq!(error_code(&negative_fee), Some("bad_params"));

    let unknown_section = request(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({
            "section": "finance",
            "values": {},
            "actor": actor("Direction", &["school.manage"])
        }),
    );
    assert_eq!(error_code(&unknown_section), Some("bad_params"));

    let no_actor = request(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({
            "section": "school",
            "values": { "name": "Athenee Royal" }
        }),
    );
    assert_eq!(error_code(&no_actor), Some("forbidden"));

    let wrong_permission = request(
        &mut stdin,
        &mut reader,
        "7",
        "setup.update",
        json!({
            "section": "school",
            "values": { "name": "Athenee Royal" },
            "actor": actor("Odia", &["admissions.intake"])
        }),
    );
    assert_eq!(error_code(&wrong_permission), Some("forbidden"));

    // Every rejected patch above left the section untouched.
    let setup = request_ok(&mut stdin, &mut reader, "8", "setup.get", json!({}));
    assert_eq!(setup.pointer("/school/name").and_then(|v| v.as_str()), Some(""));
    assert_eq!(
        setup
            .pointer("/admissions/defaultTuitionFee")
            .and_then(|v| v.as_f64()),
        Some(150000.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn intake_defaults_to_the_configured_academic_year() {
    let workspace = temp_dir("admissiond-setup-intake-year");
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
        "setup.update",
        json!({
            "section": "school",
            "values": { "academicYear": "2027-2028" },
            "actor": actor("Direction", &["school.manage"])
        }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "6e C", "actor": actor("Direction", &["school.manage"]) }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    // No academicYear in the request: the configured one is used.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "admissions.create",
        json!({
            "lastName": "Mwanza",
            "firstName": "Gloria",
            "sex": "F",
            "birthDate": "2014-02-27",
            "requestedClassId": class_id,
            "actor": actor("Odia", &["admissions.intake"])
        }),
    );
    let candidature = created
        .get("candidatureId")
        .and_then(|v| v.as_str())
        .expect("candidatureId");

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "admissions.open",
        json!({ "candidatureId": candidature }),
    );
    assert_eq!(
        opened
            .pointer("/candidature/academicYear")
            .and_then(|v| v.as_str()),
        Some("2027-2028")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
