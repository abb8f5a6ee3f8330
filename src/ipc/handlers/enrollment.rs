use crate::access::{Actor, PERM_ENROLL};
use crate::admission::{self, CandidatureStatus};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

struct EnrollTerms {
    registration_fee: f64,
    tuition_fee: f64,
    discount_pct: f64,
    enrollment_date: NaiveDate,
}

/// Everything here is rejected before the transaction starts; a bad fee or
/// date must never cost a matricule.
fn parse_terms(params: &serde_json::Value) -> Result<EnrollTerms, HandlerErr> {
    let registration_fee = get_required_f64(params, "registrationFee")?;
    let tuition_fee = get_required_f64(params, "tuitionFee")?;
    let discount_pct = params
        .get("discountPct")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    admission::validate_fee(registration_fee, "registrationFee").map_err(|msg| HandlerErr {
        code: "bad_params",
        message: msg,
        details: None,
    })?;
    admission::validate_fee(tuition_fee, "tuitionFee").map_err(|msg| HandlerErr {
        code: "bad_params",
        message: msg,
        details: None,
    })?;
    admission::validate_discount_pct(discount_pct).map_err(|msg| HandlerErr {
        code: "bad_params",
        message: msg,
        details: None,
    })?;

    let enrollment_date = match params.get("enrollmentDate").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| HandlerErr {
            code: "bad_params",
            message: "enrollmentDate must be YYYY-MM-DD".to_string(),
            details: None,
        })?,
        None => Utc::now().date_naive(),
    };

    Ok(EnrollTerms {
        registration_fee,
        tuition_fee,
        discount_pct,
        enrollment_date,
    })
}

struct CandidatureIdentity {
    status: String,
    last_name: String,
    post_name: String,
    first_name: String,
    sex: String,
    birth_place: Option<String>,
    birth_date: String,
    guardian_name: Option<String>,
    guardian_phone: Option<String>,
    address: Option<String>,
    requested_class_id: String,
    academic_year: String,
}

/// One candidature becomes one student plus one fee record, atomically. The
/// matricule counter bump lives inside the same transaction, so a failed
/// enrollment never burns a number.
fn enroll_candidature(
    conn: &Connection,
    candidature_id: &str,
    class_override: Option<&str>,
    terms: &EnrollTerms,
) -> Result<serde_json::Value, HandlerErr> {
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let row = tx
        .query_row(
            "SELECT status, last_name, post_name, first_name, sex, birth_place,
                    birth_date, guardian_name, guardian_phone, address,
                    requested_class_id, academic_year
             FROM candidatures WHERE id = ?",
            [candidature_id],
            |r| {
                Ok(CandidatureIdentity {
                    status: r.get(0)?,
                    last_name: r.get(1)?,
                    post_name: r.get(2)?,
                    first_name: r.get(3)?,
                    sex: r.get(4)?,
                    birth_place: r.get(5)?,
                    birth_date: r.get(6)?,
                    guardian_name: r.get(7)?,
                    guardian_phone: r.get(8)?,
                    address: r.get(9)?,
                    requested_class_id: r.get(10)?,
                    academic_year: r.get(11)?,
                })
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(candidature) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    };
    if CandidatureStatus::parse(&candidature.status) != Some(CandidatureStatus::Accepted) {
        return Err(HandlerErr {
            code: "not_accepted",
            message: format!(
                "candidature status is '{}', must be 'accepted'",
                candidature.status
            ),
            details: None,
        });
    }

    let class_id = class_override.unwrap_or(&candidature.requested_class_id);
    let class_found = tx
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !class_found {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: Some(json!({ "classId": class_id })),
        });
    }

    // Weak de-duplication on (last name, first name, birth date). Post-noms
    // are deliberately left out of the key, so twins sharing the rest of the
    // identity still collide.
    let duplicate = tx
        .query_row(
            "SELECT 1 FROM students
             WHERE last_name = ? AND first_name = ? AND birth_date = ?",
            (
                &candidature.last_name,
                &candidature.first_name,
                &candidature.birth_date,
            ),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if duplicate {
        return Err(HandlerErr {
            code: "student_exists",
            message: "a student with the same name and birth date already exists".to_string(),
            details: Some(json!({
                "lastName": candidature.last_name,
                "firstName": candidature.first_name,
                "birthDate": candidature.birth_date
            })),
        });
    }

    let year = terms.enrollment_date.year();
    let matricule = db::allocate_matricule(&tx, year).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "counters" })),
    })?;

    let student_id = Uuid::new_v4().to_string();
    let enrolled_at = format!("{}T00:00:00Z", terms.enrollment_date);
    tx.execute(
        "INSERT INTO students(
            id, matricule, last_name, post_name, first_name, sex,
            birth_place, birth_date, guardian_name, guardian_phone, address,
            class_id, academic_year, status, enrolled_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        rusqlite::params![
            &student_id,
            &matricule,
            &candidature.last_name,
            &candidature.post_name,
            &candidature.first_name,
            &candidature.sex,
            &candidature.birth_place,
            &candidature.birth_date,
            &candidature.guardian_name,
            &candidature.guardian_phone,
            &candidature.address,
            class_id,
            &candidature.academic_year,
            &enrolled_at,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    let total = admission::fee_total(
        terms.registration_fee,
        terms.tuition_fee,
        terms.discount_pct,
    );
    let fee_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO student_fees(
            id, student_id, academic_year, registration_fee, tuition_fee,
            discount_pct, total, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &fee_id,
            &student_id,
            &candidature.academic_year,
            terms.registration_fee,
            terms.tuition_fee,
            terms.discount_pct,
            total,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "student_fees" })),
    })?;

    // Fee terms are copied back so the candidature row reads as a complete
    // record of what was agreed.
    tx.execute(
        "UPDATE candidatures SET
            status = ?,
            enrolled_student_id = ?,
            registration_fee = ?,
            tuition_fee = ?,
            discount_pct = ?
         WHERE id = ?",
        rusqlite::params![
            CandidatureStatus::Enrolled.as_str(),
            &student_id,
            terms.registration_fee,
            terms.tuition_fee,
            terms.discount_pct,
            candidature_id,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "candidatures" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    info!(candidature = %candidature_id, matricule = %matricule, "candidature enrolled");
    Ok(json!({
        "studentId": student_id,
        "matricule": matricule,
        "feeTotal": total
    }))
}

fn handle_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(msg) = Actor::require(&req.params, PERM_ENROLL) {
        return err(&req.id, "forbidden", msg, None);
    }

    let candidature_id = match get_required_str(&req.params, "candidatureId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let terms = match parse_terms(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_override = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match enroll_candidature(conn, &candidature_id, class_override.as_deref(), &terms) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_bulk_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(msg) = Actor::require(&req.params, PERM_ENROLL) {
        return err(&req.id, "forbidden", msg, None);
    }

    let Some(ids_json) = req.params.get("candidatureIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing candidatureIds", None);
    };
    let candidature_ids: Vec<String> = ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    // One set of terms is shared across every id in the batch.
    let terms = match parse_terms(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_override = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut enrolled: Vec<serde_json::Value> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for candidature_id in &candidature_ids {
        // Each candidature gets its own transaction so one failure never
        // rolls back its neighbours.
        match enroll_candidature(conn, candidature_id, class_override.as_deref(), &terms) {
            Ok(result) => enrolled.push(json!({
                "candidatureId": candidature_id,
                "studentId": result["studentId"],
                "matricule": result["matricule"]
            })),
            Err(e) => errors.push(json!({
                "candidatureId": candidature_id,
                "code": e.code,
                "message": e.message
            })),
        }
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "enrolled": enrolled,
            "updated": enrolled.len(),
            "rejected": errors.len(),
            "errors": errors
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admissions.enroll" => Some(handle_enroll(state, req)),
        "admissions.bulkEnroll" => Some(handle_bulk_enroll(state, req)),
        _ => None,
    }
}
