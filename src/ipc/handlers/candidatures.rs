use crate::access::{Actor, PERM_INTAKE};
use crate::admission::{
    self, CandidatureStatus, DocumentKind, DocumentStatus, Priority,
};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use super::setup;

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

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

struct DocumentRow {
    kind: DocumentKind,
    status: DocumentStatus,
    comment: Option<String>,
    verified_by: Option<String>,
    verified_at: Option<String>,
}

fn document_rows(conn: &Connection, candidature_id: &str) -> Result<Vec<DocumentRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT kind, status, comment, verified_by, verified_at
             FROM candidature_documents
             WHERE candidature_id = ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let raw = stmt
        .query_map([candidature_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(raw
        .into_iter()
        .filter_map(|(kind, status, comment, verified_by, verified_at)| {
            Some(DocumentRow {
                kind: DocumentKind::parse(&kind)?,
                status: DocumentStatus::parse(&status)?,
                comment,
                verified_by,
                verified_at,
            })
        })
        .collect())
}

fn admissions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let sex = get_required_str(params, "sex")?;
    let birth_date = get_required_str(params, "birthDate")?;
    let requested_class_id = get_required_str(params, "requestedClassId")?;

    if last_name.trim().is_empty() || first_name.trim().is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lastName and firstName must not be empty".to_string(),
            details: None,
        });
    }
    if sex != "M" && sex != "F" {
        return Err(HandlerErr {
            code: "bad_params",
            message: "sex must be M or F".to_string(),
            details: None,
        });
    }
    if NaiveDate::parse_from_str(&birth_date, "%Y-%m-%d").is_err() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "birthDate must be YYYY-MM-DD".to_string(),
            details: None,
        });
    }
    if !class_exists(conn, &requested_class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "requested class not found".to_string(),
            details: None,
        });
    }

    let priority = match get_optional_str(params, "priority") {
        Some(raw) => Priority::parse(&raw).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "priority must be one of: normal, urgent, very_urgent".to_string(),
            details: None,
        })?,
        None => Priority::Normal,
    };
    let academic_year = match get_optional_str(params, "academicYear") {
        Some(y) => y,
        None => setup::school_academic_year(conn).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?,
    };

    let post_name = get_optional_str(params, "postName").unwrap_or_default();
    let birth_place = get_optional_str(params, "birthPlace");
    let guardian_name = get_optional_str(params, "guardianName");
    let guardian_phone = get_optional_str(params, "guardianPhone");
    let address = get_optional_str(params, "address");

    let now = Utc::now();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let request_no = db::allocate_request_no(&tx, now.year()).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "counters" })),
    })?;
    let candidature_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO candidatures(
            id, request_no, last_name, post_name, first_name, sex,
            birth_place, birth_date, guardian_name, guardian_phone, address,
            requested_class_id, academic_year, status, priority, submitted_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &candidature_id,
            &request_no,
            last_name.trim(),
            &post_name,
            first_name.trim(),
            &sex,
            &birth_place,
            &birth_date,
            &guardian_name,
            &guardian_phone,
            &address,
            &requested_class_id,
            &academic_year,
            CandidatureStatus::Pending.as_str(),
            priority.as_str(),
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "candidatures" })),
    })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "candidatureId": candidature_id, "requestNo": request_no }))
}

struct CandidatureRow {
    id: String,
    request_no: String,
    last_name: String,
    post_name: String,
    first_name: String,
    sex: String,
    birth_date: String,
    requested_class_id: String,
    class_name: Option<String>,
    academic_year: String,
    status: String,
    priority: String,
    submitted_at: String,
    eval_score: Option<f64>,
    eval_recommendation: Option<String>,
}

fn admissions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // Filters compose from fixed fragments; caller input only ever binds.
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(raw) = get_optional_str(params, "status") {
        let status = CandidatureStatus::parse(&raw).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "status must be one of: pending, in_review, accepted, refused, enrolled"
                .to_string(),
            details: None,
        })?;
        clauses.push("ca.status = ?");
        binds.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(class_id) = get_optional_str(params, "classId") {
        clauses.push("ca.requested_class_id = ?");
        binds.push(Value::Text(class_id));
    }
    if let Some(year) = get_optional_str(params, "academicYear") {
        clauses.push("ca.academic_year = ?");
        binds.push(Value::Text(year));
    }
    if let Some(search) = get_optional_str(params, "search") {
        clauses.push(
            "(ca.last_name LIKE ? OR ca.first_name LIKE ? OR ca.post_name LIKE ?
              OR ca.request_no LIKE ?)",
        );
        let like = Value::Text(format!("%{}%", search));
        binds.push(like.clone());
        binds.push(like.clone());
        binds.push(like.clone());
        binds.push(like);
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT ca.id, ca.request_no, ca.last_name, ca.post_name, ca.first_name,
                ca.sex, ca.birth_date, ca.requested_class_id, c.name,
                ca.academic_year, ca.status, ca.priority, ca.submitted_at,
                ca.eval_score, ca.eval_recommendation
         FROM candidatures ca
         LEFT JOIN classes c ON c.id = ca.requested_class_id{}
         ORDER BY CASE ca.priority
                    WHEN 'very_urgent' THEN 0
                    WHEN 'urgent' THEN 1
                    ELSE 2
                  END,
                  ca.submitted_at",
        where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(CandidatureRow {
                id: r.get(0)?,
                request_no: r.get(1)?,
                last_name: r.get(2)?,
                post_name: r.get(3)?,
                first_name: r.get(4)?,
                sex: r.get(5)?,
                birth_date: r.get(6)?,
                requested_class_id: r.get(7)?,
                class_name: r.get(8)?,
                academic_year: r.get(9)?,
                status: r.get(10)?,
                priority: r.get(11)?,
                submitted_at: r.get(12)?,
                eval_score: r.get(13)?,
                eval_recommendation: r.get(14)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    // Second phase: document slots for every listed candidature in one query,
    // so the derived status never needs N+1 lookups.
    let mut slots_by_candidature: HashMap<String, Vec<(DocumentKind, DocumentStatus)>> =
        HashMap::new();
    if !rows.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(rows.len())
            .collect::<Vec<_>>()
            .join(",");
        let doc_sql = format!(
            "SELECT candidature_id, kind, status FROM candidature_documents
             WHERE candidature_id IN ({})",
            placeholders
        );
        let doc_binds: Vec<Value> = rows
            .iter()
            .map(|row| Value::Text(row.id.clone()))
            .collect();
        let mut doc_stmt = conn.prepare(&doc_sql).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
        let doc_rows = doc_stmt
            .query_map(params_from_iter(doc_binds), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        for (candidature_id, kind, status) in doc_rows {
            let (Some(kind), Some(status)) =
                (DocumentKind::parse(&kind), DocumentStatus::parse(&status))
            else {
                continue;
            };
            slots_by_candidature
                .entry(candidature_id)
                .or_default()
                .push((kind, status));
        }
    }

    let candidatures: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let slots = slots_by_candidature
                .get(&row.id)
                .map(|v| v.as_slice())
                .unwrap_or(&[]);
            json!({
                "id": row.id,
                "requestNo": row.request_no,
                "lastName": row.last_name,
                "postName": row.post_name,
                "firstName": row.first_name,
                "sex": row.sex,
                "birthDate": row.birth_date,
                "requestedClassId": row.requested_class_id,
                "requestedClassName": row.class_name,
                "academicYear": row.academic_year,
                "status": row.status,
                "priority": row.priority,
                "submittedAt": row.submitted_at,
                "evalScore": row.eval_score,
                "evalRecommendation": row.eval_recommendation,
                "documentStatus": admission::global_document_status(slots).as_str()
            })
        })
        .collect();

    Ok(json!({ "candidatures": candidatures }))
}

fn admissions_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let candidature_id = get_required_str(params, "candidatureId")?;

    let row = conn
        .query_row(
            "SELECT ca.request_no, ca.last_name, ca.post_name, ca.first_name, ca.sex,
                    ca.birth_place, ca.birth_date, ca.guardian_name, ca.guardian_phone,
                    ca.address, ca.requested_class_id, c.name, ca.academic_year,
                    ca.status, ca.priority, ca.submitted_at,
                    ca.eval_score, ca.eval_comment, ca.eval_recommendation,
                    ca.evaluated_by, ca.evaluated_at,
                    ca.decided_by, ca.decided_at, ca.decision_comment,
                    ca.registration_fee, ca.tuition_fee, ca.discount_pct,
                    ca.enrolled_student_id, s.matricule
             FROM candidatures ca
             LEFT JOIN classes c ON c.id = ca.requested_class_id
             LEFT JOIN students s ON s.id = ca.enrolled_student_id
             WHERE ca.id = ?",
            [&candidature_id],
            |r| {
                Ok(json!({
                    "id": candidature_id.clone(),
                    "requestNo": r.get::<_, String>(0)?,
                    "lastName": r.get::<_, String>(1)?,
                    "postName": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, String>(3)?,
                    "sex": r.get::<_, String>(4)?,
                    "birthPlace": r.get::<_, Option<String>>(5)?,
                    "birthDate": r.get::<_, String>(6)?,
                    "guardianName": r.get::<_, Option<String>>(7)?,
                    "guardianPhone": r.get::<_, Option<String>>(8)?,
                    "address": r.get::<_, Option<String>>(9)?,
                    "requestedClassId": r.get::<_, String>(10)?,
                    "requestedClassName": r.get::<_, Option<String>>(11)?,
                    "academicYear": r.get::<_, String>(12)?,
                    "status": r.get::<_, String>(13)?,
                    "priority": r.get::<_, String>(14)?,
                    "submittedAt": r.get::<_, String>(15)?,
                    "evaluation": {
                        "score": r.get::<_, Option<f64>>(16)?,
                        "comment": r.get::<_, Option<String>>(17)?,
                        "recommendation": r.get::<_, Option<String>>(18)?,
                        "evaluatedBy": r.get::<_, Option<String>>(19)?,
                        "evaluatedAt": r.get::<_, Option<String>>(20)?
                    },
                    "decision": {
                        "decidedBy": r.get::<_, Option<String>>(21)?,
                        "decidedAt": r.get::<_, Option<String>>(22)?,
                        "comment": r.get::<_, Option<String>>(23)?
                    },
                    "feeTerms": {
                        "registrationFee": r.get::<_, Option<f64>>(24)?,
                        "tuitionFee": r.get::<_, Option<f64>>(25)?,
                        "discountPct": r.get::<_, Option<f64>>(26)?
                    },
                    "enrolledStudentId": r.get::<_, Option<String>>(27)?,
                    "enrolledMatricule": r.get::<_, Option<String>>(28)?
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(mut candidature) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    };

    let stored = document_rows(conn, &candidature_id)?;
    let documents: Vec<serde_json::Value> = DocumentKind::ALL
        .iter()
        .map(|kind| match stored.iter().find(|d| d.kind == *kind) {
            Some(d) => json!({
                "kind": kind.as_str(),
                "status": d.status.as_str(),
                "comment": d.comment,
                "verifiedBy": d.verified_by,
                "verifiedAt": d.verified_at
            }),
            None => json!({
                "kind": kind.as_str(),
                "status": DocumentStatus::NotProvided.as_str(),
                "comment": null,
                "verifiedBy": null,
                "verifiedAt": null
            }),
        })
        .collect();
    let slots: Vec<(DocumentKind, DocumentStatus)> =
        stored.iter().map(|d| (d.kind, d.status)).collect();

    candidature["documents"] = json!(documents);
    candidature["documentStatus"] = json!(admission::global_document_status(&slots).as_str());

    Ok(json!({ "candidature": candidature }))
}

fn admissions_set_priority(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let candidature_id = get_required_str(params, "candidatureId")?;
    let raw = get_required_str(params, "priority")?;
    let priority = Priority::parse(&raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "priority must be one of: normal, urgent, very_urgent".to_string(),
        details: None,
    })?;

    let changed = conn
        .execute(
            "UPDATE candidatures SET priority = ? WHERE id = ?",
            (priority.as_str(), &candidature_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "candidatures" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true, "priority": priority.as_str() }))
}

fn handle_admissions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(msg) = Actor::require(&req.params, PERM_INTAKE) {
        return err(&req.id, "forbidden", msg, None);
    }
    match admissions_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_admissions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match admissions_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_admissions_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match admissions_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_admissions_set_priority(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(msg) = Actor::require(&req.params, PERM_INTAKE) {
        return err(&req.id, "forbidden", msg, None);
    }
    match admissions_set_priority(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admissions.create" => Some(handle_admissions_create(state, req)),
        "admissions.list" => Some(handle_admissions_list(state, req)),
        "admissions.open" => Some(handle_admissions_open(state, req)),
        "admissions.setPriority" => Some(handle_admissions_set_priority(state, req)),
        _ => None,
    }
}
