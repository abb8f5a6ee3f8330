use crate::access::{Actor, PERM_VERIFY};
use crate::admission::{self, CandidatureStatus, DocumentKind, DocumentStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn parse_kind(raw: &str) -> Result<DocumentKind, HandlerErr> {
    DocumentKind::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "kind must be one of: birth_certificate, report_card, medical_certificate, \
                  id_photo, other"
            .to_string(),
        details: None,
    })
}

fn parse_status(raw: &str) -> Result<DocumentStatus, HandlerErr> {
    DocumentStatus::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be one of: not_provided, provided, verified, rejected".to_string(),
        details: None,
    })
}

fn candidature_status(
    conn: &Connection,
    candidature_id: &str,
) -> Result<Option<CandidatureStatus>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM candidatures WHERE id = ?",
            [candidature_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(raw.as_deref().and_then(CandidatureStatus::parse))
}

fn document_slots(
    conn: &Connection,
    candidature_id: &str,
) -> Result<Vec<(DocumentKind, DocumentStatus)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT kind, status FROM candidature_documents WHERE candidature_id = ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let raw = stmt
        .query_map([candidature_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(raw
        .into_iter()
        .filter_map(|(kind, status)| {
            Some((DocumentKind::parse(&kind)?, DocumentStatus::parse(&status)?))
        })
        .collect())
}

fn set_document_status(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let candidature_id = get_required_str(params, "candidatureId")?;
    let kind = parse_kind(&get_required_str(params, "kind")?)?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let comment = params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let Some(candidature) = candidature_status(conn, &candidature_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    };
    if candidature == CandidatureStatus::Enrolled {
        return Err(HandlerErr {
            code: "terminal_status",
            message: "candidature is already enrolled".to_string(),
            details: None,
        });
    }

    // Overwrite is final: the previous slot state is not kept anywhere.
    conn.execute(
        "INSERT INTO candidature_documents(
            candidature_id, kind, status, comment, verified_by, verified_at
         ) VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(candidature_id, kind) DO UPDATE SET
           status = excluded.status,
           comment = excluded.comment,
           verified_by = excluded.verified_by,
           verified_at = excluded.verified_at",
        (
            &candidature_id,
            kind.as_str(),
            status.as_str(),
            &comment,
            &actor.name,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "candidature_documents" })),
    })?;

    let slots = document_slots(conn, &candidature_id)?;
    Ok(json!({
        "ok": true,
        "kind": kind.as_str(),
        "status": status.as_str(),
        "documentStatus": admission::global_document_status(&slots).as_str()
    }))
}

fn bulk_set_document_status(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(ids_json) = params.get("candidatureIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing candidatureIds".to_string(),
            details: None,
        });
    };
    let candidature_ids: Vec<String> = ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    let kind = parse_kind(&get_required_str(params, "kind")?)?;
    let status = parse_status(&get_required_str(params, "status")?)?;

    if candidature_ids.is_empty() {
        return Ok(json!({ "ok": true, "updated": 0, "skipped": 0, "errors": [] }));
    }

    let verified_at = Utc::now().to_rfc3339();
    let mut updated = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for candidature_id in &candidature_ids {
        let Some(candidature) = candidature_status(&tx, candidature_id)? else {
            errors.push(json!({
                "candidatureId": candidature_id,
                "code": "not_found",
                "message": "candidature not found"
            }));
            continue;
        };
        if candidature == CandidatureStatus::Enrolled {
            errors.push(json!({
                "candidatureId": candidature_id,
                "code": "terminal_status",
                "message": "candidature is already enrolled"
            }));
            continue;
        }
        // The broadcast carries no comment, so existing comments stay.
        tx.execute(
            "INSERT INTO candidature_documents(
                candidature_id, kind, status, comment, verified_by, verified_at
             ) VALUES(?, ?, ?, NULL, ?, ?)
             ON CONFLICT(candidature_id, kind) DO UPDATE SET
               status = excluded.status,
               verified_by = excluded.verified_by,
               verified_at = excluded.verified_at",
            (
                candidature_id,
                kind.as_str(),
                status.as_str(),
                &actor.name,
                &verified_at,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "candidature_documents" })),
        })?;
        updated += 1;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "ok": true,
        "updated": updated,
        "skipped": errors.len(),
        "errors": errors
    }))
}

fn handle_set_document_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match Actor::require(&req.params, PERM_VERIFY) {
        Ok(a) => a,
        Err(msg) => return err(&req.id, "forbidden", msg, None),
    };
    match set_document_status(conn, &actor, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_bulk_set_document_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match Actor::require(&req.params, PERM_VERIFY) {
        Ok(a) => a,
        Err(msg) => return err(&req.id, "forbidden", msg, None),
    };
    match bulk_set_document_status(conn, &actor, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admissions.setDocumentStatus" => Some(handle_set_document_status(state, req)),
        "admissions.bulkSetDocumentStatus" => Some(handle_bulk_set_document_status(state, req)),
        _ => None,
    }
}
