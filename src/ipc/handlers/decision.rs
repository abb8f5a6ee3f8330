use crate::access::{Actor, PERM_DECIDE};
use crate::admission::{
    self, CandidatureStatus, DocumentKind, DocumentStatus, GlobalDocumentStatus,
};
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

fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    v.as_f64().map(Some).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("{} must be a number", key),
        details: None,
    })
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

fn decide(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let candidature_id = get_required_str(params, "candidatureId")?;
    let decision_raw = get_required_str(params, "decision")?;
    let decision = match decision_raw.as_str() {
        "accepted" => CandidatureStatus::Accepted,
        "refused" => CandidatureStatus::Refused,
        _ => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "decision must be accepted or refused".to_string(),
                details: None,
            })
        }
    };
    let comment = params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let registration_fee = get_optional_f64(params, "registrationFee")?;
    let tuition_fee = get_optional_f64(params, "tuitionFee")?;
    let discount_pct = get_optional_f64(params, "discountPct")?;
    if let Some(fee) = registration_fee {
        admission::validate_fee(fee, "registrationFee").map_err(|msg| HandlerErr {
            code: "bad_params",
            message: msg,
            details: None,
        })?;
    }
    if let Some(fee) = tuition_fee {
        admission::validate_fee(fee, "tuitionFee").map_err(|msg| HandlerErr {
            code: "bad_params",
            message: msg,
            details: None,
        })?;
    }
    if let Some(pct) = discount_pct {
        admission::validate_discount_pct(pct).map_err(|msg| HandlerErr {
            code: "bad_params",
            message: msg,
            details: None,
        })?;
    }

    let row: Option<(String, Option<f64>)> = conn
        .query_row(
            "SELECT status, eval_score FROM candidatures WHERE id = ?",
            [&candidature_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((status_raw, eval_score)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    };
    match CandidatureStatus::parse(&status_raw) {
        Some(CandidatureStatus::Pending)
        | Some(CandidatureStatus::InReview)
        | Some(CandidatureStatus::Accepted) => {}
        _ => {
            return Err(HandlerErr {
                code: "terminal_status",
                message: format!("cannot decide from status '{}'", status_raw),
                details: None,
            })
        }
    }

    // Advisory only: the decision goes through even when review is missing.
    // The front end shows these so the operator knows what was skipped.
    let mut review_warnings: Vec<&'static str> = Vec::new();
    if eval_score.is_none() {
        review_warnings.push("not_evaluated");
    }
    let slots = document_slots(conn, &candidature_id)?;
    match admission::global_document_status(&slots) {
        GlobalDocumentStatus::Incomplete => review_warnings.push("documents_incomplete"),
        GlobalDocumentStatus::Rejected => review_warnings.push("documents_rejected"),
        GlobalDocumentStatus::Complete => {}
    }

    conn.execute(
        "UPDATE candidatures SET
            status = ?,
            decided_by = ?,
            decided_at = ?,
            decision_comment = ?,
            registration_fee = COALESCE(?, registration_fee),
            tuition_fee = COALESCE(?, tuition_fee),
            discount_pct = COALESCE(?, discount_pct)
         WHERE id = ?",
        rusqlite::params![
            decision.as_str(),
            &actor.name,
            Utc::now().to_rfc3339(),
            &comment,
            registration_fee,
            tuition_fee,
            discount_pct,
            &candidature_id,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "candidatures" })),
    })?;

    Ok(json!({
        "ok": true,
        "status": decision.as_str(),
        "reviewWarnings": review_warnings
    }))
}

fn handle_decide(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match Actor::require(&req.params, PERM_DECIDE) {
        Ok(a) => a,
        Err(msg) => return err(&req.id, "forbidden", msg, None),
    };
    match decide(conn, &actor, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admissions.decide" => Some(handle_decide(state, req)),
        _ => None,
    }
}
