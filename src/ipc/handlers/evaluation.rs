use crate::access::{Actor, PERM_EVALUATE};
use crate::admission::{self, CandidatureStatus, Recommendation};
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

fn begin_review(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let candidature_id = get_required_str(params, "candidatureId")?;
    let Some(status) = candidature_status(conn, &candidature_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    };
    if status != CandidatureStatus::Pending {
        return Err(HandlerErr {
            code: "terminal_status",
            message: format!("cannot begin review from status '{}'", status.as_str()),
            details: None,
        });
    }
    conn.execute(
        "UPDATE candidatures SET status = ? WHERE id = ?",
        (CandidatureStatus::InReview.as_str(), &candidature_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "candidatures" })),
    })?;
    Ok(json!({ "ok": true, "status": CandidatureStatus::InReview.as_str() }))
}

fn evaluate(
    conn: &Connection,
    actor: &Actor,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let candidature_id = get_required_str(params, "candidatureId")?;
    let score = params
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing score".to_string(),
            details: None,
        })?;
    admission::validate_score(score).map_err(|msg| HandlerErr {
        code: "bad_params",
        message: msg,
        details: Some(json!({ "score": score })),
    })?;
    let recommendation_raw = get_required_str(params, "recommendation")?;
    let recommendation = Recommendation::parse(&recommendation_raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "recommendation must be one of: accept, refuse, wait".to_string(),
        details: None,
    })?;
    let comment = params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let Some(status) = candidature_status(conn, &candidature_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "candidature not found".to_string(),
            details: None,
        });
    };
    if status == CandidatureStatus::Enrolled {
        return Err(HandlerErr {
            code: "terminal_status",
            message: "candidature is already enrolled".to_string(),
            details: None,
        });
    }

    // Re-evaluation replaces the whole block; there is no history.
    let evaluated_at = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE candidatures SET
            eval_score = ?,
            eval_comment = ?,
            eval_recommendation = ?,
            evaluated_by = ?,
            evaluated_at = ?
         WHERE id = ?",
        (
            score,
            &comment,
            recommendation.as_str(),
            &actor.name,
            &evaluated_at,
            &candidature_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "candidatures" })),
    })?;

    Ok(json!({ "ok": true, "evaluatedAt": evaluated_at }))
}

fn bulk_recommend(
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
    let recommendation_raw = get_required_str(params, "recommendation")?;
    let recommendation = Recommendation::parse(&recommendation_raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "recommendation must be one of: accept, refuse, wait".to_string(),
        details: None,
    })?;

    if candidature_ids.is_empty() {
        return Ok(json!({ "ok": true, "updated": 0, "skipped": 0, "errors": [] }));
    }

    let evaluated_at = Utc::now().to_rfc3339();
    let mut updated = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for candidature_id in &candidature_ids {
        let Some(status) = candidature_status(&tx, candidature_id)? else {
            errors.push(json!({
                "candidatureId": candidature_id,
                "code": "not_found",
                "message": "candidature not found"
            }));
            continue;
        };
        if status == CandidatureStatus::Enrolled {
            errors.push(json!({
                "candidatureId": candidature_id,
                "code": "terminal_status",
                "message": "candidature is already enrolled"
            }));
            continue;
        }
        // Scores and comments are left alone; only the recommendation and the
        // evaluator stamp change.
        tx.execute(
            "UPDATE candidatures SET
                eval_recommendation = ?,
                evaluated_by = ?,
                evaluated_at = ?
             WHERE id = ?",
            (
                recommendation.as_str(),
                &actor.name,
                &evaluated_at,
                candidature_id,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "candidatures" })),
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

fn handle_begin_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(msg) = Actor::require(&req.params, PERM_EVALUATE) {
        return err(&req.id, "forbidden", msg, None);
    }
    match begin_review(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match Actor::require(&req.params, PERM_EVALUATE) {
        Ok(a) => a,
        Err(msg) => return err(&req.id, "forbidden", msg, None),
    };
    match evaluate(conn, &actor, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_bulk_recommend(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match Actor::require(&req.params, PERM_EVALUATE) {
        Ok(a) => a,
        Err(msg) => return err(&req.id, "forbidden", msg, None),
    };
    match bulk_recommend(conn, &actor, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admissions.beginReview" => Some(handle_begin_review(state, req)),
        "admissions.evaluate" => Some(handle_evaluate(state, req)),
        "admissions.bulkRecommend" => Some(handle_bulk_recommend(state, req)),
        _ => None,
    }
}
