use crate::admission::{
    self, CandidatureStatus, DocumentKind, DocumentStatus, GlobalDocumentStatus, Priority,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use std::collections::HashMap;

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

fn db_query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn academic_year_param(params: &serde_json::Value) -> Option<String> {
    params
        .get("academicYear")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn grouped_counts(
    conn: &Connection,
    sql: &str,
    binds: &[Value],
) -> Result<HashMap<String, i64>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(db_query_failed)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter().cloned()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    Ok(rows.into_iter().collect())
}

fn admissions_stats(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year = academic_year_param(params);
    let (where_sql, binds) = match &year {
        Some(y) => (
            " WHERE academic_year = ?",
            vec![Value::Text(y.clone())],
        ),
        None => ("", Vec::new()),
    };

    let status_counts = grouped_counts(
        conn,
        &format!(
            "SELECT status, COUNT(*) FROM candidatures{} GROUP BY status",
            where_sql
        ),
        &binds,
    )?;
    // Zero-filled so the dashboard always sees every bucket.
    let by_status: serde_json::Map<String, serde_json::Value> = CandidatureStatus::ALL
        .iter()
        .map(|s| {
            (
                s.as_str().to_string(),
                json!(status_counts.get(s.as_str()).copied().unwrap_or(0)),
            )
        })
        .collect();

    let priority_counts = grouped_counts(
        conn,
        &format!(
            "SELECT priority, COUNT(*) FROM candidatures{} GROUP BY priority",
            where_sql
        ),
        &binds,
    )?;
    let by_priority: serde_json::Map<String, serde_json::Value> = Priority::ALL
        .iter()
        .map(|p| {
            (
                p.as_str().to_string(),
                json!(priority_counts.get(p.as_str()).copied().unwrap_or(0)),
            )
        })
        .collect();

    let average_score: Option<f64> = conn
        .query_row(
            &format!("SELECT AVG(eval_score) FROM candidatures{}", where_sql),
            params_from_iter(binds.iter().cloned()),
            |r| r.get(0),
        )
        .map_err(db_query_failed)?;

    // Document derivation runs per candidature, so candidatures without any
    // stored slot still count as incomplete.
    let mut id_stmt = conn
        .prepare(&format!("SELECT id FROM candidatures{}", where_sql))
        .map_err(db_query_failed)?;
    let candidature_ids = id_stmt
        .query_map(params_from_iter(binds.iter().cloned()), |r| {
            r.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;

    let doc_sql = match &year {
        Some(_) => {
            "SELECT d.candidature_id, d.kind, d.status
             FROM candidature_documents d
             JOIN candidatures ca ON ca.id = d.candidature_id
             WHERE ca.academic_year = ?"
        }
        None => {
            "SELECT d.candidature_id, d.kind, d.status
             FROM candidature_documents d"
        }
    };
    let mut doc_stmt = conn.prepare(doc_sql).map_err(db_query_failed)?;
    let doc_rows = doc_stmt
        .query_map(params_from_iter(binds.iter().cloned()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_failed)?;
    let mut slots_by_candidature: HashMap<String, Vec<(DocumentKind, DocumentStatus)>> =
        HashMap::new();
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
    let mut complete = 0i64;
    let mut incomplete = 0i64;
    let mut rejected = 0i64;
    for id in &candidature_ids {
        let slots = slots_by_candidature
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        match admission::global_document_status(slots) {
            GlobalDocumentStatus::Complete => complete += 1,
            GlobalDocumentStatus::Incomplete => incomplete += 1,
            GlobalDocumentStatus::Rejected => rejected += 1,
        }
    }

    let enrolled_fee_total: f64 = conn
        .query_row(
            &format!(
                "SELECT COALESCE(SUM(total), 0) FROM student_fees{}",
                where_sql
            ),
            params_from_iter(binds.iter().cloned()),
            |r| r.get(0),
        )
        .map_err(db_query_failed)?;

    Ok(json!({
        "academicYear": year,
        "total": candidature_ids.len(),
        "byStatus": by_status,
        "byPriority": by_priority,
        "documents": {
            "complete": complete,
            "incomplete": incomplete,
            "rejected": rejected
        },
        "averageScore": average_score,
        "enrolledFeeTotal": enrolled_fee_total
    }))
}

fn handle_admissions_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match admissions_stats(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admissions.stats" => Some(handle_admissions_stats(state, req)),
        _ => None,
    }
}
