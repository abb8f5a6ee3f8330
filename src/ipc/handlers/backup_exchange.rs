use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

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

fn get_required_path(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        }),
    }
}

/// A bundle can target a directory other than the one currently open,
/// so an explicit `workspacePath` param wins over daemon state.
fn target_workspace(state: &AppState, params: &serde_json::Value) -> Result<PathBuf, HandlerErr> {
    params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr {
            code: "no_workspace",
            message: "select a workspace first".to_string(),
            details: None,
        })
}

fn export_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let out_path = get_required_path(params, "outPath")?;
    let workspace_path = target_workspace(state, params)?;

    // Flush the WAL so the archived file carries every committed row.
    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let export = backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path))
        .map_err(|e| HandlerErr {
            code: "io_failed",
            message: e.to_string(),
            details: Some(json!({ "path": out_path.clone() })),
        })?;
    info!(path = %out_path, "workspace bundle exported");

    Ok(json!({
        "ok": true,
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256
    }))
}

fn import_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let in_path = get_required_path(params, "inPath")?;
    let workspace_path = target_workspace(state, params)?;

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr {
            code: "not_found",
            message: "bundle file not found".to_string(),
            details: Some(json!({ "path": in_path })),
        });
    }
    std::fs::create_dir_all(&workspace_path).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "path": workspace_path.to_string_lossy() })),
    })?;

    // The handle on the current database must close before its file is swapped.
    state.db = None;

    let import = backup::import_workspace_bundle(&src, &workspace_path).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "path": src.to_string_lossy() })),
    })?;

    let conn = db::open_db(&workspace_path).map_err(|e| HandlerErr {
        code: "db_open_failed",
        message: e.to_string(),
        details: None,
    })?;
    info!(workspace = %workspace_path.display(), "workspace bundle imported");
    state.workspace = Some(workspace_path.clone());
    state.db = Some(conn);

    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "dbSha256": import.db_sha256
    }))
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    match export_bundle(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    match import_bundle(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        _ => None,
    }
}
