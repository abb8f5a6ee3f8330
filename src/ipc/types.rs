use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One JSON-lines request read from stdin: `{ id, method, params }`.
/// `params.actor` rides inside `params` for the mutating admission methods.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon-wide state. One process serves one operator session; the selected
/// workspace directory and the open handle on its admissions database both
/// swap together on `workspace.select` (and after a bundle import).
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
