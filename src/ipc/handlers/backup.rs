use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "ok": true,
                "path": out_path.to_string_lossy(),
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing inPath", None),
    };

    // Drop the open connection before the database file is replaced.
    state.db = None;

    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(v) => v,
        Err(e) => {
            // Reopen whatever is on disk so the session stays usable.
            state.db = db::open_db(&workspace).ok();
            return err(&req.id, "import_failed", format!("{e:#}"), None);
        }
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "bundleFormat": summary.bundle_format_detected,
                    "checksumVerified": summary.checksum_verified
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        _ => None,
    }
}
