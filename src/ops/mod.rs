//! Operator commands against a running config server

pub mod repair;
pub mod verify;

pub use repair::{repair_namespace, RepairReport};
pub use verify::{verify_metadata, VerifyReport};

use crate::common::{Error, Result};
use crate::coordinator::commands::{AdminCommand, CommandFailure};
use serde_json::Value;

/// POST one admin command and return the `ok: 1` reply.
pub async fn send_command(config_server: &str, cmd: &AdminCommand) -> Result<Value> {
    let url = format!("{}/admin/command", config_server.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(cmd)
        .send()
        .await
        .map_err(|e| Error::MetadataUnavailable(format!("{}: {}", url, e)))?;
    let body: Value = response
        .json()
        .await
        .map_err(|e| Error::Serialization(e.to_string()))?;

    if body["ok"] == 1 {
        return Ok(body);
    }
    let failure: CommandFailure = serde_json::from_value(body)?;
    Err(Error::Internal(format!(
        "{} failed with {}: {}",
        cmd.name(),
        failure.code_name,
        failure.errmsg
    )))
}

/// GET `/admin/status`.
pub async fn fetch_status(config_server: &str) -> Result<Value> {
    let url = format!("{}/admin/status", config_server.trim_end_matches('/'));
    reqwest::get(&url)
        .await
        .map_err(|e| Error::MetadataUnavailable(format!("{}: {}", url, e)))?
        .json()
        .await
        .map_err(|e| Error::Serialization(e.to_string()))
}
