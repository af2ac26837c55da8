//! Repair a namespace by overwriting its authoritative record

use crate::common::{Result, Version};
use crate::coordinator::commands::AdminCommand;
use crate::coordinator::metadata::NamespaceEntry;

#[derive(Debug)]
pub struct RepairReport {
    pub namespace: String,
    pub version: Version,
    /// Findings still reported for the namespace after the overwrite
    pub remaining: usize,
}

/// Force-overwrite `record`, then re-check its namespace.
///
/// `dry_run` only reports what is currently wrong.
pub async fn repair_namespace(
    config_server: &str,
    record: NamespaceEntry,
    dry_run: bool,
) -> Result<RepairReport> {
    let namespace = record.namespace().to_string();
    tracing::info!(namespace = %namespace, dry_run, "Starting metadata repair");

    let version = if dry_run {
        record.version()
    } else {
        let reply =
            super::send_command(config_server, &AdminCommand::ForceOverwrite { record }).await?;
        serde_json::from_value(reply["version"].clone())?
    };

    let report = super::verify_metadata(config_server, Some(&namespace)).await?;
    Ok(RepairReport {
        namespace,
        version,
        remaining: report.inconsistencies.len(),
    })
}
