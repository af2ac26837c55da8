//! Verify routing metadata consistency

use crate::common::Result;
use crate::coordinator::commands::AdminCommand;
use crate::coordinator::consistency::Inconsistency;
use chrono::{DateTime, Utc};

#[derive(Debug)]
pub struct VerifyReport {
    pub scope: String,
    pub checked_at: DateTime<Utc>,
    pub fatal: usize,
    pub inconsistencies: Vec<Inconsistency>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

/// Run `checkMetadataConsistency` for `namespace`, or the whole cluster.
///
/// Namespaces with fatal findings are quarantined by the config server.
pub async fn verify_metadata(config_server: &str, namespace: Option<&str>) -> Result<VerifyReport> {
    let scope = namespace.unwrap_or("cluster").to_string();
    tracing::info!(scope = %scope, "Starting metadata verification");

    let cmd = AdminCommand::CheckMetadataConsistency {
        namespace: namespace.map(str::to_string),
    };
    let reply = super::send_command(config_server, &cmd).await?;
    let inconsistencies: Vec<Inconsistency> =
        serde_json::from_value(reply["inconsistencies"].clone())?;
    let fatal = inconsistencies.iter().filter(|f| f.is_fatal()).count();

    if fatal > 0 {
        tracing::warn!(scope = %scope, fatal, "fatal metadata inconsistencies found");
    }
    Ok(VerifyReport {
        scope,
        checked_at: Utc::now(),
        fatal,
        inconsistencies,
    })
}
