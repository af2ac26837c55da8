//! Config server process

use crate::common::{Config, Error, Result, ShardId, VersionClock};
use crate::coordinator::cluster::Cluster;
use crate::coordinator::commands::CommandDispatcher;
use crate::coordinator::http::{create_router, AdminState};
use crate::coordinator::metadata::MetadataStore;
use crate::shard::InMemoryShards;
use std::sync::Arc;

pub struct ConfigServer {
    config: Config,
}

impl ConfigServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build the cluster context: open the store and register the shards
    /// listed in the config file.
    pub fn build_cluster(&self) -> Result<Arc<Cluster>> {
        let clock = Arc::new(VersionClock::system());
        let store = match &self.config.server.db_path {
            Some(path) => Arc::new(MetadataStore::open(path, clock)?),
            None => {
                tracing::warn!("no db_path configured, metadata will not survive a restart");
                Arc::new(MetadataStore::in_memory(clock))
            }
        };
        let data = Arc::new(InMemoryShards::new(self.config.cluster.max_upsert_retries));
        let cluster = Cluster::new(self.config.cluster.clone(), store, data)?;

        for entry in &self.config.server.shards {
            let (id, host) = parse_shard_entry(entry)?;
            if cluster.store().get_shard(&id)?.is_none() {
                cluster.add_shard(id, &host)?;
            }
        }
        Ok(cluster)
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting config server: {}", self.config.node_id);
        tracing::info!("  Admin API: {}", self.config.server.bind_addr);
        match &self.config.server.db_path {
            Some(path) => tracing::info!("  DB path: {}", path.display()),
            None => tracing::info!("  DB path: <in-memory>"),
        }

        let cluster = self.build_cluster()?;
        cluster.spawn_background();

        let state = AdminState {
            node_id: self.config.node_id.clone(),
            dispatcher: Arc::new(CommandDispatcher::new(cluster.clone())),
        };
        let router = create_router(state);

        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr).await?;
        tracing::info!(
            shards = cluster.nodes().all().len(),
            "config server ready"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        cluster.shutdown();
        cluster.store().flush()?;
        tracing::info!("config server stopped");
        Ok(())
    }
}

/// `shard0=host:port`, or a bare id that doubles as its host.
fn parse_shard_entry(entry: &str) -> Result<(ShardId, String)> {
    let (id, host) = entry.split_once('=').unwrap_or((entry, entry));
    if id.is_empty() || host.is_empty() {
        return Err(Error::InvalidConfig(format!("invalid shard entry {:?}", entry)));
    }
    Ok((ShardId::from(id), host.to_string()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shard_entry() {
        assert_eq!(
            parse_shard_entry("shard0=10.0.0.1:27018").unwrap(),
            (ShardId::from("shard0"), "10.0.0.1:27018".to_string())
        );
        assert_eq!(
            parse_shard_entry("shard1").unwrap(),
            (ShardId::from("shard1"), "shard1".to_string())
        );
        assert!(parse_shard_entry("=host").is_err());
    }

    #[test]
    fn test_build_cluster_registers_configured_shards() {
        let mut config = Config::default();
        config.server.shards = vec!["shard0=h0".into(), "shard1=h1".into()];
        let cluster = ConfigServer::new(config).build_cluster().unwrap();
        assert_eq!(cluster.store().active_shards().unwrap().len(), 2);
        assert_eq!(cluster.nodes().all().len(), 2);
    }
}
