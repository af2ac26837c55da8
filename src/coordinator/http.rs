//! HTTP admin API for the config server
//!
//! - `POST /admin/command` runs one [`AdminCommand`]
//! - `GET /admin/status` summarizes shards, migrations and quarantined namespaces
//! - `GET /health` reports whether the metadata store is reachable
//! - `GET /metrics` exposes counters and store gauges in Prometheus text format

use crate::common::metrics::write_sample;
use crate::coordinator::commands::{AdminCommand, CommandDispatcher, CommandFailure};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AdminState {
    pub node_id: String,
    pub dispatcher: Arc<CommandDispatcher>,
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/status", get(admin_status))
        .route("/admin/command", post(admin_command))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The body is parsed here rather than by the `Json<AdminCommand>` extractor
/// so malformed commands get the same reply shape as failed ones.
async fn admin_command(State(state): State<AdminState>, Json(body): Json<Value>) -> impl IntoResponse {
    let cmd: AdminCommand = match serde_json::from_value(body) {
        Ok(cmd) => cmd,
        Err(e) => {
            let failure = CommandFailure {
                ok: 0,
                code_name: "InvalidCommand".into(),
                errmsg: e.to_string(),
            };
            return (StatusCode::BAD_REQUEST, Json(json!(failure)));
        }
    };

    match state.dispatcher.run(cmd).await {
        Ok(reply) => (StatusCode::OK, Json(reply)),
        Err(e) => (e.to_http_status(), Json(json!(CommandFailure::from(&e)))),
    }
}

async fn admin_status(State(state): State<AdminState>) -> impl IntoResponse {
    let cluster = state.dispatcher.cluster();
    let store = cluster.store();

    let (shards, databases, collections) = match (
        store.list_shards(),
        store.list_databases(),
        store.list_collections(),
    ) {
        (Ok(s), Ok(d), Ok(c)) => (s, d, c),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            return (
                e.to_http_status(),
                Json(json!(CommandFailure::from(&e))),
            )
        }
    };
    let chunks: usize = collections.iter().map(|c| c.chunks.len()).sum();
    let pending_deletions = store.range_deletions().map(|t| t.len()).unwrap_or(0);

    (
        StatusCode::OK,
        Json(json!({
            "node_id": state.node_id,
            "version": crate::VERSION,
            "shards": shards,
            "databases": databases.len(),
            "collections": collections.len(),
            "chunks": chunks,
            "migrations": cluster.migrations().list(),
            "pending_range_deletions": pending_deletions,
            "quarantined": store.quarantined(),
            "changelog_seq": store.changelog().last_seq(),
            "routers": cluster.caches().len(),
        })),
    )
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let cluster = state.dispatcher.cluster();
    let store = cluster.store();
    let mut out = cluster.metrics().to_prometheus();

    let gauges = [
        ("shards", "Registered shards", store.list_shards().map(|s| s.len())),
        ("databases", "Database records", store.list_databases().map(|d| d.len())),
        (
            "chunks",
            "Chunks across every sharded collection",
            store
                .list_collections()
                .map(|colls| colls.iter().map(|c| c.chunks.len()).sum::<usize>()),
        ),
        (
            "pending_range_deletions",
            "Orphan cleanup tasks not yet executed",
            store.range_deletions().map(|t| t.len()),
        ),
    ];
    for (name, help, value) in gauges {
        // An unreachable store leaves its gauges out of the scrape.
        if let Ok(value) = value {
            write_sample(&mut out, name, help, "gauge", value as u64);
        }
    }
    let always = [
        ("active_migrations", "Migrations holding a range lock", store.active_migrations(None).len() as u64),
        ("quarantined_namespaces", "Namespaces blocked by a fatal inconsistency", store.quarantined().len() as u64),
        ("changelog_seq", "Last change-log sequence number", store.changelog().last_seq()),
        ("changelog_retained", "Change-log events not yet trimmed", store.changelog().retained() as u64),
    ];
    for (name, help, value) in always {
        write_sample(&mut out, name, help, "gauge", value);
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let store = state.dispatcher.cluster().store();
    match store.list_shards() {
        Ok(shards) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "node_id": state.node_id,
                "shards": shards.len(),
                "version": crate::VERSION,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "node_id": state.node_id,
                "error": e.to_string(),
            })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ClusterConfig, VersionClock};
    use crate::coordinator::cluster::Cluster;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Cluster>) {
        let cluster =
            Cluster::in_memory(ClusterConfig::default(), Arc::new(VersionClock::system())).unwrap();
        cluster.add_shard("shard0".into(), "h0").unwrap();
        let state = AdminState {
            node_id: "cfg-0".into(),
            dispatcher: Arc::new(CommandDispatcher::new(cluster.clone())),
        };
        (create_router(state), cluster)
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn command(body: Value) -> Request<Body> {
        Request::post("/admin/command")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_store() {
        let (app, cluster) = app();
        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        cluster.store().set_reachable(false);
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_command_reply_shapes() {
        let (app, _cluster) = app();

        let resp = app
            .clone()
            .oneshot(command(json!({ "command": "listShards" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], 1);
        assert_eq!(body["shards"].as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(command(json!({ "command": "dropDatabase" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["codeName"], "InvalidCommand");

        let resp = app
            .oneshot(command(json!({ "command": "dropDatabase", "database": "nope" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], 0);
        assert_eq!(body["codeName"], "NamespaceNotFound");
    }

    #[tokio::test]
    async fn test_metrics_scrape() {
        let (app, cluster) = app();
        let resp = app
            .clone()
            .oneshot(command(json!({ "command": "enableSharding", "database": "app" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        cluster.router_cache("r1").refresh("app.events").await.unwrap();

        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("shardmeta_shards 1\n"), "{}", text);
        assert!(text.contains("shardmeta_databases 1\n"));
        assert!(text.contains("shardmeta_routing_refreshes_total 1\n"));
        assert!(text.contains("shardmeta_migrations_started_total 0\n"));
        assert!(text.contains("# TYPE shardmeta_pending_range_deletions gauge\n"));
    }
}
