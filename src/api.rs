use axum::{http::StatusCode, routing::get, Json, Router};
use std::collections::HashMap;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::models::{AppState, NodeStats, NodesResponse, SharedState, VersionCount};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/nodes", get(get_nodes))
        .route("/api/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Current enriched node list. Always a well-formed payload: possibly
/// stale, possibly empty with `populated: false` before the first
/// successful refresh, never a transport error.
pub async fn get_nodes(state: SharedState) -> Json<NodesResponse> {
    match state.cache.get().await {
        Some(snapshot) => Json(NodesResponse {
            last_updated: Some(snapshot.last_updated),
            nodes: snapshot.nodes,
            populated: true,
        }),
        None => Json(NodesResponse {
            nodes: Vec::new(),
            last_updated: None,
            populated: false,
        }),
    }
}

/// Aggregate counters over the current snapshot
pub async fn get_stats(state: SharedState) -> Json<NodeStats> {
    match state.cache.get().await {
        Some(snapshot) => {
            let located_nodes = snapshot
                .nodes
                .iter()
                .filter(|n| n.lat.is_some())
                .count();

            let mut counts: HashMap<&str, usize> = HashMap::new();
            for node in &snapshot.nodes {
                let version = node.version.as_deref().unwrap_or("unknown");
                *counts.entry(version).or_insert(0) += 1;
            }

            let mut versions: Vec<VersionCount> = counts
                .into_iter()
                .map(|(version, count)| VersionCount {
                    version: version.to_string(),
                    count,
                })
                .collect();
            versions.sort_by(|a, b| b.count.cmp(&a.count).then(a.version.cmp(&b.version)));

            Json(NodeStats {
                total_nodes: snapshot.nodes.len(),
                located_nodes,
                versions,
                last_updated: Some(snapshot.last_updated),
                populated: true,
            })
        }
        None => Json(NodeStats {
            total_nodes: 0,
            located_nodes: 0,
            versions: Vec::new(),
            last_updated: None,
            populated: false,
        }),
    }
}
