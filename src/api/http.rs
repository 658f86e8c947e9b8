//! HTTP API Server
//!
//! Read-only admin endpoints for the partitions hosted on a metanode.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::metadata::{Dentry, MetadataManager, PartitionSummary};
use crate::proto::{InodeInfo, Status};

/// Shared application state
pub struct AppState {
    /// Node address
    pub node_addr: String,
    /// Partitions hosted on this node
    pub manager: Arc<MetadataManager>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, manager: Arc<MetadataManager>) -> Self {
        let state = Arc::new(AppState {
            node_addr: manager.node_addr().to_string(),
            manager,
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/partitions", get(handle_partitions))
            .route("/partitions/:id", get(handle_partition))
            .route("/partitions/:id/inodes/:ino", get(handle_inode))
            .route("/partitions/:id/dentries/:parent", get(handle_dentries))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_addr: String,
    pub partitions: usize,
}

/// Children of a directory inode
#[derive(Debug, Serialize)]
pub struct DentriesResponse {
    pub parent: u64,
    pub children: Vec<Dentry>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: Error) -> Response {
    let (status, code) = match &err {
        Error::PartitionNotFound(_) => (StatusCode::NOT_FOUND, "PARTITION_NOT_FOUND"),
        Error::Status(Status::Noent) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_addr: state.node_addr.clone(),
        partitions: state.manager.partitions().len(),
    })
}

async fn handle_partitions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summaries: Vec<PartitionSummary> = state
        .manager
        .partitions()
        .iter()
        .map(|p| p.summary())
        .collect();
    Json(summaries)
}

async fn handle_partition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Response {
    match state.manager.partition(id) {
        Ok(partition) => Json(partition.summary()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_inode(
    State(state): State<Arc<AppState>>,
    Path((id, ino)): Path<(u64, u64)>,
) -> Response {
    let inode = state
        .manager
        .partition(id)
        .and_then(|partition| partition.get_inode(ino));
    match inode {
        Ok(inode) => Json(InodeInfo::from(&inode)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_dentries(
    State(state): State<Arc<AppState>>,
    Path((id, parent)): Path<(u64, u64)>,
) -> Response {
    match state.manager.partition(id) {
        Ok(partition) => Json(DentriesResponse {
            parent,
            children: partition.read_dir(parent),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionSettings;
    use crate::metadata::{S_IFDIR, S_IFREG};
    use crate::proto::{CreateDentryRequest, CreateInodeRequest, CreatePartitionRequest};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_admin_endpoints() {
        let root = tempdir().unwrap();
        let manager = Arc::new(MetadataManager::new(
            "127.0.0.1:17210",
            root.path(),
            PartitionSettings::default(),
        ));
        let partition = manager
            .create_partition(&CreatePartitionRequest {
                partition_id: 4,
                volume: "ltptest".into(),
                start: 1,
                end: 100,
                members: vec!["127.0.0.1:17210".into()],
            })
            .await
            .unwrap();
        let dir = partition
            .create_inode(&CreateInodeRequest {
                volume: "ltptest".into(),
                partition_id: 4,
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                target: None,
                parent: 0,
            })
            .await
            .unwrap();
        let inode = partition
            .create_inode(&CreateInodeRequest {
                volume: "ltptest".into(),
                partition_id: 4,
                mode: S_IFREG | 0o644,
                uid: 7,
                gid: 7,
                target: None,
                parent: dir.inode,
            })
            .await
            .unwrap();
        partition
            .create_dentry(&CreateDentryRequest {
                partition_id: 4,
                parent: dir.inode,
                name: "motd".into(),
                inode: inode.inode,
                mode: S_IFREG,
            })
            .await
            .unwrap();

        let server = HttpServer::new(ApiConfig::default(), Arc::clone(&manager));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { server.serve(listener).await });

        let http = reqwest::Client::new();
        let health: serde_json::Value = http
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["partitions"], 1);

        let summary: serde_json::Value = http
            .get(format!("{}/partitions/4", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["inode_count"], 2);
        assert_eq!(summary["dentry_count"], 1);

        let info: serde_json::Value = http
            .get(format!("{}/partitions/4/inodes/{}", base, inode.inode))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["uid"], 7);

        let dentries: serde_json::Value = http
            .get(format!("{}/partitions/4/dentries/{}", base, dir.inode))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(dentries["children"][0]["name"], "motd");

        let missing = http
            .get(format!("{}/partitions/4/inodes/99", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let missing = http.get(format!("{}/partitions/8", base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        manager.stop().await;
    }
}
