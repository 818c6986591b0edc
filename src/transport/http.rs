//! HTTP transport for Raft RPC.
//!
//! One POST route per RPC method; axum serves the inbound side against
//! the shared core, reqwest drives the outbound side. Arguments and
//! replies travel as JSON.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::core::raft_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// Outbound HTTP client for a node.
pub struct HttpTransport {
    /// Map of node ID to address (e.g. "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("build http client");
        HttpTransport { peers, client }
    }

    async fn call<A, R>(&self, target: u64, method: &str, args: &A) -> Result<R, TransportError>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let addr = self
            .peers
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/raft/{}", addr, method);

        let response = self.client.post(&url).json(args).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed
            }
        })?;

        response
            .json::<R>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        self.call(target, "request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        self.call(target, "append_entries", &args).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError> {
        self.call(target, "install_snapshot", &args).await
    }
}

/// Router exposing the three inbound RPC handlers over the shared core.
pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(core)
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteReply> {
    let mut core = core.lock().await;
    Json(core.handle_request_vote(&args))
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesReply> {
    let mut core = core.lock().await;
    Json(core.handle_append_entries(&args))
}

async fn handle_install_snapshot(
    State(core): State<SharedCore>,
    Json(args): Json<InstallSnapshotArgs>,
) -> Json<InstallSnapshotReply> {
    let mut core = core.lock().await;
    Json(core.handle_install_snapshot(&args))
}
