// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator control API.
//!
//! | Route | Body | Action |
//! |-------|------|--------|
//! | `GET /status` | | Proxy and manager statistics |
//! | `POST /deploy` | LaunchConfig JSON | Persist the config under its hash |
//! | `POST /launch` | content hash | Make the revision's container ready |
//! | `POST /switch` | content hash | Route traffic to a ready revision, record and save a history event |
//! | `POST /maintenance/up` | | Serve the maintenance page |
//! | `POST /maintenance/down` | | Resume forwarding |
//! | `GET /history` | | Persisted deployment events, oldest first |
//! | `POST /history/rollback` | content hash | Truncate history after the event and save |
//!
//! A deploy tool calls `/deploy`, then `/launch` with the returned hash, then
//! `/switch`. `current.json` only moves once traffic has been switched, so a
//! restart never resumes a revision that failed its health check.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::Error;
use crate::history::{ContainerHistory, ContainerHistoryEvent};
use crate::identity::IdentityProvider;
use crate::launch_config::{LaunchConfig, LaunchConfigStore};
use crate::manager::ContainerManager;
use crate::proxy::Proxy;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    manager: Arc<ContainerManager>,
    proxy: Proxy,
    store: LaunchConfigStore,
    identity: Arc<dyn IdentityProvider>,
    history_max_size: usize,
    history_lock: Arc<Mutex<()>>,
}

impl ApiState {
    /// Create handler state.
    pub fn new(
        manager: Arc<ContainerManager>,
        proxy: Proxy,
        store: LaunchConfigStore,
        identity: Arc<dyn IdentityProvider>,
        history_max_size: usize,
    ) -> Self {
        Self {
            manager,
            proxy,
            store,
            identity,
            history_max_size,
            history_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn history(&self) -> Result<ContainerHistory, Error> {
        let history =
            ContainerHistory::load_or_new(self.store.clone(), self.identity.clone()).await?;
        Ok(history.with_max_size(self.history_max_size))
    }
}

/// Error rendered as a plain text response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownRevision(_)
            | Error::NotInHistory(_)
            | Error::EmptyHistory
            | Error::LaunchConfigNotFound => StatusCode::NOT_FOUND,
            Error::HashMismatch { .. } | Error::ForceReloadLive(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        text(status, format!("{}\n", self.0))
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Answer to `POST /deploy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoredConfig {
    /// Content hash to pass to `/launch` and `/switch`.
    pub hash: String,
    /// Revision of the stored configuration.
    pub revision: String,
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/deploy", post(deploy))
        .route("/launch", post(launch))
        .route("/switch", post(switch))
        .route("/maintenance/up", post(maintenance_up))
        .route("/maintenance/down", post(maintenance_down))
        .route("/history", get(history))
        .route("/history/rollback", post(rollback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Control API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
    let proxy = state.proxy.stats().await;
    let manager = state.manager.stats().await?;

    let mut stats = serde_json::Map::new();
    for value in [serde_json::to_value(proxy), serde_json::to_value(manager)] {
        if let serde_json::Value::Object(fields) = value.map_err(Error::from)? {
            stats.extend(fields);
        }
    }
    Ok(Json(serde_json::Value::Object(stats)))
}

async fn deploy(
    State(state): State<ApiState>,
    Json(config): Json<LaunchConfig>,
) -> ApiResult<Json<StoredConfig>> {
    if config.container_config.image.is_empty() {
        return Err(Error::InvalidRequest("launch config has no image".to_string()).into());
    }

    let hash = state.store.save(&config).await?;
    Ok(Json(StoredConfig {
        hash,
        revision: config.revision,
    }))
}

async fn launch(State(state): State<ApiState>, body: String) -> ApiResult<Response> {
    let hash = hash_from_body(&body)?;
    info!(hash, "Launching container");

    let (container_id, port) = state.manager.start_container(hash).await?;
    Ok(text(
        StatusCode::OK,
        format!(
            "started container {} with revision {} listening on port {}",
            short(&container_id),
            short(hash),
            port
        ),
    ))
}

async fn switch(State(state): State<ApiState>, body: String) -> ApiResult<Response> {
    let hash = hash_from_body(&body)?;
    info!(hash, "Switching container");

    let (container_id, port) = state.manager.switch_container(hash).await?;
    record_deployment(&state, hash).await?;
    Ok(text(
        StatusCode::OK,
        format!(
            "switched proxy to port {} of container {}",
            port,
            short(&container_id)
        ),
    ))
}

/// Append a history event for the routed revision and move `current.json` to it.
async fn record_deployment(state: &ApiState, hash: &str) -> Result<(), Error> {
    let _guard = state.history_lock.lock().await;
    let mut history = state.history().await?;
    if history.current().is_some_and(|event| event.hash == hash) {
        return Ok(());
    }

    let config = state.store.load_by_hash(hash).await?;
    let event = history.add(&config).await?;
    history.save().await?;

    info!(
        hash = %event.hash,
        revision = %event.revision,
        deployed_by = %event.deployed_by,
        "Recorded deployment"
    );
    Ok(())
}

async fn maintenance_up(State(state): State<ApiState>) -> StatusCode {
    state.proxy.maintenance_up().await;
    StatusCode::OK
}

async fn maintenance_down(State(state): State<ApiState>) -> StatusCode {
    state.proxy.maintenance_down();
    StatusCode::OK
}

async fn history(State(state): State<ApiState>) -> ApiResult<Json<Vec<ContainerHistoryEvent>>> {
    let history = state.history().await?;
    Ok(Json(history.events().to_vec()))
}

async fn rollback(
    State(state): State<ApiState>,
    body: String,
) -> ApiResult<Json<ContainerHistoryEvent>> {
    let hash = hash_from_body(&body)?;

    let _guard = state.history_lock.lock().await;
    let mut history = ContainerHistory::load(state.store.clone(), state.identity.clone())
        .await?
        .with_max_size(state.history_max_size);
    let event = history.rollback_to(hash)?;
    history.save().await?;

    info!(hash, revision = %event.revision, "Rolled back history");
    Ok(Json(event))
}

fn hash_from_body(body: &str) -> ApiResult<&str> {
    let hash = body.trim();
    if hash.is_empty() {
        return Err(Error::InvalidRequest("expected a launch config hash".to_string()).into());
    }
    Ok(hash)
}

/// First eight characters, as shown to operators.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}
