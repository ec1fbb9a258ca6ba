//! Control API (C7): a small, unauthenticated HTTP surface for publishing
//! and querying deployments, grounded in the router/handler shape of
//! `mbr-rockslide`'s `registry.rs`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::lifecycle::AddressBinder;
use crate::listener::ListenerManager;
use crate::registry::Registry;

#[derive(Clone)]
struct ApiState {
    registry: Registry,
    listeners: Arc<ListenerManager>,
    address_binder: Arc<AddressBinder>,
}

pub fn make_router(
    registry: Registry,
    listeners: Arc<ListenerManager>,
    address_binder: Arc<AddressBinder>,
) -> Router {
    let state = ApiState {
        registry,
        listeners,
        address_binder,
    };
    Router::new()
        .route("/api/new", post(publish))
        .route("/api/ip/:name", get(lookup))
        .route("/api/list", get(list))
        .with_state(state)
}

#[derive(Serialize)]
struct PublishResponse {
    name: String,
    address: Ipv4Addr,
    command: Vec<String>,
}

/// `POST /api/new`: the header names the deployment, the body is the raw
/// image archive. Returns only after the registry record is persisted and
/// the listener is accepting, per the synchronous-ordering contract.
async fn publish(
    State(state): State<ApiState>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<PublishResponse>)> {
    let name = headers
        .get("X-Image-Name")
        .ok_or_else(|| Error::InvalidInput("missing X-Image-Name header".to_owned()))?
        .to_str()
        .map_err(|_| Error::InvalidInput("X-Image-Name header is not valid UTF-8".to_owned()))?
        .to_owned();

    let deployment = state
        .registry
        .publish(&name, std::io::Cursor::new(body.to_vec()))?;

    if let Err(e) = state.address_binder.add(deployment.address).await {
        tracing::error!(deployment = %name, error = %e, "failed to bind address after publish; rolling back");
        rollback(&state, &deployment.name, &deployment.rootfs);
        return Err(e);
    }

    if let Err(e) = state.listeners.add_listener(deployment.clone()).await {
        tracing::error!(deployment = %name, error = %e, "failed to bind listener after publish; rolling back");
        state.address_binder.remove(deployment.address).await;
        rollback(&state, &deployment.name, &deployment.rootfs);
        return Err(e);
    }

    Ok((
        StatusCode::OK,
        Json(PublishResponse {
            name: deployment.name,
            address: deployment.address,
            command: deployment.command,
        }),
    ))
}

/// Undoes a publish that got as far as a persisted registry record but
/// failed before the deployment was fully reachable: drops the record and
/// removes the materialized rootfs.
fn rollback(state: &ApiState, name: &str, rootfs: &std::path::Path) {
    if let Err(e) = state.registry.remove(name) {
        tracing::error!(deployment = %name, error = %e, "failed to roll back registry record");
    }
    if let Some(deployment_root) = rootfs.parent() {
        if let Err(e) = std::fs::remove_dir_all(deployment_root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(deployment = %name, error = %e, "failed to remove rootfs during rollback");
            }
        }
    }
}

#[derive(Serialize)]
struct IpResponse {
    name: String,
    address: Ipv4Addr,
}

async fn lookup(State(state): State<ApiState>, Path(name): Path<String>) -> Result<Json<IpResponse>> {
    let deployment = state.registry.lookup(&name)?;
    Ok(Json(IpResponse {
        name: deployment.name,
        address: deployment.address,
    }))
}

#[derive(Serialize)]
struct ListEntry {
    address: Ipv4Addr,
    command: Vec<String>,
}

async fn list(State(state): State<ApiState>) -> Json<std::collections::BTreeMap<String, ListEntry>> {
    let entries = state
        .registry
        .list()
        .into_iter()
        .map(|d| {
            (
                d.name,
                ListEntry {
                    address: d.address,
                    command: d.command,
                },
            )
        })
        .collect();
    Json(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runc::Runc;
    use crate::supervisor::Supervisor;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let outcome =
            crate::registry::Registry::load(dir.path().to_path_buf(), "169.254.92.0/24", 80).unwrap();
        let runc = Arc::new(Runc::new(PathBuf::from("/nonexistent/runc")));
        let supervisor = Arc::new(Supervisor::new(
            runc,
            dir.path().join("bundles"),
            dir.path().join("rendezvous"),
            Duration::from_millis(50),
            Duration::from_millis(50),
            64,
            100_000,
            100_000,
        ));
        let listeners = Arc::new(ListenerManager::new(supervisor));
        let address_binder = Arc::new(crate::lifecycle::AddressBinder::with_runner(
            "lo".to_owned(),
            "faasd-test".to_owned(),
            Box::new(crate::lifecycle::NoopIpCommandRunner),
        ));
        let router = make_router(outcome.registry, listeners, address_binder);
        (dir, router)
    }

    #[tokio::test]
    async fn list_is_empty_for_fresh_registry() {
        let (_dir, router) = test_state();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/list")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ip_lookup_for_unknown_name_is_404() {
        let (_dir, router) = test_state();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/ip/nope")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn publish_without_name_header_is_400() {
        let (_dir, router) = test_state();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/new")
                    .body(axum::body::Body::from(vec![0u8; 4]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
