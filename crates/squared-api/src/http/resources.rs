use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::model::{
    PlatformResource, ResourceList, ResourceRequest, ResourceResponse, ResourceSpec,
    VersionEntry, VersionHistory,
};

use super::{ApiError, ServerState};

pub async fn create(
    State(state): State<ServerState>,
    payload: Result<Json<ResourceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ResourceResponse>), ApiError> {
    let Json(request) = payload?;
    let request = request.validate()?;
    let key = state.key(&request.name)?;
    let repository = state.catalog.versioner().layout().resource(&key)?;

    let spec = request.spec.clone();
    let target = key.clone();
    let committed = state
        .blocking(move |catalog, deadline| {
            catalog
                .publish_before(target.clone(), Some(deadline), |tag| {
                    PlatformResource::new(&target, spec.clone(), tag).to_yaml()
                })
                .map_err(ApiError::from)
        })
        .await?;

    tracing::info!(
        resource = %key,
        version = %committed.version,
        digest = %committed.digest.short(),
        "resource.created"
    );
    let response = ResourceResponse {
        version: Some(committed.version.to_string()),
        digest: Some(committed.digest.to_string()),
        repository: Some(repository.to_string()),
        spec: Some(request.spec),
        ..ResourceResponse::named(request.name)
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list(State(state): State<ServerState>) -> Json<ResourceList> {
    let resources: Vec<ResourceResponse> = state
        .catalog
        .list()
        .into_iter()
        .filter(|(key, _)| key.namespace() == &*state.namespace)
        .map(|(key, manifest)| ResourceResponse {
            spec: spec_of(&manifest),
            ..ResourceResponse::named(key.name())
        })
        .collect();
    Json(ResourceList {
        count: resources.len(),
        resources,
    })
}

pub async fn get(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Result<Json<ResourceResponse>, ApiError> {
    let key = state.key(&name)?;
    let manifest = state
        .catalog
        .get(&key)
        .ok_or_else(|| ApiError::NotFound(key.to_string()))?;
    Ok(Json(ResourceResponse {
        spec: spec_of(&manifest),
        ..ResourceResponse::named(name)
    }))
}

pub async fn delete(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Result<Json<ResourceResponse>, ApiError> {
    let key = state.key(&name)?;
    let target = key.clone();
    let committed = state
        .blocking(move |catalog, deadline| {
            catalog
                .retract_before(&target, Some(deadline))
                .map_err(ApiError::from)
        })
        .await?;

    tracing::info!(resource = %key, version = %committed.version, "resource.deleted");
    Ok(Json(ResourceResponse {
        version: Some(committed.version.to_string()),
        digest: Some(committed.digest.to_string()),
        deleted: true,
        ..ResourceResponse::named(name)
    }))
}

pub async fn versions(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Result<Json<VersionHistory>, ApiError> {
    let key = state.key(&name)?;
    let tags = state
        .blocking(move |catalog, _| catalog.history(&key).map_err(ApiError::from))
        .await?;
    Ok(Json(VersionHistory {
        name,
        versions: tags.iter().map(VersionEntry::from).collect(),
    }))
}

/// Spec of a stored manifest. Entries that no longer parse are listed
/// without one.
fn spec_of(manifest: &[u8]) -> Option<ResourceSpec> {
    let text = std::str::from_utf8(manifest).ok()?;
    match PlatformResource::from_yaml(text) {
        Ok(resource) => Some(resource.spec),
        Err(err) => {
            tracing::debug!(error = %err, "stored manifest has no readable spec");
            None
        }
    }
}
