use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::Credential;
use crate::connector::ConnectorState;
use crate::routecache::{Observation, RouteCache, RouteCacheError};
use crate::status::StatusReporter;

use super::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<RouteCache>,
    pub status: StatusReporter,
    pub credential: Credential,
    pub connector: watch::Receiver<ConnectorState>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub state: String,
    pub unsent_datapoints: u64,
    pub unsent_tracks: u64,
}

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub api_key: Option<String>,
}

async fn blocking<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    F: FnOnce(&RouteCache) -> Result<T, RouteCacheError> + Send + 'static,
    T: Send + 'static,
{
    let cache = state.cache.clone();
    tokio::task::spawn_blocking(move || op(&cache))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let stats = blocking(&state, |cache| cache.pending_stats()).await?;
    let connector = *state.connector.borrow();
    Ok(Json(StatusResponse {
        status: state.status.current(),
        state: connector.to_string(),
        unsent_datapoints: stats.unsent_datapoints,
        unsent_tracks: stats.unsent_tracks,
    }))
}

pub async fn insert_observation(
    State(state): State<AppState>,
    Json(observation): Json<Observation>,
) -> ApiResult<StatusCode> {
    validate(&observation)?;
    blocking(&state, move |cache| cache.insert(&observation)).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn set_credential(
    State(state): State<AppState>,
    Json(request): Json<CredentialRequest>,
) -> StatusCode {
    let action = match request.api_key {
        Some(_) => "updated",
        None => "cleared",
    };
    log::info!("API key {}", action);
    state.credential.set(request.api_key);
    StatusCode::NO_CONTENT
}

fn validate(observation: &Observation) -> ApiResult<()> {
    let position = &observation.position;
    if !(-90.0..=90.0).contains(&position.latitude) {
        return Err(ApiError::Validation(format!(
            "latitude {} out of range",
            position.latitude
        )));
    }
    if !(-180.0..=180.0).contains(&position.longitude) {
        return Err(ApiError::Validation(format!(
            "longitude {} out of range",
            position.longitude
        )));
    }
    Ok(())
}
