// Thin HTTP surface for session lifecycle: create, look up by id, and
// enter (issue a fresh anonymous identity for this visit).
//
// There is no authentication: possession of the session id is the sole
// access control, a deliberate tradeoff for anonymity.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use cinder_common::types::SessionRecord;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    error::{ErrorCode, RelayError},
    identity::IdentityProvider,
    registry::{RegistryError, SessionRegistry},
    store::StoreError,
};

#[derive(Clone)]
struct ApiState {
    registry: Arc<SessionRegistry>,
    identity: Arc<dyn IdentityProvider>,
}

#[derive(Serialize, Deserialize)]
struct SessionEnvelope {
    session: SessionRecord,
}

#[derive(Serialize, Deserialize)]
struct EnterSessionResponse {
    session_id: String,
    display_name: String,
    avatar_tag: String,
}

pub fn router(registry: Arc<SessionRegistry>, identity: Arc<dyn IdentityProvider>) -> Router {
    let state = ApiState { registry, identity };
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{session_id}", get(get_session))
        .route("/v1/sessions/{session_id}/enter", post(enter_session))
        .with_state(state)
}

async fn create_session(
    State(state): State<ApiState>,
) -> Result<(StatusCode, Json<SessionEnvelope>), RelayError> {
    let session = state.registry.create_session().await.map_err(registry_failure)?;
    Ok((StatusCode::CREATED, Json(SessionEnvelope { session })))
}

async fn get_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionEnvelope>, RelayError> {
    let session = state
        .registry
        .store()
        .session(&session_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| RelayError::from_code(ErrorCode::SessionNotFound))?;

    Ok(Json(SessionEnvelope { session }))
}

async fn enter_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<EnterSessionResponse>, RelayError> {
    let session = state
        .registry
        .store()
        .session(&session_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| RelayError::from_code(ErrorCode::SessionNotFound))?;

    // Entering the room counts as activity even before the socket joins.
    state.registry.touch(&session.id).await;

    let identity = state.identity.generate();
    Ok(Json(EnterSessionResponse {
        session_id: session.id,
        display_name: identity.display_name,
        avatar_tag: identity.avatar_tag,
    }))
}

fn store_failure(store_error: StoreError) -> RelayError {
    error!(error = ?store_error, "session store failure during api call");
    RelayError::from_code(ErrorCode::StoreUnavailable)
}

fn registry_failure(registry_error: RegistryError) -> RelayError {
    match registry_error {
        RegistryError::Store(store_error) => store_failure(store_error),
        RegistryError::SessionNotFound => RelayError::from_code(ErrorCode::SessionNotFound),
        RegistryError::DuplicateConnection => {
            RelayError::from_code(ErrorCode::DuplicateConnection)
        }
        RegistryError::NotAParticipant => RelayError::from_code(ErrorCode::NotAParticipant),
    }
}
