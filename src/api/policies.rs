use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::model::Policy;

use super::{parse_json_body, ApiError, AppState};

const COLLECTION_INSTANCE: &str = "/api/v1alpha1/policies";

fn policy_instance(id: &str) -> String {
    format!("/api/v1alpha1/policies/{id}")
}

#[derive(Deserialize)]
pub(super) struct CreateParams {
    id: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ListParams {
    filter: Option<String>,
    order_by: Option<String>,
    max_page_size: Option<i64>,
    page_token: Option<String>,
}

pub(super) async fn create_policy(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let policy: Policy = parse_json_body(&body, COLLECTION_INSTANCE)?;
    let created = state
        .policies
        .create_policy(policy, params.id)
        .await
        .map_err(|err| ApiError::from_service(err, COLLECTION_INSTANCE))?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(super) async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = state
        .policies
        .get_policy(&id)
        .await
        .map_err(|err| ApiError::from_service(err, &policy_instance(&id)))?;
    Ok(Json(policy))
}

pub(super) async fn list_policies(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let list = state
        .policies
        .list_policies(
            params.filter.as_deref(),
            params.order_by.as_deref(),
            params.page_token,
            params.max_page_size,
        )
        .await
        .map_err(|err| ApiError::from_service(err, COLLECTION_INSTANCE))?;
    Ok(Json(list))
}

pub(super) async fn update_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let instance = policy_instance(&id);
    let patch: Policy = parse_json_body(&body, &instance)?;
    let updated = state
        .policies
        .update_policy(&id, patch)
        .await
        .map_err(|err| ApiError::from_service(err, &instance))?;
    Ok(Json(updated))
}

pub(super) async fn delete_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .policies
        .delete_policy(&id)
        .await
        .map_err(|err| ApiError::from_service(err, &policy_instance(&id)))?;
    Ok(StatusCode::NO_CONTENT)
}
