use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::service::{PolicyService, ServiceError};

pub(crate) mod health;
mod policies;

#[derive(Clone)]
pub struct AppState {
    pub policies: PolicyService,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health::health))
        .route(
            "/policies",
            axum::routing::post(policies::create_policy).get(policies::list_policies),
        )
        .route(
            "/policies/{id}",
            get(policies::get_policy)
                .patch(policies::update_policy)
                .delete(policies::delete_policy),
        )
        .with_state(state);

    Router::new().nest("/api/v1alpha1", api)
}

/// RFC 7807 problem document; all non-2xx responses on both APIs carry one.
#[derive(Debug, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub status: u16,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    title: String,
    detail: Option<String>,
    instance: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>, instance: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            title: "Bad Request".to_string(),
            detail: Some(detail.into()),
            instance: instance.to_string(),
        }
    }

    /// Maps a service error onto its status code. Internal failures are
    /// logged here and reach the wire with a generic diagnostic only.
    pub fn from_service(err: ServiceError, instance: &str) -> Self {
        let status = match &err {
            ServiceError::InvalidArgument { .. } | ServiceError::FailedPrecondition { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::AlreadyExists { .. } | ServiceError::PolicyConflict { .. } => {
                StatusCode::CONFLICT
            }
            ServiceError::Rejected { .. } => StatusCode::NOT_ACCEPTABLE,
            ServiceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?err, "internal error");
            return Self {
                status,
                title: "Internal Server Error".to_string(),
                detail: Some("An unexpected error occurred".to_string()),
                instance: instance.to_string(),
            };
        }

        Self {
            status,
            title: err.message().to_string(),
            detail: Some(err.detail().to_string()),
            instance: instance.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = Problem {
            problem_type: "about:blank".to_string(),
            status: self.status.as_u16(),
            title: self.title,
            detail: self.detail,
            instance: Some(self.instance),
        };

        let mut response = (self.status, Json(problem)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Parses a JSON request body by hand so merge-patch content types are
/// accepted and malformed payloads come back as problem documents.
pub fn parse_json_body<T: DeserializeOwned>(
    body: &axum::body::Bytes,
    instance: &str,
) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("Request body is required", instance));
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Malformed request body: {err}"), instance))
}
