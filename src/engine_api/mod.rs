use axum::body::Bytes;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::{parse_json_body, ApiError};
use crate::model::{EvaluateRequestBody, EvaluateResponseBody, ServiceInstance};
use crate::service::evaluation::extract_request_labels;
use crate::service::{EvaluationRequest, EvaluationService};

const EVALUATE_INSTANCE: &str = "/api/v1alpha1/policies:evaluateRequest";

#[derive(Clone)]
pub struct EngineState {
    pub evaluation: EvaluationService,
}

pub fn router(state: EngineState) -> Router {
    let api = Router::new()
        .route("/health", get(crate::api::health::health))
        .route("/policies:evaluateRequest", post(evaluate_request))
        .with_state(state);

    Router::new().nest("/api/v1alpha1", api)
}

async fn evaluate_request(
    State(state): State<EngineState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: EvaluateRequestBody = parse_json_body(&body, EVALUATE_INSTANCE)?;

    let request = EvaluationRequest {
        request_labels: extract_request_labels(&body.service_instance.spec),
        service_instance: body.service_instance.spec,
    };

    let response = state
        .evaluation
        .evaluate_request(request)
        .await
        .map_err(|err| ApiError::from_service(err, EVALUATE_INSTANCE))?;

    Ok(Json(EvaluateResponseBody {
        evaluated_service_instance: ServiceInstance {
            spec: response.evaluated_service_instance,
        },
        selected_provider: response.selected_provider,
        status: response.status,
    }))
}
