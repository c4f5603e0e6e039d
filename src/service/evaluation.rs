use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::AnyPool;
use tracing::debug;

use super::constraints::ConstraintContext;
use super::labels::matches_label_selector;
use super::{validation, ServiceError};
use crate::db::{self, PolicyFilter, PolicyListOptions};
use crate::model::EvaluationStatus;
use crate::opa::{OpaClient, PolicyDecision};

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub service_instance: Map<String, Value>,
    pub request_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EvaluationResponse {
    pub evaluated_service_instance: Map<String, Value>,
    pub selected_provider: String,
    pub status: EvaluationStatus,
}

/// Runs the evaluation pipeline: a strictly sequential fold of the enabled
/// policies, in the store's deterministic total order, over the service
/// instance document. Each stage observes the document and provider produced
/// by all earlier stages; the constraint context is the accumulator that
/// turns ordering conflicts into diagnosable errors.
#[derive(Clone)]
pub struct EvaluationService {
    pool: AnyPool,
    opa: Arc<OpaClient>,
}

impl EvaluationService {
    pub fn new(pool: AnyPool, opa: Arc<OpaClient>) -> Self {
        Self { pool, opa }
    }

    pub async fn evaluate_request(
        &self,
        request: EvaluationRequest,
    ) -> Result<EvaluationResponse, ServiceError> {
        let page = db::list_policies(
            &self.pool,
            &PolicyListOptions {
                filter: PolicyFilter {
                    enabled: Some(true),
                    ..Default::default()
                },
                // One page at the ceiling retrieves the whole registry.
                page_size: validation::MAX_PAGE_SIZE,
                ..Default::default()
            },
        )
        .await
        .map_err(|err| {
            ServiceError::internal(
                "Failed to retrieve policies",
                err.to_string(),
                Some(Box::new(err)),
            )
        })?;

        let original_spec = request.service_instance.clone();
        let mut current_spec = request.service_instance;
        let mut constraint_ctx = ConstraintContext::new();
        let mut selected_provider = String::new();

        for policy in &page.policies {
            if !matches_label_selector(&policy.label_selector, &request.request_labels) {
                debug!(policy_id = %policy.id, "label selector does not match, skipping policy");
                continue;
            }

            let mut input = Map::new();
            input.insert("spec".to_string(), Value::Object(current_spec.clone()));
            input.insert(
                "provider".to_string(),
                Value::String(selected_provider.clone()),
            );

            let result = self
                .opa
                .evaluate_policy(&policy.package_name, Value::Object(input))
                .await
                .map_err(|err| {
                    let detail = err.to_string();
                    ServiceError::internal(
                        format!("Failed to evaluate policy '{}'", policy.id),
                        detail,
                        Some(Box::new(err)),
                    )
                })?;

            let Some(result) = result else {
                debug!(policy_id = %policy.id, "policy returned no decision, skipping");
                continue;
            };

            let decision = PolicyDecision::from_result(&result);

            if decision.rejected {
                return Err(ServiceError::rejected(
                    &policy.id,
                    &decision.rejection_reason,
                ));
            }

            if let Some(output_spec) = decision.output_spec {
                let violations = constraint_ctx.check_violations(&current_spec, &output_spec);
                if let Some(field) = violations.first() {
                    let higher = constraint_ctx.set_by(field).unwrap_or_default().to_string();
                    return Err(ServiceError::policy_conflict(&policy.id, field, &higher));
                }

                constraint_ctx.mark_changed_fields(&current_spec, &output_spec, &policy.id);
                // The decision carries the full replacement document, not a
                // merge fragment.
                current_spec = output_spec;
            }

            if !decision.selected_provider.is_empty() {
                selected_provider = decision.selected_provider;
            }
        }

        // Structural equality is canonical: object key order is irrelevant.
        let status = if current_spec == original_spec {
            EvaluationStatus::Approved
        } else {
            EvaluationStatus::Modified
        };

        Ok(EvaluationResponse {
            evaluated_service_instance: current_spec,
            selected_provider,
            status,
        })
    }
}

/// Pulls the request labels out of `spec.metadata.labels`, keeping only
/// string values.
pub fn extract_request_labels(spec: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(Value::Object(metadata)) = spec.get("metadata") {
        if let Some(Value::Object(raw_labels)) = metadata.get("labels") {
            for (key, value) in raw_labels {
                if let Value::String(text) = value {
                    labels.insert(key.clone(), text.clone());
                }
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn extracts_string_labels_from_metadata() {
        let spec = object(json!({
            "metadata": {
                "labels": {"env": "prod", "team": "backend", "replicas": 3}
            },
            "region": "us-east-1"
        }));

        let labels = extract_request_labels(&spec);
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(labels.get("team").map(String::as_str), Some("backend"));
        // Non-string values are dropped.
        assert!(!labels.contains_key("replicas"));
    }

    #[test]
    fn missing_metadata_or_labels_yields_empty_labels() {
        assert!(extract_request_labels(&object(json!({}))).is_empty());
        assert!(extract_request_labels(&object(json!({"metadata": {}}))).is_empty());
        assert!(extract_request_labels(&object(json!({"metadata": "oops"}))).is_empty());
    }
}
