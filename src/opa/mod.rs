use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

mod decision;

pub use decision::PolicyDecision;

#[derive(Debug, Error)]
pub enum OpaError {
    #[error("invalid rego source: {0}")]
    InvalidRego(String),
    #[error("policy not found in engine")]
    PolicyNotFound,
    #[error("policy engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine client error: {0}")]
    ClientInternal(String),
}

/// Error document returned by the engine on a failed request. The `errors`
/// entries are compiler diagnostics when a stored source does not parse.
#[derive(Debug, Default, Deserialize)]
struct EngineErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<Value>,
}

/// Narrow client over the engine's HTTP surface. Policies are stored and
/// fetched by id; evaluation is addressed by package path. Calls share one
/// configured timeout and are never retried.
#[derive(Debug, Clone)]
pub struct OpaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OpaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OpaError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OpaError::ClientInternal(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn policy_url(&self, policy_id: &str) -> String {
        format!("{}/v1/policies/{}", self.base_url, policy_id)
    }

    /// Stores or replaces the Rego source for `policy_id`.
    pub async fn store_policy(&self, policy_id: &str, rego: &str) -> Result<(), OpaError> {
        let response = self
            .http
            .put(self.policy_url(policy_id))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(rego.to_string())
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                Err(OpaError::InvalidRego(compile_diagnostics(&body)))
            }
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Fetches the raw Rego source stored under `policy_id`.
    pub async fn get_policy(&self, policy_id: &str) -> Result<String, OpaError> {
        let response = self
            .http
            .get(self.policy_url(policy_id))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(OpaError::PolicyNotFound),
            status => return Err(unexpected_status(status, response).await),
        }

        #[derive(Deserialize)]
        struct GetPolicyResult {
            raw: String,
        }
        #[derive(Deserialize)]
        struct GetPolicyResponse {
            result: GetPolicyResult,
        }

        let body: GetPolicyResponse = response
            .json()
            .await
            .map_err(|err| OpaError::ClientInternal(format!("failed to parse response: {err}")))?;
        Ok(body.result.raw)
    }

    /// Removes the Rego source stored under `policy_id`. Idempotent: a 404
    /// counts as success.
    pub async fn delete_policy(&self, policy_id: &str) -> Result<(), OpaError> {
        let response = self
            .http
            .delete(self.policy_url(policy_id))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Evaluates `package_name` against `input`. Returns `None` when the
    /// engine produced no decision (the package is undefined for this input).
    pub async fn evaluate_policy(
        &self,
        package_name: &str,
        input: Value,
    ) -> Result<Option<Map<String, Value>>, OpaError> {
        let url = format!(
            "{}/v1/data/{}",
            self.base_url,
            package_name.replace('.', "/")
        );
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(OpaError::PolicyNotFound),
            status => return Err(unexpected_status(status, response).await),
        }

        let mut body: Map<String, Value> = response
            .json()
            .await
            .map_err(|err| OpaError::ClientInternal(format!("failed to parse response: {err}")))?;

        match body.remove("result") {
            None => Ok(None),
            Some(Value::Object(result)) => Ok(Some(result)),
            Some(other) => Err(OpaError::ClientInternal(format!(
                "decision for package '{package_name}' is not an object: {other}"
            ))),
        }
    }
}

fn transport_error(err: reqwest::Error) -> OpaError {
    if err.is_builder() || err.is_decode() {
        OpaError::ClientInternal(err.to_string())
    } else {
        OpaError::Unavailable(err.to_string())
    }
}

async fn unexpected_status(status: StatusCode, response: reqwest::Response) -> OpaError {
    let body = response.text().await.unwrap_or_default();
    OpaError::Unavailable(format!("status {status}: {body}"))
}

fn compile_diagnostics(body: &str) -> String {
    let parsed: EngineErrorBody = serde_json::from_str(body).unwrap_or_default();
    if let Some(first) = parsed.errors.first() {
        return first.to_string();
    }
    if !parsed.message.is_empty() {
        return parsed.message;
    }
    body.to_string()
}
