#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

#[derive(Default)]
struct EngineData {
    sources: HashMap<String, String>,
    decisions: HashMap<String, Value>,
}

/// In-process stand-in for the external policy engine: stores Rego sources
/// by policy id and answers data queries with canned decision documents per
/// package. Sources containing the text `syntax error` fail compilation,
/// like a real engine would reject a broken module.
#[derive(Clone)]
pub struct FakeEngine {
    pub base_url: String,
    data: Arc<Mutex<EngineData>>,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let data = Arc::new(Mutex::new(EngineData::default()));

        let app = Router::new()
            .route(
                "/v1/policies/{id}",
                put(put_policy).get(get_policy).delete(delete_policy),
            )
            .route("/v1/data/{*path}", post(evaluate))
            .with_state(data.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake engine");
        let addr = listener.local_addr().expect("fake engine has no address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            data,
        }
    }

    /// Registers the decision document returned for `package` (dotted form).
    pub async fn set_decision(&self, package: &str, decision: Value) {
        self.data
            .lock()
            .await
            .decisions
            .insert(package.to_string(), decision);
    }

    pub async fn source(&self, policy_id: &str) -> Option<String> {
        self.data.lock().await.sources.get(policy_id).cloned()
    }
}

async fn put_policy(
    State(data): State<Arc<Mutex<EngineData>>>,
    Path(id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let has_package = body
        .lines()
        .any(|line| line.trim_start().starts_with("package"));
    if !has_package || body.contains("syntax error") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": "invalid_parameter",
                "message": "error(s) occurred while compiling module(s)",
                "errors": [{"code": "rego_parse_error", "message": "unexpected token"}]
            })),
        );
    }

    data.lock().await.sources.insert(id, body);
    (StatusCode::OK, Json(json!({})))
}

async fn get_policy(
    State(data): State<Arc<Mutex<EngineData>>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match data.lock().await.sources.get(&id) {
        Some(source) => (
            StatusCode::OK,
            Json(json!({"result": {"id": id, "raw": source}})),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "resource_not_found", "message": "policy not found"})),
        ),
    }
}

async fn delete_policy(
    State(data): State<Arc<Mutex<EngineData>>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match data.lock().await.sources.remove(&id) {
        Some(_) => (StatusCode::OK, Json(json!({}))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "resource_not_found", "message": "policy not found"})),
        ),
    }
}

async fn evaluate(
    State(data): State<Arc<Mutex<EngineData>>>,
    Path(path): Path<String>,
    _body: String,
) -> impl IntoResponse {
    let package = path.replace('/', ".");
    match data.lock().await.decisions.get(&package) {
        Some(decision) => Json(json!({"result": decision})),
        None => Json(json!({})),
    }
}
