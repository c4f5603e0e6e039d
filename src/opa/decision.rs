use serde_json::{Map, Value};

/// The document a policy's main rule returns. Fields the policy did not set
/// keep their zero values; unexpected shapes are ignored rather than failing
/// the evaluation, since the engine has no schema for decisions.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecision {
    pub rejected: bool,
    pub rejection_reason: String,
    pub output_spec: Option<Map<String, Value>>,
    pub selected_provider: String,
}

impl PolicyDecision {
    pub fn from_result(result: &Map<String, Value>) -> Self {
        let mut decision = Self::default();

        if let Some(Value::Bool(rejected)) = result.get("rejected") {
            decision.rejected = *rejected;
        }
        if let Some(Value::String(reason)) = result.get("rejection_reason") {
            decision.rejection_reason = reason.clone();
        }
        if let Some(Value::Object(spec)) = result.get("output_spec") {
            decision.output_spec = Some(spec.clone());
        }
        if let Some(Value::String(provider)) = result.get("selected_provider") {
            decision.selected_provider = provider.clone();
        }

        decision
    }
}
