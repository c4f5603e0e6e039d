use std::collections::HashMap;

use serde_json::{Map, Value};

/// Per-evaluation record of which document paths have been written by which
/// policy. Object keys join with `.`; arrays and scalars are single values
/// at their containing path, matching the engine's habit of returning whole
/// sub-documents.
#[derive(Debug, Default)]
pub struct ConstraintContext {
    set_by: HashMap<String, String>,
}

impl ConstraintContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_immutable(&mut self, field_path: &str, policy_id: &str) {
        self.set_by
            .insert(field_path.to_string(), policy_id.to_string());
    }

    pub fn is_immutable(&self, field_path: &str) -> bool {
        self.set_by.contains_key(field_path)
    }

    pub fn set_by(&self, field_path: &str) -> Option<&str> {
        self.set_by.get(field_path).map(String::as_str)
    }

    /// Compares `after` against `before` and freezes, on behalf of
    /// `policy_id`, every leaf whose value is new or changed. When a key
    /// becomes an object that was absent or non-object before, the whole
    /// object path is frozen and its children are not traversed.
    pub fn mark_changed_fields(
        &mut self,
        before: &Map<String, Value>,
        after: &Map<String, Value>,
        policy_id: &str,
    ) {
        self.mark_changed_fields_at("", before, after, policy_id);
    }

    fn mark_changed_fields_at(
        &mut self,
        prefix: &str,
        before: &Map<String, Value>,
        after: &Map<String, Value>,
        policy_id: &str,
    ) {
        for (key, after_value) in after {
            let field_path = join_path(prefix, key);
            match (before.get(key), after_value) {
                (Some(Value::Object(before_object)), Value::Object(after_object)) => {
                    self.mark_changed_fields_at(&field_path, before_object, after_object, policy_id);
                }
                (_, Value::Object(_)) => {
                    self.mark_immutable(&field_path, policy_id);
                }
                (before_value, _) => {
                    if !values_equal(before_value, after_value) {
                        self.mark_immutable(&field_path, policy_id);
                    }
                }
            }
        }
    }

    /// Collects every frozen path whose value in `after` differs from
    /// `before`, traversing the union of both documents so that removals of
    /// frozen paths are violations too. Children of a frozen object path are
    /// never individually frozen, so the parent covers them.
    pub fn check_violations(
        &self,
        before: &Map<String, Value>,
        after: &Map<String, Value>,
    ) -> Vec<String> {
        let mut violations = Vec::new();
        self.check_violations_at("", before, after, &mut violations);
        violations
    }

    fn check_violations_at(
        &self,
        prefix: &str,
        before: &Map<String, Value>,
        after: &Map<String, Value>,
        violations: &mut Vec<String>,
    ) {
        for (key, after_value) in after {
            let field_path = join_path(prefix, key);
            let before_value = before.get(key);

            if self.is_immutable(&field_path) && !values_equal(before_value, after_value) {
                violations.push(field_path.clone());
            }

            if let Value::Object(after_object) = after_value {
                if let Some(Value::Object(before_object)) = before_value {
                    self.check_violations_at(&field_path, before_object, after_object, violations);
                }
            }
        }

        // Keys dropped by the replacement document.
        for (key, before_value) in before {
            if after.contains_key(key) {
                continue;
            }
            let field_path = join_path(prefix, key);
            if self.is_immutable(&field_path) {
                violations.push(field_path);
            } else if let Value::Object(before_object) = before_value {
                self.check_violations_at(&field_path, before_object, &Map::new(), violations);
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn values_equal(before: Option<&Value>, after: &Value) -> bool {
    match before {
        Some(before) => loose_string(before) == loose_string(after),
        None => false,
    }
}

/// Loose, stringified equality: strings compare unquoted so a policy
/// re-asserting `"1"` over a frozen `1` is not a violation.
fn loose_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn mark_immutable_records_the_setting_policy() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("spec.provider", "policy-1");

        assert!(ctx.is_immutable("spec.provider"));
        assert_eq!(ctx.set_by("spec.provider"), Some("policy-1"));
        assert!(!ctx.is_immutable("spec.region"));
        assert_eq!(ctx.set_by("spec.region"), None);
    }

    #[test]
    fn unchanged_frozen_fields_are_not_violations() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("provider", "policy-1");

        let before = object(json!({"provider": "aws", "region": "us-east-1"}));
        let after = object(json!({"provider": "aws", "region": "us-east-1"}));
        assert!(ctx.check_violations(&before, &after).is_empty());
    }

    #[test]
    fn changing_a_frozen_field_is_a_violation() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("provider", "policy-1");

        let before = object(json!({"provider": "aws"}));
        let after = object(json!({"provider": "gcp"}));
        assert_eq!(ctx.check_violations(&before, &after), vec!["provider"]);
    }

    #[test]
    fn unfrozen_fields_may_change_freely() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("provider", "policy-1");

        let before = object(json!({"provider": "aws", "region": "us-east-1"}));
        let after = object(json!({"provider": "aws", "region": "us-west-2"}));
        assert!(ctx.check_violations(&before, &after).is_empty());
    }

    #[test]
    fn nested_frozen_fields_are_checked() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("compute.instance_type", "policy-1");

        let before = object(json!({"compute": {"instance_type": "t3.medium"}}));
        let after = object(json!({"compute": {"instance_type": "t3.large"}}));
        assert_eq!(
            ctx.check_violations(&before, &after),
            vec!["compute.instance_type"]
        );
    }

    #[test]
    fn multiple_violations_are_all_collected() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("provider", "policy-1");
        ctx.mark_immutable("region", "policy-1");

        let before = object(json!({"provider": "aws", "region": "us-east-1"}));
        let after = object(json!({"provider": "gcp", "region": "us-west-2"}));
        let mut violations = ctx.check_violations(&before, &after);
        violations.sort();
        assert_eq!(violations, vec!["provider", "region"]);
    }

    #[test]
    fn removing_a_frozen_field_is_a_violation() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("region", "policy-1");

        let before = object(json!({"provider": "aws", "region": "us-east-1"}));
        let after = object(json!({"provider": "aws"}));
        assert_eq!(ctx.check_violations(&before, &after), vec!["region"]);
    }

    #[test]
    fn removing_a_subtree_flags_its_frozen_descendants() {
        let mut ctx = ConstraintContext::new();
        ctx.mark_immutable("compute.instance_type", "policy-1");

        let before = object(json!({"compute": {"instance_type": "t3.medium"}}));
        let after = object(json!({}));
        assert_eq!(
            ctx.check_violations(&before, &after),
            vec!["compute.instance_type"]
        );
    }

    #[test]
    fn marks_changed_top_level_fields_only() {
        let mut ctx = ConstraintContext::new();
        let before = object(json!({"provider": "aws", "region": "us-east-1"}));
        let after = object(json!({"provider": "aws", "region": "us-west-2"}));

        ctx.mark_changed_fields(&before, &after, "policy-1");

        assert!(!ctx.is_immutable("provider"));
        assert!(ctx.is_immutable("region"));
        assert_eq!(ctx.set_by("region"), Some("policy-1"));
    }

    #[test]
    fn marks_changed_nested_fields_individually() {
        let mut ctx = ConstraintContext::new();
        let before = object(json!({"compute": {"instance_type": "t3.medium", "disk_size": 100}}));
        let after = object(json!({"compute": {"instance_type": "t3.large", "disk_size": 100}}));

        ctx.mark_changed_fields(&before, &after, "policy-1");

        assert!(ctx.is_immutable("compute.instance_type"));
        assert!(!ctx.is_immutable("compute.disk_size"));
        assert!(!ctx.is_immutable("compute"));
    }

    #[test]
    fn marks_newly_added_fields() {
        let mut ctx = ConstraintContext::new();
        let before = object(json!({"provider": "aws"}));
        let after = object(json!({"provider": "aws", "region": "us-east-1"}));

        ctx.mark_changed_fields(&before, &after, "policy-1");
        assert!(ctx.is_immutable("region"));
    }

    #[test]
    fn marks_whole_object_when_the_shape_changes() {
        let mut ctx = ConstraintContext::new();
        let before = object(json!({"compute": "simple"}));
        let after = object(json!({"compute": {"instance_type": "t3.medium"}}));

        ctx.mark_changed_fields(&before, &after, "policy-1");

        assert!(ctx.is_immutable("compute"));
        assert!(!ctx.is_immutable("compute.instance_type"));
    }

    #[test]
    fn string_and_number_with_equal_rendering_are_not_a_change() {
        let mut ctx = ConstraintContext::new();
        let before = object(json!({"count": 1}));
        let after = object(json!({"count": "1"}));

        ctx.mark_changed_fields(&before, &after, "policy-1");
        assert!(!ctx.is_immutable("count"));
    }

    #[test]
    fn later_policies_never_reattribute_frozen_fields() {
        let mut ctx = ConstraintContext::new();
        let empty = Map::new();
        let first = object(json!({"region": "us-east-1"}));
        ctx.mark_changed_fields(&empty, &first, "policy-1");

        // A later policy re-asserting the same value leaves attribution alone.
        let second = object(json!({"region": "us-east-1", "zone": "a"}));
        ctx.mark_changed_fields(&first, &second, "policy-2");

        assert_eq!(ctx.set_by("region"), Some("policy-1"));
        assert_eq!(ctx.set_by("zone"), Some("policy-2"));
    }
}
