use crate::model::Policy;

/// Applies a merge-patch body onto the current policy, restricted to the
/// mutable fields. Read-only and immutable fields (id, path, policy_type,
/// create_time, update_time) are never taken from the patch; they are
/// checked against the current values beforehand.
pub fn merge_patch_onto_policy(patch: &Policy, existing: &Policy) -> Policy {
    let mut merged = existing.clone();

    if let Some(display_name) = &patch.display_name {
        merged.display_name = Some(display_name.clone());
    }
    if let Some(description) = &patch.description {
        merged.description = Some(description.clone());
    }
    if let Some(enabled) = patch.enabled {
        merged.enabled = Some(enabled);
    }
    if let Some(label_selector) = &patch.label_selector {
        merged.label_selector = Some(label_selector.clone());
    }
    if let Some(priority) = patch.priority {
        merged.priority = Some(priority);
    }
    if let Some(rego_code) = &patch.rego_code {
        merged.rego_code = Some(rego_code.clone());
    }

    merged
}
