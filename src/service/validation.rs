use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use super::ServiceError;
use crate::db::PolicyFilter;
use crate::model::Policy;

pub const MIN_PRIORITY: i64 = 1;
pub const MAX_PRIORITY: i64 = 1000;
pub const DEFAULT_PRIORITY: i64 = 500;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 1000;

// AEP-122 resource-id shape: 1-63 chars, lowercase alphanumerics and
// hyphens, starting with a letter and ending with a letter or digit.
static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

/// Required fields for create: display_name, policy_type, rego_code; the
/// schema itself marks everything optional.
pub fn validate_create_input(policy: &Policy) -> Result<(), ServiceError> {
    if policy
        .display_name
        .as_deref()
        .is_none_or(|name| name.trim().is_empty())
    {
        return Err(ServiceError::invalid_argument(
            "display_name is required",
            "The display_name field must be present and non-empty",
        ));
    }

    if policy.policy_type.is_none() {
        return Err(ServiceError::invalid_argument(
            "policy_type is required",
            "The policy_type field must be present (GLOBAL or USER)",
        ));
    }

    if policy
        .rego_code
        .as_deref()
        .is_none_or(|rego| rego.trim().is_empty())
    {
        return Err(ServiceError::invalid_argument(
            "rego_code is required",
            "The rego_code field must be present and non-empty",
        ));
    }

    validate_priority(policy.priority)
}

/// Validates a client-supplied id, or mints a UUID when none was given.
pub fn resolve_policy_id(client_id: Option<&str>) -> Result<String, ServiceError> {
    match client_id {
        Some(id) if !id.is_empty() => {
            if !ID_PATTERN.is_match(id) {
                return Err(ServiceError::invalid_argument(
                    "Invalid policy ID format",
                    format!(
                        "Policy ID '{id}' does not match required format: 1-63 characters, \
                         start with lowercase letter, contain only lowercase letters, numbers, \
                         and hyphens, end with letter or number"
                    ),
                ));
            }
            Ok(id.to_string())
        }
        _ => Ok(Uuid::new_v4().to_string()),
    }
}

pub fn validate_priority(priority: Option<i64>) -> Result<(), ServiceError> {
    if let Some(priority) = priority {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(ServiceError::invalid_argument(
                "priority must be between 1 and 1000",
                "The priority field must be a value between 1 and 1000",
            ));
        }
    }
    Ok(())
}

pub fn validate_patch_input(patch: &Policy) -> Result<(), ServiceError> {
    if let Some(rego) = patch.rego_code.as_deref() {
        if rego.trim().is_empty() {
            return Err(ServiceError::invalid_argument(
                "rego_code cannot be empty",
                "When rego_code is provided in the patch it must be non-empty",
            ));
        }
    }
    validate_priority(patch.priority)
}

/// Read-only and immutable fields may appear in a patch, but only with their
/// current values; each mismatch carries its own message so the caller can
/// tell which field it tripped on.
pub fn validate_patch_immutable_fields(
    patch: &Policy,
    existing: &Policy,
) -> Result<(), ServiceError> {
    if patch.path.is_some() && patch.path != existing.path {
        return Err(ServiceError::invalid_argument(
            "path cannot be updated",
            "The path field is read-only and cannot be changed",
        ));
    }
    if patch.id.is_some() && patch.id != existing.id {
        return Err(ServiceError::invalid_argument(
            "id cannot be updated",
            "The id field is read-only and cannot be changed",
        ));
    }
    if patch.policy_type.is_some() && patch.policy_type != existing.policy_type {
        return Err(ServiceError::invalid_argument(
            "policy_type is immutable",
            "The policy_type field cannot be changed after creation",
        ));
    }
    if patch.create_time.is_some() && patch.create_time != existing.create_time {
        return Err(ServiceError::invalid_argument(
            "create_time cannot be updated",
            "The create_time field is read-only and cannot be changed",
        ));
    }
    if patch.update_time.is_some() && patch.update_time != existing.update_time {
        return Err(ServiceError::invalid_argument(
            "update_time cannot be updated",
            "The update_time field is read-only and cannot be changed",
        ));
    }
    Ok(())
}

/// Parses the list filter: a conjunction of at most two clauses joined by a
/// single `AND`, where each clause is `policy_type='GLOBAL'|'USER'` or
/// `enabled=true|false`.
pub fn parse_filter(filter: &str) -> Result<PolicyFilter, ServiceError> {
    let tokens: Vec<&str> = filter.split_whitespace().collect();
    let clauses: Vec<&str> = match tokens.as_slice() {
        [clause] => vec![clause],
        [first, and, second] if *and == "AND" => vec![first, second],
        _ => {
            return Err(ServiceError::invalid_argument(
                "Invalid filter expression",
                format!(
                    "Filter must be one or two predicates joined by AND, got '{}'",
                    filter.trim()
                ),
            ))
        }
    };

    let mut parsed = PolicyFilter::default();
    for clause in clauses {
        if let Some(value) = clause.strip_prefix("policy_type=") {
            parsed.policy_type = Some(parse_policy_type_literal(value)?);
        } else if let Some(value) = clause.strip_prefix("enabled=") {
            parsed.enabled = Some(parse_enabled_literal(value)?);
        } else {
            return Err(ServiceError::invalid_argument(
                "Invalid filter expression",
                format!("Unsupported filter predicate '{clause}'"),
            ));
        }
    }
    Ok(parsed)
}

fn parse_policy_type_literal(value: &str) -> Result<String, ServiceError> {
    match value {
        "'GLOBAL'" => Ok("GLOBAL".to_string()),
        "'USER'" => Ok("USER".to_string()),
        _ => Err(ServiceError::invalid_argument(
            "Invalid filter expression",
            format!("policy_type must be 'GLOBAL' or 'USER', got {value}"),
        )),
    }
}

fn parse_enabled_literal(value: &str) -> Result<bool, ServiceError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ServiceError::invalid_argument(
            "Invalid filter expression",
            format!("enabled must be true or false, got {value}"),
        )),
    }
}

const ORDER_BY_FIELDS: [&str; 4] = ["priority", "display_name", "create_time", "update_time"];

/// Parses the order_by parameter into the verbatim ordering handed to the
/// store, e.g. `priority DESC`. An empty input means the store default.
/// `id` is not an allowed sort key; it is already the implicit tie-break.
pub fn parse_order_by(order_by: &str) -> Result<Option<String>, ServiceError> {
    let tokens: Vec<&str> = order_by.split_whitespace().collect();
    let (field, direction) = match tokens.as_slice() {
        [] => return Ok(None),
        [field] => (*field, "asc"),
        [field, direction] => (*field, *direction),
        _ => {
            return Err(ServiceError::invalid_argument(
                "Invalid order_by expression",
                format!("order_by must be a field with an optional direction, got '{order_by}'"),
            ))
        }
    };

    if !ORDER_BY_FIELDS.contains(&field) {
        return Err(ServiceError::invalid_argument(
            "Invalid order_by expression",
            format!("'{field}' is not a sortable field"),
        ));
    }
    let direction = match direction {
        "asc" => "ASC",
        "desc" => "DESC",
        _ => {
            return Err(ServiceError::invalid_argument(
                "Invalid order_by expression",
                format!("Sort direction must be asc or desc, got '{direction}'"),
            ))
        }
    };

    Ok(Some(format!("{field} {direction}")))
}

/// Default 50, maximum 1000.
pub fn resolve_page_size(max_page_size: Option<i64>) -> Result<i64, ServiceError> {
    match max_page_size {
        None => Ok(DEFAULT_PAGE_SIZE),
        Some(size) if size < 1 => Err(ServiceError::invalid_argument(
            "Invalid page size",
            "Page size must be at least 1",
        )),
        Some(size) if size > MAX_PAGE_SIZE => Err(ServiceError::invalid_argument(
            "Invalid page size",
            "Page size must not exceed 1000",
        )),
        Some(size) => Ok(size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolicyType;

    fn create_input() -> Policy {
        Policy {
            display_name: Some("Test Policy".to_string()),
            policy_type: Some(PolicyType::Global),
            rego_code: Some("package test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn create_input_requires_display_name() {
        let mut policy = create_input();
        policy.display_name = Some("   ".to_string());
        let err = validate_create_input(&policy).unwrap_err();
        assert!(err.message().contains("display_name"));
    }

    #[test]
    fn create_input_requires_policy_type() {
        let mut policy = create_input();
        policy.policy_type = None;
        let err = validate_create_input(&policy).unwrap_err();
        assert!(err.message().contains("policy_type"));
    }

    #[test]
    fn create_input_requires_rego_code() {
        let mut policy = create_input();
        policy.rego_code = Some("  \n\t ".to_string());
        let err = validate_create_input(&policy).unwrap_err();
        assert!(err.message().contains("rego_code"));
    }

    #[test]
    fn priority_bounds_are_inclusive() {
        assert!(validate_priority(Some(1)).is_ok());
        assert!(validate_priority(Some(1000)).is_ok());
        assert!(validate_priority(Some(0)).is_err());
        assert!(validate_priority(Some(1001)).is_err());
        assert!(validate_priority(None).is_ok());
    }

    #[test]
    fn client_ids_must_match_the_resource_id_shape() {
        assert_eq!(resolve_policy_id(Some("my-policy-1")).unwrap(), "my-policy-1");
        assert_eq!(resolve_policy_id(Some("a")).unwrap(), "a");
        assert!(resolve_policy_id(Some("My-Policy")).is_err());
        assert!(resolve_policy_id(Some("1starts-with-digit")).is_err());
        assert!(resolve_policy_id(Some("ends-with-hyphen-")).is_err());
        assert!(resolve_policy_id(Some(&"a".repeat(64))).is_err());
        assert!(resolve_policy_id(Some(&"a".repeat(63))).is_ok());
    }

    #[test]
    fn missing_client_id_generates_a_uuid() {
        let id = resolve_policy_id(None).unwrap();
        assert_eq!(id.len(), 36);
        let other = resolve_policy_id(None).unwrap();
        assert_ne!(id, other);
    }

    #[test]
    fn patch_may_repeat_immutable_fields_with_current_values() {
        let existing = Policy {
            id: Some("p1".to_string()),
            path: Some("policies/p1".to_string()),
            policy_type: Some(PolicyType::Global),
            ..Default::default()
        };
        let patch = Policy {
            id: Some("p1".to_string()),
            policy_type: Some(PolicyType::Global),
            ..Default::default()
        };
        assert!(validate_patch_immutable_fields(&patch, &existing).is_ok());
    }

    #[test]
    fn patch_may_not_change_policy_type() {
        let existing = Policy {
            policy_type: Some(PolicyType::Global),
            ..Default::default()
        };
        let patch = Policy {
            policy_type: Some(PolicyType::User),
            ..Default::default()
        };
        let err = validate_patch_immutable_fields(&patch, &existing).unwrap_err();
        assert!(err.message().contains("policy_type"));
    }

    #[test]
    fn patch_may_not_change_id_or_path() {
        let existing = Policy {
            id: Some("p1".to_string()),
            path: Some("policies/p1".to_string()),
            ..Default::default()
        };
        let patch = Policy {
            id: Some("p2".to_string()),
            ..Default::default()
        };
        assert!(validate_patch_immutable_fields(&patch, &existing).is_err());

        let patch = Policy {
            path: Some("policies/p2".to_string()),
            ..Default::default()
        };
        assert!(validate_patch_immutable_fields(&patch, &existing).is_err());
    }

    #[test]
    fn filter_parses_single_and_double_clauses() {
        let parsed = parse_filter("policy_type='GLOBAL'").unwrap();
        assert_eq!(parsed.policy_type.as_deref(), Some("GLOBAL"));
        assert_eq!(parsed.enabled, None);

        let parsed = parse_filter("policy_type='USER' AND enabled=true").unwrap();
        assert_eq!(parsed.policy_type.as_deref(), Some("USER"));
        assert_eq!(parsed.enabled, Some(true));

        let parsed = parse_filter("enabled=false").unwrap();
        assert_eq!(parsed.enabled, Some(false));
    }

    #[test]
    fn filter_rejects_unknown_predicates_and_extra_clauses() {
        assert!(parse_filter("priority=1").is_err());
        assert!(parse_filter("policy_type='OTHER'").is_err());
        assert!(parse_filter("enabled=yes").is_err());
        assert!(parse_filter("enabled=true AND enabled=false AND policy_type='USER'").is_err());
        assert!(parse_filter("enabled=true OR enabled=false").is_err());
    }

    #[test]
    fn order_by_parses_allowed_fields_and_directions() {
        assert_eq!(parse_order_by("").unwrap(), None);
        assert_eq!(
            parse_order_by("priority").unwrap().as_deref(),
            Some("priority ASC")
        );
        assert_eq!(
            parse_order_by("display_name desc").unwrap().as_deref(),
            Some("display_name DESC")
        );
        assert_eq!(
            parse_order_by("update_time asc").unwrap().as_deref(),
            Some("update_time ASC")
        );
    }

    #[test]
    fn order_by_rejects_id_unknown_fields_and_extra_tokens() {
        assert!(parse_order_by("id").is_err());
        assert!(parse_order_by("package_name").is_err());
        assert!(parse_order_by("priority downwards").is_err());
        assert!(parse_order_by("priority asc extra").is_err());
    }

    #[test]
    fn page_size_bounds() {
        assert_eq!(resolve_page_size(None).unwrap(), 50);
        assert_eq!(resolve_page_size(Some(1)).unwrap(), 1);
        assert_eq!(resolve_page_size(Some(1000)).unwrap(), 1000);
        assert!(resolve_page_size(Some(0)).is_err());
        assert!(resolve_page_size(Some(1001)).is_err());
    }
}
