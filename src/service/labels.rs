use std::collections::BTreeMap;

/// AND semantics: every selector pair must appear identically in the request
/// labels; extra request labels are allowed. The empty selector matches
/// every request.
pub fn matches_label_selector(
    selector: &BTreeMap<String, String>,
    request_labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| request_labels.get(key) == Some(value))
}
