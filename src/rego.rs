use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegoParseError {
    #[error("no package declaration found in rego source")]
    NoPackageDeclaration,
    #[error("empty package declaration")]
    EmptyPackageDeclaration,
}

/// Extracts the dotted package path declared by a Rego source, e.g.
/// `policies.cost_control`. The first line that is neither blank nor a `#`
/// comment must be the package declaration; everything else is left to the
/// engine's own compiler.
pub fn extract_package_name(rego: &str) -> Result<String, RegoParseError> {
    for line in rego.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(rest) = trimmed.strip_prefix("package") else {
            return Err(RegoParseError::NoPackageDeclaration);
        };
        if rest.is_empty() {
            return Err(RegoParseError::EmptyPackageDeclaration);
        }
        if !rest.starts_with(char::is_whitespace) {
            // e.g. `packagefoo`, an ordinary identifier
            return Err(RegoParseError::NoPackageDeclaration);
        }

        // Strip a trailing comment (`package test # note`).
        let name = match rest.find('#') {
            Some(idx) => rest[..idx].trim(),
            None => rest.trim(),
        };
        if name.is_empty() {
            return Err(RegoParseError::EmptyPackageDeclaration);
        }
        return Ok(name.to_string());
    }

    Err(RegoParseError::NoPackageDeclaration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_package_name() {
        let rego = "package test\n\nallow {\n    true\n}";
        assert_eq!(extract_package_name(rego).unwrap(), "test");
    }

    #[test]
    fn extracts_namespaced_package_name() {
        let rego = "package policies.my_policy\n\nallow { true }";
        assert_eq!(extract_package_name(rego).unwrap(), "policies.my_policy");
    }

    #[test]
    fn extracts_multi_level_namespace() {
        let rego = "package a.b.c\n";
        assert_eq!(extract_package_name(rego).unwrap(), "a.b.c");
    }

    #[test]
    fn strips_trailing_comment() {
        let rego = "package test # this is a comment\n\nallow { true }";
        assert_eq!(extract_package_name(rego).unwrap(), "test");
    }

    #[test]
    fn tolerates_extra_whitespace_after_keyword() {
        let rego = "package   test\n";
        assert_eq!(extract_package_name(rego).unwrap(), "test");
    }

    #[test]
    fn skips_leading_blank_and_comment_lines() {
        let rego = "# header comment\n# another\n\npackage test\n";
        assert_eq!(extract_package_name(rego).unwrap(), "test");
    }

    #[test]
    fn rejects_source_without_package() {
        let rego = "allow {\n    true\n}";
        assert_eq!(
            extract_package_name(rego),
            Err(RegoParseError::NoPackageDeclaration)
        );
    }

    #[test]
    fn rejects_bare_package_keyword() {
        let rego = "package\n\nallow { true }";
        assert_eq!(
            extract_package_name(rego),
            Err(RegoParseError::EmptyPackageDeclaration)
        );
    }

    #[test]
    fn rejects_package_with_only_comment() {
        let rego = "package # nothing here\n";
        assert_eq!(
            extract_package_name(rego),
            Err(RegoParseError::EmptyPackageDeclaration)
        );
    }

    #[test]
    fn rejects_comment_only_source() {
        let rego = "# just comments\n# no declaration";
        assert_eq!(
            extract_package_name(rego),
            Err(RegoParseError::NoPackageDeclaration)
        );
    }

    #[test]
    fn rejects_empty_source() {
        assert_eq!(
            extract_package_name(""),
            Err(RegoParseError::NoPackageDeclaration)
        );
    }
}
