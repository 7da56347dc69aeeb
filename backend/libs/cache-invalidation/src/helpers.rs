//! Helper functions for derived cache key templates

/// Placeholder replaced by the event subject in key templates.
pub const SUBJECT_PLACEHOLDER: &str = "{subject}";

/// Render a key template for a subject
///
/// # Example
///
/// ```
/// use cache_invalidation::render_key_template;
///
/// assert_eq!(render_key_template("usage:daily:{subject}", "42"), "usage:daily:42");
/// assert_eq!(render_key_template("usage:top:last24h", "42"), "usage:top:last24h");
/// ```
pub fn render_key_template(template: &str, subject: &str) -> String {
    template.replace(SUBJECT_PLACEHOLDER, subject)
}

/// Validate key template format
///
/// A template is a non-empty `:`-separated key without empty segments,
/// whose only brace group is `{subject}`.
///
/// # Example
///
/// ```
/// use cache_invalidation::validate_key_template;
///
/// assert!(validate_key_template("usage:daily:{subject}"));
/// assert!(validate_key_template("usage:top:last24h"));
/// assert!(!validate_key_template("usage:{client}"));
/// assert!(!validate_key_template("usage::x"));
/// assert!(!validate_key_template(""));
/// ```
pub fn validate_key_template(template: &str) -> bool {
    if template.is_empty() || template.split(':').any(|segment| segment.is_empty()) {
        return false;
    }

    let stripped = template.replace(SUBJECT_PLACEHOLDER, "");
    !stripped.contains('{') && !stripped.contains('}')
}
