//! Cache key helpers

/// Separator between the components of a cache key
pub const KEY_SEPARATOR: &str = "/";

/// Build a cache key of the form `<prefix>/<name>`.
///
/// Leading and trailing separators on either part are trimmed so that
/// `build_key("a/", "/b")` and `build_key("a", "b")` address the same entry.
#[must_use]
pub fn build_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
    let name = name.trim_start_matches(KEY_SEPARATOR);
    if prefix.is_empty() {
        return name.to_string();
    }
    format!("{prefix}{KEY_SEPARATOR}{name}")
}
