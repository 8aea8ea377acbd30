//! Blob key helpers. Keys always use `/` regardless of platform.

pub const DELIMITER: &str = "/";

/// Joins two key fragments with a single delimiter.
///
/// An empty side is dropped, so joining onto the bucket root yields the suffix.
pub fn join(prefix: &str, suffix: &str) -> String {
    let prefix = trim_trailing_delimiter(prefix);
    let suffix = suffix.trim_start_matches(DELIMITER);

    match (prefix.is_empty(), suffix.is_empty()) {
        (true, _) => suffix.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}{DELIMITER}{suffix}"),
    }
}

/// Strips `prefix/` from `path`, or returns `None` if `path` is not below `prefix`.
pub fn trim_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)?.strip_prefix(DELIMITER)
}

pub fn trim_trailing_delimiter(path: &str) -> &str {
    path.strip_suffix(DELIMITER).unwrap_or(path)
}
