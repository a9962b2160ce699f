//! Topic derivation from the configured prefix and the request path
//!
//! Paths are treated purely lexically: `.` and `..` segments are resolved,
//! repeated separators collapse, and a `..` can never climb above the root.

use std::borrow::Cow;

/// Lexically clean a slash-separated path.
///
/// - repeated `/` collapse into one
/// - `.` segments are dropped
/// - `..` removes the preceding segment; at the root it is dropped
/// - trailing `/` is removed unless the result is the root
///
/// An empty input cleans to `"."`.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // Relative paths keep leading `..`; rooted ones cannot go higher
                _ if !rooted => segments.push(".."),
                _ => {}
            },
            _ => segments.push(segment),
        }
    }

    let joined = segments.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join path elements with `/` and clean the result.
///
/// Empty elements are skipped; if every element is empty the result is empty.
pub fn join(elements: &[&str]) -> String {
    let parts: Vec<&str> = elements.iter().copied().filter(|e| !e.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    clean(&parts.join("/"))
}

/// Derive the broker topic for a request.
///
/// Returns `None` when the result would be empty, e.g. prefix `/` with path
/// `/` or a path whose `..` segments cancel everything out.
pub fn derive_topic(prefix: &str, path: &str) -> Option<String> {
    let joined = join(&[prefix, path]);
    let topic = joined.strip_prefix('/').unwrap_or(&joined);

    if topic.is_empty() || topic == "." {
        None
    } else {
        Some(topic.to_string())
    }
}

/// Percent-decode a raw request path.
///
/// Returns `None` if the decoded bytes are not valid UTF-8.
pub fn decode_path(raw: &str) -> Option<Cow<'_, str>> {
    urlencoding::decode(raw).ok()
}
