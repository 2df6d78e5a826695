//! Mapping of torrent-declared file paths onto safe relative filesystem
//! paths.
//!
//! Path elements in torrent metadata are attacker-controlled. This module is
//! the security boundary that neutralizes them: separators embedded in a
//! single element are replaced, trailing dots and spaces are stripped (which
//! also turns `.` and `..` into empty strings), and elements that end up
//! empty become a placeholder. Callers must never join unsanitized metadata
//! paths onto the download root themselves.

use std::path::PathBuf;

const PLACEHOLDER: &str = "_";

/// Sanitize one path element.
pub fn sanitize_component(component: &str) -> String {
    if component.trim().is_empty() {
        return PLACEHOLDER.to_owned();
    }
    let cleaned: String = component
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_end_matches(['.', ' ']);
    if cleaned.is_empty() {
        return PLACEHOLDER.to_owned();
    }
    cleaned.to_owned()
}

/// Turn a list of torrent path elements into a safe relative path.
pub fn sanitize_path<'a>(components: impl IntoIterator<Item = &'a str>) -> PathBuf {
    let mut buf = PathBuf::new();
    for component in components {
        buf.push(sanitize_component(component));
    }
    if buf.as_os_str().is_empty() {
        buf.push(PLACEHOLDER);
    }
    buf
}
