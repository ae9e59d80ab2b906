//! Filesystem-safe tokens from arbitrary workshop titles.

/// Characters that are reserved in file names on at least one platform.
const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Strip reserved and control characters, then trim spaces and dots from
/// both ends. Applying it twice yields the same string.
pub fn sanitize_file_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| !RESERVED.contains(c) && !c.is_control())
        .collect();
    kept.trim_matches(|c| c == ' ' || c == '.').to_string()
}
