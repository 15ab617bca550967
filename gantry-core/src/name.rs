//! Peer and service name handling.
//!
//! A peer's full name is `<type>/<id>`, e.g. `hall/3`. Service names are
//! slash-delimited with non-empty segments; a leading slash is tolerated.

use crate::error::{GantryError, Result};

/// Build the wire name of a peer from its type and id.
#[must_use]
pub fn format_full_name(type_name: &str, id: i32) -> String {
    format!("{type_name}/{id}")
}

/// Split `<type>/<id>` back into its parts.
pub fn parse_full_name(full_name: &str) -> Result<(String, i32)> {
    let (type_name, id) = full_name
        .split_once('/')
        .ok_or(GantryError::InvalidArgs)?;
    if type_name.is_empty() {
        return Err(GantryError::InvalidArgs);
    }
    let id: i32 = id.parse().map_err(|_| GantryError::InvalidArgs)?;
    Ok((type_name.to_string(), id))
}

/// Split a slash-delimited name into segments, dropping one leading slash.
///
/// Every remaining segment must be non-empty.
pub fn split_segments(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(GantryError::InvalidArgs);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_roundtrip() {
        let full = format_full_name("hall", 42);
        assert_eq!(full, "hall/42");
        let (ty, id) = parse_full_name(&full).unwrap();
        assert_eq!(ty, "hall");
        assert_eq!(id, 42);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(parse_full_name("hall").is_err());
        assert!(parse_full_name("/3").is_err());
        assert!(parse_full_name("hall/x").is_err());
    }

    #[test]
    fn segments_tolerate_leading_slash_only() {
        assert_eq!(split_segments("/a/b").unwrap(), vec!["a", "b"]);
        assert_eq!(split_segments("a/b").unwrap(), vec!["a", "b"]);
        assert!(split_segments("a//b").is_err());
        assert!(split_segments("").unwrap().is_empty());
    }
}
