//! Relative URL resolution for tileset documents.
//!
//! Tile content URIs inside a tileset document are relative to the document
//! that declared them. This module resolves them against a context's base
//! URL without pulling in a full URL parser; the subset handled here is the
//! subset tileset documents actually use (absolute URLs, host-absolute
//! paths, and plain relative paths, with optional query preservation).

/// Resolves `relative` against `base`.
///
/// # Arguments
///
/// * `base` - The URL of the document that referenced `relative`
/// * `relative` - The reference to resolve (may already be absolute)
/// * `preserve_query` - When true, the query string of `base` is appended to
///   the resolved URL (used by hosting endpoints whose access token rides in
///   the query)
pub fn resolve(base: &str, relative: &str, preserve_query: bool) -> String {
    let (base_path, base_query) = split_query(base);

    let mut resolved = if has_scheme(relative) {
        relative.to_string()
    } else if let Some(rest) = relative.strip_prefix('/') {
        // Host-absolute path: keep scheme + authority of the base.
        match authority_end(base_path) {
            Some(end) => format!("{}/{}", &base_path[..end], rest),
            None => relative.to_string(),
        }
    } else {
        // Path-relative: replace everything after the last '/' of the base.
        match base_path.rfind('/') {
            Some(idx) if idx > authority_end(base_path).unwrap_or(0).saturating_sub(1) => {
                format!("{}/{}", &base_path[..idx], relative)
            }
            _ => format!("{}/{}", base_path, relative),
        }
    };
    resolved = remove_dot_segments(&resolved);

    if preserve_query {
        if let Some(query) = base_query {
            resolved = append_query_string(&resolved, query);
        }
    }

    resolved
}

/// Appends a `key=value` pair to the query string of `url`.
pub fn add_query(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, separator, key, value)
}

fn append_query_string(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query)
}

/// Collapses `.` and `..` segments in the path component.
fn remove_dot_segments(url: &str) -> String {
    let Some(path_start) = authority_end(url) else {
        return url.to_string();
    };
    if path_start >= url.len() {
        return url.to_string();
    }

    let (prefix, path) = url.split_at(path_start);
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("{}{}", prefix, segments.join("/"))
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn has_scheme(url: &str) -> bool {
    url.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    })
}

/// Returns the byte offset of the end of the scheme + authority component,
/// i.e. the position of the first path '/' after `scheme://host`.
fn authority_end(url: &str) -> Option<usize> {
    let after_scheme = url.find("://")? + 3;
    match url[after_scheme..].find('/') {
        Some(idx) => Some(after_scheme + idx),
        None => Some(url.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_path() {
        assert_eq!(
            resolve("https://example.com/tilesets/city/tileset.json", "tiles/0.b3dm", false),
            "https://example.com/tilesets/city/tiles/0.b3dm"
        );
    }

    #[test]
    fn test_resolve_absolute_url_passthrough() {
        assert_eq!(
            resolve("https://example.com/a/tileset.json", "https://cdn.example.com/0.glb", false),
            "https://cdn.example.com/0.glb"
        );
    }

    #[test]
    fn test_resolve_host_absolute_path() {
        assert_eq!(
            resolve("https://example.com/a/b/tileset.json", "/static/0.pnts", false),
            "https://example.com/static/0.pnts"
        );
    }

    #[test]
    fn test_resolve_preserves_query() {
        assert_eq!(
            resolve("https://assets.example.com/1/?v=abc", "layer.json", true),
            "https://assets.example.com/1/layer.json?v=abc"
        );
    }

    #[test]
    fn test_resolve_base_without_path() {
        assert_eq!(
            resolve("https://example.com", "tileset.json", false),
            "https://example.com/tileset.json"
        );
    }

    #[test]
    fn test_resolve_collapses_dot_segments() {
        assert_eq!(
            resolve("https://terrain.example.com/world/layer.json", "../base/layer.json", false),
            "https://terrain.example.com/base/layer.json"
        );
        assert_eq!(
            resolve("https://example.com/a/b/tileset.json", "./c/tile.b3dm", false),
            "https://example.com/a/b/c/tile.b3dm"
        );
    }

    #[test]
    fn test_add_query_first_parameter() {
        assert_eq!(
            add_query("https://example.com/t.terrain", "extensions", "octvertexnormals"),
            "https://example.com/t.terrain?extensions=octvertexnormals"
        );
    }

    #[test]
    fn test_add_query_appends() {
        assert_eq!(
            add_query("https://example.com/t?a=1", "b", "2"),
            "https://example.com/t?a=1&b=2"
        );
    }
}
