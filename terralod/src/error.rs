//! Failure records for tileset and tile loading.
//!
//! Failures inside async continuations are converted into
//! [`TilesetLoadFailure`] values and funneled through a single per-tileset
//! reporting path rather than propagated across thread boundaries. The host
//! drains them with `Tileset::load_failures` or observes them through the
//! `load_error_callback` option.

use thiserror::Error;

/// The phase of loading in which a failure occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadType {
    /// The hosting/token-issuing endpoint request or its response.
    AssetEndpoint,

    /// A tileset document (`tileset.json` or a terrain `layer.json`).
    TilesetJson,

    /// A tile content payload.
    TileContent,

    /// An implicit-tiling subtree availability document.
    TileSubtree,

    /// A failure that could not be attributed to a specific phase.
    Unknown,
}

impl std::fmt::Display for LoadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AssetEndpoint => "asset endpoint",
            Self::TilesetJson => "tileset document",
            Self::TileContent => "tile content",
            Self::TileSubtree => "tile subtree",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// A structured record describing one failed load.
///
/// These are reported to the owning tileset, never thrown: a tile that
/// fails to load is simply skipped by the selection layer, and a tileset
/// whose root document fails never populates a root tile. This record is
/// the host's only signal.
#[derive(Clone, Debug, Error)]
#[error("{load_type} load failed for {url}: {message}")]
pub struct TilesetLoadFailure {
    /// The phase that failed.
    pub load_type: LoadType,

    /// The URL whose load failed (empty when no request was involved).
    pub url: String,

    /// The HTTP status of the failed response, if a response was received.
    pub http_status: Option<u16>,

    /// Human-readable description of the failure.
    pub message: String,
}

impl TilesetLoadFailure {
    /// Creates a failure record with no associated HTTP status.
    pub fn new(load_type: LoadType, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            load_type,
            url: url.into(),
            http_status: None,
            message: message.into(),
        }
    }

    /// Attaches the HTTP status of the failed response.
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_phase_and_url() {
        let failure = TilesetLoadFailure::new(
            LoadType::TilesetJson,
            "https://example.com/tileset.json",
            "missing required field 'geometricError'",
        );
        let text = failure.to_string();
        assert!(text.contains("tileset document"));
        assert!(text.contains("https://example.com/tileset.json"));
        assert!(text.contains("geometricError"));
    }

    #[test]
    fn test_with_status() {
        let failure =
            TilesetLoadFailure::new(LoadType::TileContent, "https://example.com/0.b3dm", "HTTP 404")
                .with_status(404);
        assert_eq!(failure.http_status, Some(404));
    }
}
