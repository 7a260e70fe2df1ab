//! Decoded tile content and the in-flight request handle.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::context::TileContext;
use crate::geometry::{BoundingVolume, TileRange};
use crate::tile::Tile;

/// Opaque renderable payload produced by a content decoder.
///
/// The pipeline never looks inside; it is handed to the host's renderer
/// hooks and dropped on unload.
pub type SceneContent = Box<dyn Any + Send + Sync>;

/// The result of decoding one tile payload.
pub struct DecodedContent {
    /// Renderable payload, if the format produced one.
    pub scene: Option<SceneContent>,

    /// Child tiles parsed from an external tileset document. Content with
    /// children of this kind cannot be unloaded (reloading an external
    /// tileset is not supported).
    pub external_children: Option<Vec<Arc<Tile>>>,

    /// A context created for an external tileset document, registered with
    /// the owning tileset when the children are attached.
    pub new_context: Option<Arc<TileContext>>,

    /// A tighter bounding volume discovered during decode.
    pub updated_bounding_volume: Option<BoundingVolume>,

    /// Availability ranges carried by terrain content metadata, applied to
    /// the context's implicit availability index on finalization.
    pub available_tile_ranges: Vec<TileRange>,

    /// HTTP status of the response the content was decoded from.
    pub http_status: u16,
}

impl DecodedContent {
    /// Content with no payload at all.
    pub fn empty() -> Self {
        Self {
            scene: None,
            external_children: None,
            new_context: None,
            updated_bounding_volume: None,
            available_tile_ranges: Vec::new(),
            http_status: 0,
        }
    }

    /// Content wrapping a renderable payload.
    pub fn with_scene(scene: SceneContent) -> Self {
        Self {
            scene: Some(scene),
            ..Self::empty()
        }
    }

    /// True for external-tileset content.
    pub fn is_external(&self) -> bool {
        self.external_children.is_some()
    }
}

impl std::fmt::Debug for DecodedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedContent")
            .field("has_scene", &self.scene.is_some())
            .field(
                "external_children",
                &self.external_children.as_ref().map(Vec::len),
            )
            .field("http_status", &self.http_status)
            .finish()
    }
}

/// Handle to one in-flight content request.
///
/// Owned by the tile while in `ContentLoading` and retained after a failure
/// so the retry protocol can read the recorded HTTP status. Cancellation is
/// best-effort and asynchronous: a continuation that already completed must
/// still observe the tile's `Destroying` state and discard its result.
#[derive(Debug)]
pub struct ContentRequest {
    url: String,
    cancel: CancellationToken,
    status: OnceLock<u16>,
}

impl ContentRequest {
    pub(crate) fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cancel: CancellationToken::new(),
            status: OnceLock::new(),
        }
    }

    /// The URL being requested.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requests cancellation. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records the HTTP status of the response (0 when no response was
    /// received). First write wins.
    pub(crate) fn record_status(&self, status: u16) {
        let _ = self.status.set(status);
    }

    /// The recorded HTTP status, if a response (or its absence) has been
    /// observed.
    pub fn http_status(&self) -> Option<u16> {
        self.status.get().copied()
    }
}
