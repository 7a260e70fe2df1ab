//! Renderer-resource preparation hooks.
//!
//! Decoded tile content usually needs host-renderer objects (vertex
//! buffers, textures) before it can be drawn. Creation is split into two
//! phases because most graphics APIs restrict object creation to one
//! thread: `prepare_in_load_thread` runs on a worker right after decode for
//! whatever is safe to build there, and `prepare_in_main_thread` runs
//! inside the host's per-frame update for the rest.
//!
//! Handles are opaque to this crate. A host with no renderer integration
//! can use [`NoopPrepareRendererResources`].

use std::any::Any;

use crate::tile::{DecodedContent, Tile};

/// Opaque renderer-resource handle owned by the host renderer.
pub type RendererResourceHandle = Box<dyn Any + Send + Sync>;

/// Host hooks for creating and destroying renderer resources.
///
/// All methods have default no-op implementations.
pub trait PrepareRendererResources: Send + Sync {
    /// Called on a worker thread immediately after a tile's content has
    /// been decoded, before the content is committed to the tile. Only
    /// work that the host's graphics API allows off the main thread
    /// belongs here.
    fn prepare_in_load_thread(
        &self,
        tile: &Tile,
        content: &DecodedContent,
    ) -> Option<RendererResourceHandle> {
        let _ = (tile, content);
        None
    }

    /// Called on the main thread while the tile is in `ContentLoaded`.
    ///
    /// Receives whatever `prepare_in_load_thread` produced and returns the
    /// final main-thread handle. The default passes the load-thread handle
    /// through unchanged.
    fn prepare_in_main_thread(
        &self,
        tile: &Tile,
        load_thread_result: Option<RendererResourceHandle>,
    ) -> Option<RendererResourceHandle> {
        let _ = tile;
        load_thread_result
    }

    /// Frees resources created by either preparation phase.
    ///
    /// Exactly one of the two handles is normally present: tiles unloaded
    /// from `ContentLoaded` still carry the load-thread handle, tiles
    /// unloaded from `Done` carry the main-thread handle.
    fn free(
        &self,
        tile: &Tile,
        load_thread_result: Option<RendererResourceHandle>,
        main_thread_result: Option<RendererResourceHandle>,
    ) {
        let _ = (tile, load_thread_result, main_thread_result);
    }
}

/// Renderer hook implementation that does nothing.
pub struct NoopPrepareRendererResources;

impl PrepareRendererResources for NoopPrepareRendererResources {}

/// The two renderer-resource slots of a tile.
#[derive(Default)]
pub(crate) struct RendererResources {
    pub(crate) load_thread: Option<RendererResourceHandle>,
    pub(crate) main_thread: Option<RendererResourceHandle>,
}
