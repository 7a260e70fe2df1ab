//! The tileset: document bootstrap, tile tree ownership, and the
//! token-refresh retry protocol.
//!
//! A [`Tileset`] owns the contexts and root tile produced by bootstrap,
//! exposes the per-frame main-thread `update_tiles` step, and accounts for
//! every async operation it starts so shutdown can wait for outstanding
//! work. Construction never blocks: `from_url` and `from_hosted_asset`
//! return immediately and the root tile appears once the bootstrap
//! continuations finish.

mod bootstrap;
mod endpoint;
mod layer_json;

pub(crate) use bootstrap::build_tile_from_json;

pub use endpoint::AssetEndpoint;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::context::TileContext;
use crate::credit::CreditSystem;
use crate::error::TilesetLoadFailure;
use crate::pipeline::{self, LoadAccounting, SubtreeTracker};
use crate::registry::ContentRegistry;
use crate::renderer::PrepareRendererResources;
use crate::tasks::TaskProcessor;
use crate::tile::{Tile, TileLoadState};
use crate::transport::Transport;

/// The collaborators a tileset operates against.
#[derive(Clone)]
pub struct TilesetExternals {
    pub transport: Arc<dyn Transport>,
    pub renderer: Arc<dyn PrepareRendererResources>,
    pub task_processor: Arc<dyn TaskProcessor>,
    pub credits: Arc<CreditSystem>,
}

/// Callback observing every reported load failure.
pub type LoadErrorCallback = Arc<dyn Fn(&TilesetLoadFailure) + Send + Sync>;

/// Tileset behavior knobs.
pub struct TilesetOptions {
    /// Invoked for every load failure, in addition to the failure being
    /// recorded on the tileset.
    pub load_error_callback: Option<LoadErrorCallback>,

    /// Ceiling for the bounded waits performed during destruction: the
    /// outstanding-load drain and each tile's `Destroying` drain.
    pub destroy_drain_timeout: Duration,
}

impl Default for TilesetOptions {
    fn default() -> Self {
        Self {
            load_error_callback: None,
            destroy_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Collects failure records and forwards them to the host callback.
pub(crate) struct FailureSink {
    failures: Mutex<Vec<TilesetLoadFailure>>,
    callback: Option<LoadErrorCallback>,
}

impl FailureSink {
    fn new(callback: Option<LoadErrorCallback>) -> Self {
        Self {
            failures: Mutex::new(Vec::new()),
            callback,
        }
    }

    pub(crate) fn report(&self, failure: TilesetLoadFailure) {
        warn!(failure = %failure, "tileset load failure");
        if let Some(callback) = &self.callback {
            callback(&failure);
        }
        self.failures.lock().push(failure);
    }

    fn drain(&self) -> Vec<TilesetLoadFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}

/// State shared between the tileset and its in-flight continuations.
///
/// Tile-content continuations hold this instead of the tileset itself, so
/// content loads still settle cleanly while a tileset is being torn down.
pub(crate) struct PipelineShared {
    pub(crate) externals: TilesetExternals,
    pub(crate) registry: Arc<ContentRegistry>,
    pub(crate) accounting: Arc<LoadAccounting>,
    pub(crate) failures: Arc<FailureSink>,
    pub(crate) subtrees: SubtreeTracker,
}

/// A streamed, hierarchical LOD tileset.
pub struct Tileset {
    shared: Arc<PipelineShared>,
    options: TilesetOptions,
    contexts: RwLock<Vec<Arc<TileContext>>>,
    root: RwLock<Option<Arc<Tile>>>,
    refreshing_token: Mutex<bool>,
    asset: Option<AssetEndpoint>,
    supports_raster_overlays: AtomicBool,
}

impl Tileset {
    fn new_inner(
        externals: TilesetExternals,
        registry: Arc<ContentRegistry>,
        options: TilesetOptions,
        asset: Option<AssetEndpoint>,
    ) -> Self {
        let failures = Arc::new(FailureSink::new(options.load_error_callback.clone()));
        Self {
            shared: Arc::new(PipelineShared {
                externals,
                registry,
                accounting: Arc::new(LoadAccounting::new()),
                failures,
                subtrees: SubtreeTracker::default(),
            }),
            options,
            contexts: RwLock::new(Vec::new()),
            root: RwLock::new(None),
            refreshing_token: Mutex::new(false),
            asset,
            supports_raster_overlays: AtomicBool::new(false),
        }
    }

    /// Creates a tileset from a tileset document URL.
    ///
    /// Returns immediately; the root tile materializes once the document
    /// has been fetched and parsed.
    pub fn from_url(
        externals: TilesetExternals,
        registry: Arc<ContentRegistry>,
        url: impl Into<String>,
        options: TilesetOptions,
    ) -> Arc<Tileset> {
        let tileset = Arc::new(Self::new_inner(externals, registry, options, None));
        bootstrap::start_load_root_document(&tileset, None, url.into());
        tileset
    }

    /// Creates a tileset backed by a hosting/token-issuing endpoint.
    ///
    /// The endpoint is asked for the asset's document URL and access token;
    /// the resulting context carries an `Authorization: Bearer` header and
    /// the 401 retry callback.
    pub fn from_hosted_asset(
        externals: TilesetExternals,
        registry: Arc<ContentRegistry>,
        asset: AssetEndpoint,
        options: TilesetOptions,
    ) -> Arc<Tileset> {
        let tileset = Arc::new(Self::new_inner(externals, registry, options, Some(asset)));
        endpoint::start_load_from_endpoint(&tileset);
        tileset
    }

    /// The root tile, once bootstrap has completed.
    pub fn root(&self) -> Option<Arc<Tile>> {
        self.root.read().clone()
    }

    /// All tiles currently in the tree, pre-order.
    pub fn tiles(&self) -> Vec<Arc<Tile>> {
        let mut tiles = Vec::new();
        if let Some(root) = self.root() {
            collect_tiles(&root, &mut tiles);
        }
        tiles
    }

    /// Number of async loads in flight (tile content, documents, token
    /// refreshes).
    pub fn loads_in_progress(&self) -> usize {
        self.shared.accounting.in_flight()
    }

    /// Records the start of an externally-driven load against this
    /// tileset's accounting.
    pub fn notify_tile_start_loading(&self) {
        self.shared.accounting.notify_tile_start_loading();
    }

    /// Records the completion of an externally-driven load.
    pub fn notify_tile_done_loading(&self) {
        self.shared.accounting.notify_tile_done_loading();
    }

    /// Drains the accumulated failure records.
    pub fn load_failures(&self) -> Vec<TilesetLoadFailure> {
        self.shared.failures.drain()
    }

    /// Whether the loaded document supports raster-overlay draping
    /// (explicit tileset documents do; legacy terrain layers do not).
    pub fn supports_raster_overlays(&self) -> bool {
        self.supports_raster_overlays.load(Ordering::Relaxed)
    }

    /// Begins loading one tile's content. No-op unless the tile is
    /// `Unloaded`; never blocks.
    pub fn load_tile_content(&self, tile: &Arc<Tile>) {
        pipeline::load_content(&self.shared, tile);
    }

    /// Releases one tile's content. Returns whether the unload occurred.
    pub fn unload_tile_content(&self, tile: &Arc<Tile>) -> bool {
        tile.unload_content(self.shared.externals.renderer.as_ref())
    }

    /// Main-thread per-frame step: finalizes decoded tiles, dispatches
    /// failed tiles to their retry hooks, and expands implicit children.
    pub fn update_tiles(&self) {
        for tile in self.tiles() {
            pipeline::update_tile(self, &tile);
        }
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    pub(crate) fn asset(&self) -> Option<&AssetEndpoint> {
        self.asset.as_ref()
    }

    pub(crate) fn add_context(&self, context: Arc<TileContext>) {
        self.contexts.write().push(context);
    }

    pub(crate) fn set_root(&self, tile: Arc<Tile>) {
        *self.root.write() = Some(tile);
    }

    pub(crate) fn set_supports_raster_overlays(&self, value: bool) {
        self.supports_raster_overlays.store(value, Ordering::Relaxed);
    }

    /// Claims the single-in-flight token-refresh slot. Returns false if a
    /// refresh is already running.
    pub(crate) fn try_begin_token_refresh(&self) -> bool {
        let mut refreshing = self.refreshing_token.lock();
        if *refreshing {
            false
        } else {
            *refreshing = true;
            true
        }
    }

    pub(crate) fn end_token_refresh(&self) {
        *self.refreshing_token.lock() = false;
    }

    /// Tiles whose context is `context`, pre-order.
    pub(crate) fn tiles_in_context(&self, context: &Arc<TileContext>) -> Vec<Arc<Tile>> {
        self.tiles()
            .into_iter()
            .filter(|tile| Arc::ptr_eq(tile.context(), context))
            .collect()
    }
}

fn collect_tiles(tile: &Arc<Tile>, out: &mut Vec<Arc<Tile>>) {
    out.push(tile.clone());
    for child in tile.children() {
        collect_tiles(child, out);
    }
}

impl Drop for Tileset {
    /// Destruction must not race in-flight background work. The sequence
    /// is: bounded wait for outstanding loads, then `prepare_to_destroy`
    /// on every tile, then a bounded per-tile drain, then unconditional
    /// unload. A tile whose drain is abandoned keeps its renderer
    /// resources (they leak) because its continuation may still be
    /// running.
    fn drop(&mut self) {
        let ceiling = self.options.destroy_drain_timeout;
        let processor = self.shared.externals.task_processor.clone();

        let deadline = Instant::now() + ceiling;
        while self.shared.accounting.in_flight() > 0 && Instant::now() < deadline {
            processor.pump();
            std::thread::sleep(Duration::from_millis(10));
        }
        let remaining = self.shared.accounting.in_flight();
        if remaining > 0 {
            warn!(
                loads_in_progress = remaining,
                "destroying tileset with loads still in progress"
            );
        }

        let tiles = self.tiles();
        for tile in &tiles {
            tile.prepare_to_destroy();
        }

        let renderer = self.shared.externals.renderer.clone();
        for tile in &tiles {
            let drained = if tile.state() == TileLoadState::Destroying {
                tile.drain_destroying(processor.as_ref(), ceiling)
            } else {
                true
            };
            if drained {
                tile.force_unload(renderer.as_ref());
            }
        }

        *self.root.write() = None;
        self.contexts.write().clear();
    }
}

impl std::fmt::Debug for Tileset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tileset")
            .field("has_root", &self.root.read().is_some())
            .field("contexts", &self.contexts.read().len())
            .field("loads_in_progress", &self.loads_in_progress())
            .finish()
    }
}
