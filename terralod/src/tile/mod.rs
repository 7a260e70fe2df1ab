//! The tile entity and its load-state machine.
//!
//! Tiles form the streamed LOD hierarchy. A tile exclusively owns its
//! children (fixed at creation, never resized), holds a non-owning
//! back-reference to its parent, and carries the mutable load state the
//! async pipeline drives. See [`TileLoadState`] for the transition graph
//! and `src/pipeline` for the code that advances it.

mod content;
mod state;

pub use content::{ContentRequest, DecodedContent, SceneContent};
pub use state::TileLoadState;

use state::AtomicLoadState;

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use glam::DMat4;
use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use crate::context::TileContext;
use crate::geometry::{BoundingVolume, TileId};
use crate::renderer::{PrepareRendererResources, RendererResources};
use crate::tasks::TaskProcessor;

/// Geometric error assigned to tiles whose content turned out to carry no
/// renderable payload, so that selection always refines past them.
pub const CONTENTLESS_GEOMETRIC_ERROR: f64 = 999_999_999.0;

/// Whether a tile's content is shown alongside or instead of its parent's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refine {
    /// Child content replaces this tile's content.
    Replace,
    /// Child content is rendered in addition to this tile's content.
    Add,
}

/// One node of the tile hierarchy.
///
/// Constructed empty by the tree builder, driven through its load states by
/// the pipeline, and destroyed only after in-flight background work has
/// been drained (see [`Tile::prepare_to_destroy`] and
/// [`Tile::drain_destroying`]).
pub struct Tile {
    id: TileId,
    context: Arc<TileContext>,
    parent: OnceLock<Weak<Tile>>,
    children: OnceLock<Vec<Arc<Tile>>>,

    bounding_volume: RwLock<BoundingVolume>,
    viewer_request_volume: Option<BoundingVolume>,
    content_bounding_volume: Option<BoundingVolume>,
    geometric_error: RwLock<f64>,
    refine: Refine,
    transform: DMat4,

    state: AtomicLoadState,
    request: Mutex<Option<Arc<ContentRequest>>>,
    content: Mutex<Option<DecodedContent>>,
    resources: Mutex<RendererResources>,
}

impl Tile {
    /// Creates an unloaded tile belonging to `context`.
    pub fn new(id: TileId, context: Arc<TileContext>) -> Self {
        Self {
            id,
            context,
            parent: OnceLock::new(),
            children: OnceLock::new(),
            bounding_volume: RwLock::new(BoundingVolume::Sphere {
                center: glam::DVec3::ZERO,
                radius: 0.0,
            }),
            viewer_request_volume: None,
            content_bounding_volume: None,
            geometric_error: RwLock::new(0.0),
            refine: Refine::Replace,
            transform: DMat4::IDENTITY,
            state: AtomicLoadState::new(TileLoadState::Unloaded),
            request: Mutex::new(None),
            content: Mutex::new(None),
            resources: Mutex::new(RendererResources::default()),
        }
    }

    pub fn id(&self) -> &TileId {
        &self.id
    }

    pub fn context(&self) -> &Arc<TileContext> {
        &self.context
    }

    /// The parent tile, or `None` for the root.
    pub fn parent(&self) -> Option<Arc<Tile>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// The children of this tile. Empty until the tree builder (or
    /// external-content finalization) attaches them.
    pub fn children(&self) -> &[Arc<Tile>] {
        self.children.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bounding_volume(&self) -> BoundingVolume {
        self.bounding_volume.read().clone()
    }

    pub fn viewer_request_volume(&self) -> Option<&BoundingVolume> {
        self.viewer_request_volume.as_ref()
    }

    pub fn content_bounding_volume(&self) -> Option<&BoundingVolume> {
        self.content_bounding_volume.as_ref()
    }

    /// The error, in meters, introduced if this tile is rendered and its
    /// children are not.
    pub fn geometric_error(&self) -> f64 {
        *self.geometric_error.read()
    }

    pub fn refine(&self) -> Refine {
        self.refine
    }

    /// The tile's transform, already composed with its ancestors'.
    pub fn transform(&self) -> &DMat4 {
        &self.transform
    }

    /// The current load state.
    pub fn state(&self) -> TileLoadState {
        self.state.load()
    }

    /// The in-flight (or last) content request.
    pub fn content_request(&self) -> Option<Arc<ContentRequest>> {
        self.request.lock().clone()
    }

    /// HTTP status recorded by the most recent load attempt.
    pub fn content_http_status(&self) -> Option<u16> {
        self.content_request().and_then(|r| r.http_status())
    }

    /// Runs `f` with a reference to the decoded content, if present.
    pub fn with_content<R>(&self, f: impl FnOnce(Option<&DecodedContent>) -> R) -> R {
        f(self.content.lock().as_ref())
    }

    /// True if the decoded content is an external tileset.
    pub fn is_external_content(&self) -> bool {
        self.content.lock().as_ref().is_some_and(DecodedContent::is_external)
    }

    /// Determines if this tile is currently renderable.
    ///
    /// A tile whose content is an external tileset has nothing to render;
    /// selecting it would leave a hole until its children load, so external
    /// content is explicitly non-renderable.
    pub fn is_renderable(&self) -> bool {
        if !matches!(
            self.state(),
            TileLoadState::ContentLoaded | TileLoadState::Done
        ) {
            return false;
        }
        self.with_content(|content| match content {
            None => true,
            Some(content) => content.scene.is_some(),
        })
    }

    /// Triggers loading if the tile is `Unloaded`; a no-op in every other
    /// state. Never blocks. The actual work happens in the pipeline; this
    /// is re-exported through `Tileset::load_tile_content`.
    pub(crate) fn try_begin_loading(&self) -> bool {
        self.state
            .compare_exchange(TileLoadState::Unloaded, TileLoadState::ContentLoading)
            .is_ok()
    }

    /// Releases this tile's content and renderer resources.
    ///
    /// Refuses while a load is in flight (the async operation still owns
    /// the tile) and for external tileset content (reloading an external
    /// tileset is not supported). Returns whether the unload occurred.
    pub fn unload_content(&self, renderer: &dyn PrepareRendererResources) -> bool {
        match self.state() {
            TileLoadState::Unloaded => return true,
            TileLoadState::ContentLoading => return false,
            _ => {}
        }

        if self.is_external_content() {
            return false;
        }

        let (load_thread, main_thread) = {
            let mut resources = self.resources.lock();
            (resources.load_thread.take(), resources.main_thread.take())
        };
        if load_thread.is_some() || main_thread.is_some() {
            renderer.free(self, load_thread, main_thread);
        }

        *self.content.lock() = None;
        *self.request.lock() = None;
        self.set_state(TileLoadState::Unloaded);
        true
    }

    /// Unconditional unload used during tileset destruction: skips the
    /// refusal rules of [`Tile::unload_content`] because nothing will load
    /// this tile again.
    pub(crate) fn force_unload(&self, renderer: &dyn PrepareRendererResources) {
        let (load_thread, main_thread) = {
            let mut resources = self.resources.lock();
            (resources.load_thread.take(), resources.main_thread.take())
        };
        if load_thread.is_some() || main_thread.is_some() {
            renderer.free(self, load_thread, main_thread);
        }
        *self.content.lock() = None;
        *self.request.lock() = None;
        self.set_state(TileLoadState::Unloaded);
    }

    /// Cancels and releases the in-flight request without waiting. If the
    /// tile was `ContentLoading`, resets it to `Unloaded`.
    pub fn cancel_load_content(&self) {
        if let Some(request) = self.request.lock().take() {
            request.cancel();
        }
        let _ = self
            .state
            .compare_exchange(TileLoadState::ContentLoading, TileLoadState::Unloaded);
    }

    /// Marks this tile for destruction. Called exactly once, before the
    /// owner drops it.
    ///
    /// Cancels any in-flight request and flips `ContentLoading` to
    /// `Destroying` so the worker continuation abandons its result instead
    /// of committing into a dying tile. States other than `ContentLoading`
    /// are left untouched.
    pub fn prepare_to_destroy(&self) {
        if let Some(request) = self.request.lock().as_ref() {
            request.cancel();
        }
        let _ = self
            .state
            .compare_exchange(TileLoadState::ContentLoading, TileLoadState::Destroying);
    }

    /// Waits for a `Destroying` tile's background continuation to finish,
    /// pumping the host's task processor, up to `ceiling`.
    ///
    /// Returns true once the state has left `Destroying`. Returns false if
    /// the ceiling was exceeded; the caller must then skip freeing this
    /// tile's renderer resources, because the continuation may still touch
    /// them.
    pub fn drain_destroying(&self, task_processor: &dyn TaskProcessor, ceiling: Duration) -> bool {
        let start = Instant::now();
        while self.state() == TileLoadState::Destroying {
            if start.elapsed() >= ceiling {
                warn!(
                    tile_id = ?self.id,
                    ceiling_ms = ceiling.as_millis() as u64,
                    "abandoning wait for in-flight load during tile destruction; \
                     renderer resources for this tile will not be freed"
                );
                return false;
            }
            task_processor.pump();
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Transitions `FailedTemporarily` to `Failed`. A no-op in any other
    /// state.
    pub fn mark_permanently_failed(&self) {
        let _ = self
            .state
            .compare_exchange(TileLoadState::FailedTemporarily, TileLoadState::Failed);
    }

    /// Assigns child tiles. Children are fixed at creation; a second call
    /// is rejected.
    pub(crate) fn attach_children(self: &Arc<Self>, children: Vec<Arc<Tile>>) -> bool {
        for child in &children {
            let _ = child.parent.set(Arc::downgrade(self));
        }
        if self.children.set(children).is_err() {
            error!(tile_id = ?self.id, "children already created for tile");
            return false;
        }
        true
    }

    pub(crate) fn set_state(&self, state: TileLoadState) {
        self.state.store(state);
    }

    pub(crate) fn set_request(&self, request: Arc<ContentRequest>) {
        *self.request.lock() = Some(request);
    }

    pub(crate) fn clear_request(&self) {
        *self.request.lock() = None;
    }

    /// Publishes decoded content. The subsequent release-store of
    /// `ContentLoaded` makes it visible to readers.
    pub(crate) fn set_content(&self, content: DecodedContent) {
        *self.content.lock() = Some(content);
    }

    pub(crate) fn content_mut(&self) -> parking_lot::MutexGuard<'_, Option<DecodedContent>> {
        self.content.lock()
    }

    pub(crate) fn resources_mut(&self) -> parking_lot::MutexGuard<'_, RendererResources> {
        self.resources.lock()
    }

    pub(crate) fn set_bounding_volume(&self, volume: BoundingVolume) {
        *self.bounding_volume.write() = volume;
    }

    pub(crate) fn set_geometric_error(&self, error: f64) {
        *self.geometric_error.write() = error;
    }

    pub(crate) fn set_viewer_request_volume(&mut self, volume: BoundingVolume) {
        self.viewer_request_volume = Some(volume);
    }

    pub(crate) fn set_content_bounding_volume(&mut self, volume: BoundingVolume) {
        self.content_bounding_volume = Some(volume);
    }

    pub(crate) fn set_refine(&mut self, refine: Refine) {
        self.refine = refine;
    }

    pub(crate) fn set_transform(&mut self, transform: DMat4) {
        self.transform = transform;
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("geometric_error", &self.geometric_error())
            .field("children", &self.children().len())
            .finish()
    }
}
