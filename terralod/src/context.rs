//! Per-document resolution scope.
//!
//! One [`TileContext`] is created for each tileset or layer document
//! parsed. Every tile built from that document references the context for
//! URL resolution and request headers. External tileset content and
//! federated terrain layers create further contexts: external tilesets add
//! independent contexts to the owning tileset, while a terrain layer's
//! `parentUrl` chains an *underlying* context below this one, forming a
//! singly-linked list (never a tree).
//!
//! A context is never mutated after tree construction, with one exception:
//! its request headers may be rewritten in place by the token-refresh
//! protocol.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::implicit::ImplicitTilingContext;
use crate::tile::Tile;

/// The retry-policy decision for a failed tile fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailedTileAction {
    /// The failure is permanent; do not retry this tile.
    GiveUp,

    /// Retry the tile immediately.
    Retry,

    /// Keep the tile failed for now; it may be retried later (for example
    /// once a token refresh completes).
    Wait,
}

/// Callback invoked when a tile whose context is this one fails to load.
pub type FailedTileCallback = Arc<dyn Fn(&Tile) -> FailedTileAction + Send + Sync>;

/// Callback applied to any new context created while parsing content that
/// belongs to this context (external tilesets).
pub type ContextInitializer = Arc<dyn Fn(&TileContext, &mut TileContext) + Send + Sync>;

/// A context in which a tileset operates: base URL, request headers, and
/// the per-document hooks the load pipeline consults.
pub struct TileContext {
    base_url: String,
    headers: RwLock<Vec<(String, String)>>,
    version: OnceLock<String>,
    failed_tile_callback: Option<FailedTileCallback>,
    context_initializer: Option<ContextInitializer>,
    underlying: RwLock<Option<Arc<TileContext>>>,
    implicit: OnceLock<ImplicitTilingContext>,
}

impl TileContext {
    /// Creates a context for a document at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: RwLock::new(Vec::new()),
            version: OnceLock::new(),
            failed_tile_callback: None,
            context_initializer: None,
            underlying: RwLock::new(None),
            implicit: OnceLock::new(),
        }
    }

    /// The URL the document was loaded from. Tile content URIs resolve
    /// against this.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The document format version string, if the document declared one.
    pub fn version(&self) -> Option<&str> {
        self.version.get().map(String::as_str)
    }

    /// Records the document version. Set once, while the document is
    /// parsed; later writes are ignored.
    pub fn set_version(&self, version: impl Into<String>) {
        let _ = self.version.set(version.into());
    }

    /// Snapshot of this context's own request headers.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.headers.read().clone()
    }

    /// Appends a request header.
    pub fn push_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.write().push((name.into(), value.into()));
    }

    /// Rewrites a header in place: replaces the first header with the given
    /// name, or appends it if absent. This is the mutation path the
    /// token-refresh protocol uses for `Authorization`.
    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        let mut headers = self.headers.write();
        match headers.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = value.into(),
            None => headers.push((name.to_string(), value.into())),
        }
    }

    /// Headers to send for tile requests, resolved across the underlying
    /// chain: this context's headers, plus any header from an underlying
    /// context whose name is not already present. The walk proceeds
    /// outward until the chain ends.
    pub fn resolved_headers(&self) -> Vec<(String, String)> {
        let mut resolved = self.headers();
        let mut current = self.underlying();
        while let Some(context) = current {
            for (name, value) in context.headers() {
                if !resolved.iter().any(|(existing, _)| *existing == name) {
                    resolved.push((name, value));
                }
            }
            current = context.underlying();
        }
        resolved
    }

    /// The failure hook consulted when a tile of this context ends up in
    /// `FailedTemporarily`.
    pub fn failed_tile_callback(&self) -> Option<&FailedTileCallback> {
        self.failed_tile_callback.as_ref()
    }

    pub fn set_failed_tile_callback(&mut self, callback: FailedTileCallback) {
        self.failed_tile_callback = Some(callback);
    }

    /// The hook applied to contexts created for nested documents.
    pub fn context_initializer(&self) -> Option<&ContextInitializer> {
        self.context_initializer.as_ref()
    }

    pub fn set_context_initializer(&mut self, initializer: ContextInitializer) {
        self.context_initializer = Some(initializer);
    }

    /// The underlying (parent-layer) context, if this document declared a
    /// `parentUrl`.
    pub fn underlying(&self) -> Option<Arc<TileContext>> {
        self.underlying.read().clone()
    }

    /// Installs the underlying context. Called once, by the chained layer
    /// continuation.
    pub fn set_underlying(&self, context: Arc<TileContext>) {
        *self.underlying.write() = Some(context);
    }

    /// Implicit tiling description, for contexts whose document describes
    /// an implicitly-tiled dataset.
    pub fn implicit(&self) -> Option<&ImplicitTilingContext> {
        self.implicit.get()
    }

    /// Installs the implicit tiling description. Set once, while the
    /// document is parsed; later writes are ignored.
    pub fn set_implicit(&self, implicit: ImplicitTilingContext) {
        let _ = self.implicit.set(implicit);
    }

    /// Creates a context for a nested document, inheriting this context's
    /// headers and callbacks, then applying this context's initializer.
    pub fn derive_for(&self, base_url: impl Into<String>) -> TileContext {
        let mut derived = TileContext::new(base_url);
        *derived.headers.get_mut() = self.headers();
        derived.failed_tile_callback = self.failed_tile_callback.clone();
        derived.context_initializer = self.context_initializer.clone();
        if let Some(initializer) = &self.context_initializer {
            let hook = initializer.clone();
            hook(self, &mut derived);
        }
        derived
    }
}

impl std::fmt::Debug for TileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileContext")
            .field("base_url", &self.base_url)
            .field("version", &self.version.get())
            .field("headers", &self.headers.read().len())
            .field("has_implicit", &self.implicit.get().is_some())
            .field("has_underlying", &self.underlying.read().is_some())
            .finish()
    }
}
