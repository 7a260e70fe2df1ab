//! TerraLOD - streaming for hierarchical 3D geospatial tile datasets.
//!
//! This library resolves a tileset description, fetches binary tile
//! payloads over the network, decodes heterogeneous tile formats into a
//! common in-memory representation through a pluggable registry, and hands
//! results to a host renderer. It is embedded in a host application that
//! owns the render loop, GPU resource lifetime, and camera state.
//!
//! # Architecture
//!
//! ```text
//! Tileset bootstrap ──► Tile tree ──► load pipeline ──► host renderer
//!   (documents,           (per-tile      (fetch on any thread,
//!    hosted assets,        load-state     decode on a worker,
//!    terrain layers)       machine)       finalize on the main thread)
//! ```
//!
//! The host drives everything through two calls: `Tileset::load_tile_content`
//! for each tile its selection algorithm wants, and `Tileset::update_tiles`
//! once per frame on the main thread.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use terralod::{
//!     ContentRegistry, CreditSystem, NoopPrepareRendererResources, ReqwestTransport,
//!     Tileset, TilesetExternals, TilesetOptions, TokioTaskProcessor,
//! };
//!
//! let externals = TilesetExternals {
//!     transport: Arc::new(ReqwestTransport::new()?),
//!     renderer: Arc::new(NoopPrepareRendererResources),
//!     task_processor: Arc::new(TokioTaskProcessor::current()),
//!     credits: Arc::new(CreditSystem::new()),
//! };
//! let registry = Arc::new(ContentRegistry::with_defaults());
//!
//! let tileset = Tileset::from_url(
//!     externals,
//!     registry,
//!     "https://example.com/tileset.json",
//!     TilesetOptions::default(),
//! );
//!
//! // Per frame, on the main thread:
//! tileset.update_tiles();
//! ```

pub mod context;
pub mod credit;
pub mod error;
pub mod geometry;
pub mod implicit;
pub mod pipeline;
pub mod registry;
pub mod renderer;
pub mod tasks;
pub mod tile;
pub mod tileset;
pub mod transport;

mod uri;

pub use context::{ContextInitializer, FailedTileAction, FailedTileCallback, TileContext};
pub use credit::{Credit, CreditSystem};
pub use error::{LoadType, TilesetLoadFailure};
pub use geometry::{BoundingVolume, OctreeTileId, QuadtreeTileId, TileId, TileRange};
pub use pipeline::LoadAccounting;
pub use registry::{
    external_tileset_decoder, ContentRegistry, DecodeError, DecodeInput, Decoder, JSON_FALLBACK_KEY,
};
pub use renderer::{NoopPrepareRendererResources, PrepareRendererResources, RendererResourceHandle};
pub use tasks::{DeferredTaskProcessor, TaskProcessor, TokioTaskProcessor};
pub use tile::{ContentRequest, DecodedContent, Refine, SceneContent, Tile, TileLoadState};
pub use tileset::{AssetEndpoint, LoadErrorCallback, Tileset, TilesetExternals, TilesetOptions};
pub use transport::{BoxFuture, ReqwestTransport, Response, Transport, TransportError};
