//! Spatial primitives for the tile hierarchy.
//!
//! Everything here is deliberately renderer-agnostic: bounding volumes are
//! carried for the host's selection and culling layers, transformed when the
//! tile tree composes transforms, but never rasterized or intersected by
//! this crate.

mod bounding;
mod tile_id;

pub use bounding::{max_scale_component, transform_bounding_volume, BoundingVolume};
pub use tile_id::{OctreeTileId, QuadtreeTileId, TileId, TileRange};
