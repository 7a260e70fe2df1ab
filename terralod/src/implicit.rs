//! Implicit tiling: availability indexes and template URLs.
//!
//! Implicitly-tiled datasets do not list their tiles; child existence is
//! derived from an availability index and tile URLs are derived from
//! templates. Two document families feed this module: legacy quantized-mesh
//! terrain layers (template URLs plus `available` ranges) and the implicit
//! tiling extension of tileset documents (`subdivisionScheme`,
//! `subtreeLevels`, `maximumLevel`, subtree availability documents).

use parking_lot::RwLock;

use crate::credit::Credit;
use crate::geometry::{QuadtreeTileId, TileRange};

/// Latitude bound of the Web Mercator projection, in radians.
const WEB_MERCATOR_MAX_LATITUDE: f64 = 1.484_422_229_745_332_2;

/// How an implicit dataset subdivides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubdivisionScheme {
    Quadtree,
    Octree,
}

impl SubdivisionScheme {
    /// Parses the `subdivisionScheme` value of the implicit tiling
    /// extension.
    pub fn parse(value: &str) -> Option<SubdivisionScheme> {
        match value {
            "QUADTREE" => Some(SubdivisionScheme::Quadtree),
            "OCTREE" => Some(SubdivisionScheme::Octree),
            _ => None,
        }
    }
}

/// Map projection of an implicitly-tiled terrain layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Projection {
    /// EPSG:4326. Two root tiles side by side.
    Geographic,
    /// EPSG:3857. One root tile.
    WebMercator,
}

impl Projection {
    /// Parses an EPSG code string as found in terrain layer documents.
    pub fn parse(value: &str) -> Option<Projection> {
        match value {
            "EPSG:4326" => Some(Projection::Geographic),
            "EPSG:3857" => Some(Projection::WebMercator),
            _ => None,
        }
    }

    /// Number of root tiles along the X axis of the tiling scheme.
    pub fn root_x_tiles(&self) -> u32 {
        match self {
            Projection::Geographic => 2,
            Projection::WebMercator => 1,
        }
    }

    /// The full extent covered by the tiling scheme, as a globe rectangle
    /// `(west, south, east, north)` in radians.
    pub fn globe_rectangle(&self) -> (f64, f64, f64, f64) {
        match self {
            Projection::Geographic => (
                -std::f64::consts::PI,
                -std::f64::consts::FRAC_PI_2,
                std::f64::consts::PI,
                std::f64::consts::FRAC_PI_2,
            ),
            Projection::WebMercator => (
                -std::f64::consts::PI,
                -WEB_MERCATOR_MAX_LATITUDE,
                std::f64::consts::PI,
                WEB_MERCATOR_MAX_LATITUDE,
            ),
        }
    }
}

/// Which tiles of an implicit dataset exist.
///
/// Backed by a list of per-level rectangular ranges. Ranges arrive from
/// three sources: a terrain layer's `available` member, availability
/// metadata decoded out of tile content, and subtree availability
/// documents. An optional presumption level marks every tile up to that
/// level available before any index data has loaded; the implicit tiling
/// extension uses it so traversal can start before subtrees arrive.
#[derive(Debug, Default)]
pub struct AvailabilityIndex {
    ranges: RwLock<Vec<TileRange>>,
    presumed_levels: Option<u32>,
}

impl AvailabilityIndex {
    /// An index with no availability at all until ranges are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// An index that presumes every tile at `level <= maximum_level`
    /// available.
    pub fn presuming_levels(maximum_level: u32) -> Self {
        Self {
            ranges: RwLock::new(Vec::new()),
            presumed_levels: Some(maximum_level),
        }
    }

    /// Records a range of available tiles.
    pub fn add_range(&self, range: TileRange) {
        self.ranges.write().push(range);
    }

    /// Returns true if the given tile is known (or presumed) to exist.
    pub fn is_available(&self, id: &QuadtreeTileId) -> bool {
        if let Some(max) = self.presumed_levels {
            if id.level <= max {
                return true;
            }
        }
        self.ranges.read().iter().any(|range| range.contains(id))
    }

    /// Number of recorded ranges.
    pub fn range_count(&self) -> usize {
        self.ranges.read().len()
    }
}

/// Per-context implicit tiling description.
///
/// Built once while parsing a terrain layer document or an implicit tiling
/// extension, then shared immutably by every tile of the context. The
/// availability index is the only interior-mutable part: loaded content and
/// subtree documents extend it.
#[derive(Debug)]
pub struct ImplicitTilingContext {
    /// Templates for tile content URLs. Template elements are `{x}`, `{y}`,
    /// `{z}` (or `{level}`), and `{version}`.
    pub tile_template_urls: Vec<String>,

    /// Template for subtree availability document URLs, if the dataset
    /// publishes subtrees.
    pub subtree_template_url: Option<String>,

    pub subdivision: SubdivisionScheme,
    pub projection: Projection,
    pub availability: AvailabilityIndex,

    /// Number of levels per subtree availability document.
    pub subtree_levels: Option<u32>,

    /// Deepest level of the dataset.
    pub maximum_level: Option<u32>,

    /// Attribution attached to this layer, if any.
    pub credit: Option<Credit>,
}

impl ImplicitTilingContext {
    /// Resolves the content URL for a quadtree tile from the first
    /// template.
    pub fn tile_url(&self, id: &QuadtreeTileId, version: Option<&str>) -> Option<String> {
        let template = self.tile_template_urls.first()?;
        Some(substitute_template(template, id, version))
    }

    /// Resolves the subtree availability document URL for a subtree root.
    pub fn subtree_url(&self, id: &QuadtreeTileId, version: Option<&str>) -> Option<String> {
        let template = self.subtree_template_url.as_deref()?;
        Some(substitute_template(template, id, version))
    }

    /// The globe rectangle `(west, south, east, north)` of a tile, in
    /// radians.
    pub fn rectangle_for_tile(&self, id: &QuadtreeTileId) -> (f64, f64, f64, f64) {
        let (west, south, east, north) = self.projection.globe_rectangle();
        let tiles_x = (self.projection.root_x_tiles() as u64) << id.level;
        let tiles_y = 1u64 << id.level;

        let width = (east - west) / tiles_x as f64;
        let height = (north - south) / tiles_y as f64;

        let tile_west = west + id.x as f64 * width;
        let tile_south = south + id.y as f64 * height;
        (tile_west, tile_south, tile_west + width, tile_south + height)
    }
}

/// Substitutes tile coordinates into a URL template.
///
/// `{z}` and `{level}` are aliases; `{version}` falls back to `"1.0.0"`
/// when the context has no version string.
pub fn substitute_template(template: &str, id: &QuadtreeTileId, version: Option<&str>) -> String {
    template
        .replace("{level}", &id.level.to_string())
        .replace("{z}", &id.level.to_string())
        .replace("{x}", &id.x.to_string())
        .replace("{y}", &id.y.to_string())
        .replace("{version}", version.unwrap_or("1.0.0"))
}

/// Applies a subtree availability document (JSON form) to an index.
///
/// Binary subtree payloads are dispatched through the content registry like
/// any other tile format; only the JSON form is interpreted here. A
/// `tileAvailability` of constant 1 marks every tile of the subtree
/// available; constant 0 (or a bitstream, which requires the binary
/// payload) contributes nothing.
pub fn apply_subtree_json(
    index: &AvailabilityIndex,
    document: &serde_json::Value,
    subtree_root: &QuadtreeTileId,
    subtree_levels: u32,
) -> bool {
    let constant = document
        .get("tileAvailability")
        .and_then(|a| a.get("constant"))
        .and_then(|c| c.as_u64());

    match constant {
        Some(1) => {
            for relative_level in 0..subtree_levels {
                let level = subtree_root.level + relative_level;
                let scale = 1u32 << relative_level;
                index.add_range(TileRange {
                    level,
                    min_x: subtree_root.x * scale,
                    min_y: subtree_root.y * scale,
                    max_x: (subtree_root.x + 1) * scale - 1,
                    max_y: (subtree_root.y + 1) * scale - 1,
                });
            }
            true
        }
        _ => false,
    }
}
