//! Legacy quantized-terrain layer bootstrap.
//!
//! A terrain layer document (`layer.json`) has no explicit tile list: it
//! declares template URLs, a projection, and availability ranges, from
//! which a synthetic quadtree root is built. A layer may declare a
//! `parentUrl` pointing at a further layer document; that layer is fetched
//! as a chained, non-blocking continuation and becomes this context's
//! *underlying* context, forming a singly-linked chain rather than a tree.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::TileContext;
use crate::error::{LoadType, TilesetLoadFailure};
use crate::geometry::{BoundingVolume, TileId, TileRange};
use crate::implicit::{AvailabilityIndex, ImplicitTilingContext, Projection, SubdivisionScheme};
use crate::tile::{Tile, CONTENTLESS_GEOMETRIC_ERROR};
use crate::tileset::Tileset;
use crate::uri;

/// WGS84 equatorial radius in meters.
const WGS84_RADIUS: f64 = 6_378_137.0;

/// Heights assumed for terrain tiles before their content reports real
/// bounds.
const TERRAIN_MIN_HEIGHT: f64 = -1000.0;
const TERRAIN_MAX_HEIGHT: f64 = 9000.0;

/// Geometric error of a level-0 terrain tile, derived from the heightmap
/// sample spacing the quantized-mesh format assumes (65 samples per tile
/// edge over a quarter of the equator).
fn level_zero_geometric_error(root_x_tiles: u32) -> f64 {
    8.0 * (WGS84_RADIUS * 2.0 * std::f64::consts::PI * 0.25) / (65.0 * root_x_tiles as f64)
}

/// Configures `context` from a terrain layer document and installs the
/// synthetic quadtree root on the tileset.
pub(crate) fn configure_terrain_layer(
    tileset: &Arc<Tileset>,
    context: Arc<TileContext>,
    document: &serde_json::Value,
    url: &str,
) {
    context.push_header(
        "Accept",
        "application/vnd.quantized-mesh,application/octet-stream;q=0.9,*/*;q=0.01",
    );

    let Some(implicit) = parse_layer_document(tileset, &context, document, url) else {
        return;
    };
    let projection = implicit.projection;
    let root_x_tiles = projection.root_x_tiles();
    let (west, south, east, north) = projection.globe_rectangle();

    let child_error = level_zero_geometric_error(root_x_tiles);
    let child_rectangles: Vec<_> = (0..root_x_tiles)
        .map(|x| {
            let id = crate::geometry::QuadtreeTileId::new(0, x, 0);
            (id, implicit.rectangle_for_tile(&id))
        })
        .collect();

    context.set_implicit(implicit);

    let mut root = Tile::new(TileId::Url(String::new()), context.clone());
    root.set_bounding_volume(BoundingVolume::Region {
        west,
        south,
        east,
        north,
        min_height: TERRAIN_MIN_HEIGHT,
        max_height: TERRAIN_MAX_HEIGHT,
    });
    root.set_geometric_error(CONTENTLESS_GEOMETRIC_ERROR);
    let root = Arc::new(root);

    let children: Vec<Arc<Tile>> = child_rectangles
        .into_iter()
        .map(|(id, (west, south, east, north))| {
            let mut child = Tile::new(TileId::Quadtree(id), context.clone());
            child.set_bounding_volume(BoundingVolume::Region {
                west,
                south,
                east,
                north,
                min_height: TERRAIN_MIN_HEIGHT,
                max_height: TERRAIN_MAX_HEIGHT,
            });
            child.set_geometric_error(child_error);
            Arc::new(child)
        })
        .collect();
    root.attach_children(children);

    tileset.add_context(context.clone());
    tileset.set_root(root);
    debug!(url = %url, "terrain layer bootstrap complete");

    if let Some(parent_url) = document.get("parentUrl").and_then(|v| v.as_str()) {
        let resolved = uri::resolve(url, parent_url, true);
        start_load_underlying_layer(tileset, context, resolved);
    }
}

/// Parses the layer document into an implicit tiling description.
///
/// Returns `None` (with a reported failure) for unsupported projections,
/// which is a hard stop for this layer but not for the whole tileset.
fn parse_layer_document(
    tileset: &Arc<Tileset>,
    context: &Arc<TileContext>,
    document: &serde_json::Value,
    url: &str,
) -> Option<ImplicitTilingContext> {
    if let Some(version) = document.get("version").and_then(|v| v.as_str()) {
        context.set_version(version);
    }

    let projection_name = document
        .get("projection")
        .and_then(|v| v.as_str())
        .unwrap_or("EPSG:4326");
    let Some(projection) = Projection::parse(projection_name) else {
        tileset.shared().failures.report(TilesetLoadFailure::new(
            LoadType::TilesetJson,
            url,
            format!("unsupported layer projection {}", projection_name),
        ));
        return None;
    };

    let mut templates: Vec<String> = document
        .get("tiles")
        .and_then(|v| v.as_array())
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str())
                .map(|template| uri::resolve(url, template, false))
                .collect()
        })
        .unwrap_or_default();

    // Request normals and metadata when the layer offers them.
    let extensions: Vec<&str> = document
        .get("extensions")
        .and_then(|v| v.as_array())
        .map(|array| array.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let mut requested = Vec::new();
    if extensions.contains(&"octvertexnormals") {
        requested.push("octvertexnormals");
    }
    if extensions.contains(&"metadata") {
        requested.push("metadata");
    }
    if !requested.is_empty() {
        let value = requested.join("-");
        for template in &mut templates {
            *template = uri::add_query(template, "extensions", &value);
        }
    }

    if templates.is_empty() {
        warn!(url = %url, "terrain layer declares no tile URL templates");
    }

    let availability = AvailabilityIndex::new();
    if let Some(levels) = document.get("available").and_then(|v| v.as_array()) {
        for (level, ranges) in levels.iter().enumerate() {
            let Some(ranges) = ranges.as_array() else {
                continue;
            };
            for range in ranges {
                let get = |key: &str| range.get(key).and_then(|v| v.as_u64()).map(|v| v as u32);
                if let (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) =
                    (get("startX"), get("startY"), get("endX"), get("endY"))
                {
                    availability.add_range(TileRange {
                        level: level as u32,
                        min_x,
                        min_y,
                        max_x,
                        max_y,
                    });
                }
            }
        }
    }

    let maximum_level = document
        .get("maxzoom")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let credit = document
        .get("attribution")
        .and_then(|v| v.as_str())
        .filter(|text| !text.is_empty())
        .map(|text| tileset.shared().externals.credits.add_credit(text));

    Some(ImplicitTilingContext {
        tile_template_urls: templates,
        subtree_template_url: None,
        subdivision: SubdivisionScheme::Quadtree,
        projection,
        availability,
        subtree_levels: None,
        maximum_level,
        credit,
    })
}

/// Fetches a `parentUrl` layer document and chains it as the underlying
/// context of `top_context`.
fn start_load_underlying_layer(tileset: &Arc<Tileset>, top_context: Arc<TileContext>, url: String) {
    let shared = tileset.shared().clone();
    let guard = shared.accounting.start();
    let headers = top_context.headers();
    let response_future = shared.externals.transport.request(&url, &headers);

    debug!(url = %url, "requesting underlying terrain layer");

    let tileset_bg = tileset.clone();
    let shared_bg = shared.clone();
    shared.externals.task_processor.spawn(Box::pin(async move {
        let result = response_future.await;
        let tileset_task = tileset_bg.clone();
        shared_bg.externals.task_processor.start_task(Box::new(move || {
            let _guard = guard;
            process_underlying_layer_response(&tileset_task, &top_context, &url, result);
        }));
    }));
}

fn process_underlying_layer_response(
    tileset: &Arc<Tileset>,
    top_context: &Arc<TileContext>,
    url: &str,
    result: Result<crate::transport::Response, crate::transport::TransportError>,
) {
    let shared = tileset.shared();

    let response = match result {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
            shared.failures.report(
                TilesetLoadFailure::new(
                    LoadType::TilesetJson,
                    url,
                    format!("HTTP {}", response.status),
                )
                .with_status(response.status),
            );
            return;
        }
        Err(error) => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::TilesetJson,
                url,
                error.to_string(),
            ));
            return;
        }
    };

    let document: serde_json::Value = match serde_json::from_slice(&response.body) {
        Ok(document) => document,
        Err(error) => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::TilesetJson,
                url,
                format!("malformed layer document: {}", error),
            ));
            return;
        }
    };

    let underlying = Arc::new({
        let context = TileContext::new(url);
        for (name, value) in top_context.headers() {
            context.push_header(name, value);
        }
        context
    });

    let Some(implicit) = parse_layer_document(tileset, &underlying, &document, url) else {
        return;
    };
    underlying.set_implicit(implicit);

    top_context.set_underlying(underlying.clone());
    tileset.add_context(underlying.clone());
    debug!(url = %url, "underlying terrain layer chained");

    if let Some(parent_url) = document.get("parentUrl").and_then(|v| v.as_str()) {
        let resolved = uri::resolve(url, parent_url, true);
        start_load_underlying_layer(tileset, underlying, resolved);
    }
}
