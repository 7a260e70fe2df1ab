//! Tileset document bootstrap: fetch, parse, tree building.
//!
//! A tileset document either declares an explicit `root` tile section,
//! recursively expanded into the tile tree here, or declares itself a
//! legacy quantized-terrain layer, in which case a synthetic quadtree root
//! is built instead (see `layer_json`). Parsing happens on a worker thread;
//! the fetch itself is a non-blocking continuation.

use std::sync::Arc;

use glam::DMat4;
use tracing::{debug, warn};

use crate::context::TileContext;
use crate::error::{LoadType, TilesetLoadFailure};
use crate::geometry::{transform_bounding_volume, max_scale_component, BoundingVolume, TileId};
use crate::tile::{Refine, Tile};
use crate::tileset::{layer_json, Tileset};
use crate::uri;

/// Fetches and parses the root document of a tileset.
///
/// `context` is provided when the caller already built one (the hosted
/// asset endpoint installs its auth header and retry callback up front);
/// otherwise a bare context rooted at `url` is created after the fetch.
pub(crate) fn start_load_root_document(
    tileset: &Arc<Tileset>,
    context: Option<Arc<TileContext>>,
    url: String,
) {
    let shared = tileset.shared().clone();
    let guard = shared.accounting.start();

    let headers = context
        .as_ref()
        .map(|c| c.resolved_headers())
        .unwrap_or_default();
    let response_future = shared.externals.transport.request(&url, &headers);

    debug!(url = %url, "requesting tileset document");

    let tileset_bg = tileset.clone();
    let shared_bg = shared.clone();
    shared.externals.task_processor.spawn(Box::pin(async move {
        let result = response_future.await;
        let tileset_task = tileset_bg.clone();
        shared_bg.externals.task_processor.start_task(Box::new(move || {
            let _guard = guard;
            process_root_document_response(&tileset_task, context, &url, result);
        }));
    }));
}

fn process_root_document_response(
    tileset: &Arc<Tileset>,
    context: Option<Arc<TileContext>>,
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
                format!("malformed tileset document: {}", error),
            ));
            return;
        }
    };

    let context = context.unwrap_or_else(|| Arc::new(TileContext::new(url)));

    if let Some(asset) = document.get("asset") {
        if let Some(version) = asset.get("version").and_then(|v| v.as_str()) {
            context.set_version(version);
        }
        // Non-standard property; tolerated but not interpreted.
        if let Some(up_axis) = asset.get("gltfUpAxis").and_then(|v| v.as_str()) {
            warn!(
                url = %url,
                gltf_up_axis = up_axis,
                "tileset declares the non-standard asset.gltfUpAxis property"
            );
        }
    }

    if let Some(root_json) = document.get("root") {
        match build_tile_from_json(root_json, &context, DMat4::IDENTITY, Refine::Replace) {
            Some(root) => {
                tileset.add_context(context);
                tileset.set_supports_raster_overlays(true);
                tileset.set_root(root);
                debug!(url = %url, "tileset document bootstrap complete");
            }
            None => {
                shared.failures.report(TilesetLoadFailure::new(
                    LoadType::TilesetJson,
                    url,
                    "root tile is missing required properties",
                ));
            }
        }
    } else if document.get("format").and_then(|v| v.as_str()) == Some("quantized-mesh-1.0") {
        layer_json::configure_terrain_layer(tileset, context, &document, url);
    } else {
        shared.failures.report(TilesetLoadFailure::new(
            LoadType::TilesetJson,
            url,
            "document declares neither a root tile nor a recognized layer format",
        ));
    }
}

/// Recursively builds a tile (and its children) from a tileset document's
/// tile JSON.
///
/// Returns `None` when required properties are missing; the subtree below
/// a malformed tile is skipped, not the whole document.
pub(crate) fn build_tile_from_json(
    json: &serde_json::Value,
    context: &Arc<TileContext>,
    parent_transform: DMat4,
    parent_refine: Refine,
) -> Option<Arc<Tile>> {
    let object = json.as_object()?;

    let local_transform = object
        .get("transform")
        .and_then(parse_transform)
        .unwrap_or(DMat4::IDENTITY);
    let transform = parent_transform * local_transform;

    let bounding_volume = match object.get("boundingVolume").and_then(BoundingVolume::from_json) {
        Some(volume) => volume,
        None => {
            warn!("tile is missing its required boundingVolume; skipping subtree");
            return None;
        }
    };

    let geometric_error = match object.get("geometricError").and_then(|v| v.as_f64()) {
        Some(value) => value,
        None => {
            warn!("tile is missing its required geometricError; skipping subtree");
            return None;
        }
    };

    let refine = parse_refine(object.get("refine"), parent_refine);

    let mut content_url = String::new();
    let mut content_bounding_volume = None;
    if let Some(content) = object.get("content") {
        let uri_value = content
            .get("uri")
            .or_else(|| content.get("url"))
            .and_then(|v| v.as_str());
        if let Some(uri_value) = uri_value {
            content_url = uri::resolve(context.base_url(), uri_value, false);
        }
        content_bounding_volume = content
            .get("boundingVolume")
            .and_then(BoundingVolume::from_json)
            .map(|volume| transform_bounding_volume(&transform, &volume));
    }

    let implicit_extension = object
        .get("extensions")
        .and_then(|e| e.get("3DTILES_implicit_tiling"));

    let (id, tile_context, is_implicit_root) = match implicit_extension {
        Some(extension) => {
            match build_implicit_root(extension, context, &bounding_volume, &content_url) {
                Some(implicit_context) => (
                    TileId::Quadtree(crate::geometry::QuadtreeTileId::new(0, 0, 0)),
                    implicit_context,
                    true,
                ),
                None => (TileId::Url(content_url.clone()), context.clone(), false),
            }
        }
        None => (TileId::Url(content_url.clone()), context.clone(), false),
    };

    let mut tile = Tile::new(id, tile_context);
    tile.set_transform(transform);
    tile.set_refine(refine);
    tile.set_bounding_volume(transform_bounding_volume(&transform, &bounding_volume));
    tile.set_geometric_error(geometric_error * max_scale_component(&transform));
    if let Some(volume) = content_bounding_volume {
        tile.set_content_bounding_volume(volume);
    }
    if let Some(volume) = object
        .get("viewerRequestVolume")
        .and_then(BoundingVolume::from_json)
    {
        tile.set_viewer_request_volume(transform_bounding_volume(&transform, &volume));
    }

    let tile = Arc::new(tile);

    // An implicit root derives its children from the availability index,
    // never from an explicit children array.
    if !is_implicit_root {
        if let Some(children_json) = object.get("children").and_then(|v| v.as_array()) {
            let children: Vec<Arc<Tile>> = children_json
                .iter()
                .filter_map(|child| build_tile_from_json(child, context, transform, refine))
                .collect();
            if !children.is_empty() {
                tile.attach_children(children);
            }
        }
    }

    Some(tile)
}

/// Builds the implicit tiling descriptor a tile-level extension declares.
///
/// Only region-bounded quadtree subdivision is expressible with this
/// crate's tiling scheme; anything else falls back to treating the tile as
/// explicit.
fn build_implicit_root(
    extension: &serde_json::Value,
    context: &Arc<TileContext>,
    bounding_volume: &BoundingVolume,
    content_template: &str,
) -> Option<Arc<TileContext>> {
    use crate::implicit::{
        AvailabilityIndex, ImplicitTilingContext, Projection, SubdivisionScheme,
    };

    let scheme = extension
        .get("subdivisionScheme")
        .and_then(|v| v.as_str())
        .and_then(SubdivisionScheme::parse);
    let Some(scheme) = scheme else {
        warn!("implicit tiling extension has an unrecognized subdivisionScheme; treating tile as explicit");
        return None;
    };
    if scheme != SubdivisionScheme::Quadtree {
        warn!("octree implicit subdivision is not supported; treating tile as explicit");
        return None;
    }
    if !matches!(bounding_volume, BoundingVolume::Region { .. }) {
        warn!("implicit tiling requires a region bounding volume; treating tile as explicit");
        return None;
    }

    let subtree_levels = extension.get("subtreeLevels").and_then(|v| v.as_u64()).map(|v| v as u32);
    let maximum_level = extension
        .get("maximumLevel")
        .or_else(|| extension.get("availableLevels"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let subtree_template_url = extension
        .get("subtrees")
        .and_then(|s| s.get("uri"))
        .and_then(|v| v.as_str())
        .map(|template| uri::resolve(context.base_url(), template, false));

    let availability = match maximum_level {
        Some(level) => AvailabilityIndex::presuming_levels(level),
        None => AvailabilityIndex::presuming_levels(0),
    };

    let implicit = ImplicitTilingContext {
        tile_template_urls: if content_template.is_empty() {
            Vec::new()
        } else {
            vec![content_template.to_string()]
        },
        subtree_template_url,
        subdivision: scheme,
        projection: Projection::Geographic,
        availability,
        subtree_levels,
        maximum_level,
        credit: None,
    };

    let derived = context.derive_for(context.base_url());
    derived.set_implicit(implicit);
    Some(Arc::new(derived))
}

fn parse_transform(value: &serde_json::Value) -> Option<DMat4> {
    let numbers: Vec<f64> = value.as_array()?.iter().map(|v| v.as_f64()).collect::<Option<_>>()?;
    if numbers.len() != 16 {
        return None;
    }
    let mut array = [0.0; 16];
    array.copy_from_slice(&numbers);
    Some(DMat4::from_cols_array(&array))
}

fn parse_refine(value: Option<&serde_json::Value>, parent_refine: Refine) -> Refine {
    let Some(text) = value.and_then(|v| v.as_str()) else {
        return parent_refine;
    };

    match text {
        "REPLACE" => Refine::Replace,
        "ADD" => Refine::Add,
        other => {
            let upper = other.to_ascii_uppercase();
            match upper.as_str() {
                "REPLACE" | "ADD" => {
                    warn!(
                        refine = other,
                        "tile refine value should be uppercase; accepting it anyway"
                    );
                    if upper == "REPLACE" {
                        Refine::Replace
                    } else {
                        Refine::Add
                    }
                }
                _ => {
                    warn!(refine = other, "unrecognized tile refine value; inheriting parent's");
                    parent_refine
                }
            }
        }
    }
}
