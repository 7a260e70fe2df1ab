//! The asynchronous tile load pipeline.
//!
//! Drives a tile from `load_content` through to `Done`, crossing thread
//! boundaries at exactly the two points where it matters:
//!
//! 1. The caller's thread issues the network request and returns without
//!    blocking.
//! 2. The transport's completion may land on any thread; it is immediately
//!    normalized onto a worker via the task processor, where response
//!    validation, decode, and load-thread renderer preparation run.
//! 3. Main-thread renderer preparation and content finalization happen in
//!    the per-frame [`update_tile`] step.
//!
//! Cancellation is a flag checked at stage boundaries, not a forced abort;
//! a continuation racing tile destruction observes the `Destroying` state
//! and abandons its result. Every path, success or failure, releases its
//! load-accounting guard exactly once.

mod accounting;

pub use accounting::LoadAccounting;
pub(crate) use accounting::LoadGuard;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::context::{FailedTileAction, TileContext};
use crate::error::{LoadType, TilesetLoadFailure};
use crate::geometry::{BoundingVolume, QuadtreeTileId, TileId};
use crate::implicit::apply_subtree_json;
use crate::registry::DecodeInput;
use crate::tile::{
    ContentRequest, DecodedContent, Tile, TileLoadState, CONTENTLESS_GEOMETRIC_ERROR,
};
use crate::tileset::{PipelineShared, Tileset};
use crate::transport::{Response, TransportError};

/// Height bounds assumed for implicit tiles whose parent volume carries
/// none.
const DEFAULT_MIN_HEIGHT: f64 = -1000.0;
const DEFAULT_MAX_HEIGHT: f64 = 9000.0;

/// Tracks which subtree availability documents have been requested, so a
/// subtree is fetched at most once per tileset.
#[derive(Debug, Default)]
pub(crate) struct SubtreeTracker {
    requested: Mutex<HashSet<QuadtreeTileId>>,
}

impl SubtreeTracker {
    fn try_claim(&self, id: QuadtreeTileId) -> bool {
        self.requested.lock().insert(id)
    }
}

/// Begins loading a tile's content.
///
/// Only fires from `Unloaded`: in any other state this is a no-op, and
/// calling it twice in a row never issues two requests. Immediately sets
/// `ContentLoading`, issues the request, and returns without blocking.
pub(crate) fn load_content(shared: &Arc<PipelineShared>, tile: &Arc<Tile>) {
    if !tile.try_begin_loading() {
        return;
    }

    let url = match resolve_content_url(tile) {
        Some(url) => url,
        None => {
            // Nothing to fetch: the tile is loaded with no content at all.
            tile.set_state(TileLoadState::ContentLoaded);
            return;
        }
    };

    let request = Arc::new(ContentRequest::new(url.clone()));
    tile.set_request(request.clone());

    let guard = shared.accounting.start();
    let headers = tile.context().resolved_headers();
    let response_future = shared.externals.transport.request(&url, &headers);
    let token = request.cancellation_token();

    debug!(url = %url, "issuing tile content request");

    let shared_bg = shared.clone();
    let tile_bg = tile.clone();
    shared.externals.task_processor.spawn(Box::pin(async move {
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = response_future => Some(result),
        };

        // Normalize onto a worker thread before any CPU-bound work.
        let shared_task = shared_bg.clone();
        shared_bg.externals.task_processor.start_task(Box::new(move || {
            process_response(&shared_task, &tile_bg, &request, outcome, guard);
        }));
    }));
}

/// Worker-thread continuation: validates the response, decodes it, and
/// commits the result unless the tile was destroyed in the meantime.
fn process_response(
    shared: &Arc<PipelineShared>,
    tile: &Arc<Tile>,
    request: &Arc<ContentRequest>,
    outcome: Option<Result<Response, TransportError>>,
    guard: LoadGuard,
) {
    // Accounting is released when the guard drops at the end of this
    // function, whatever path we take out of it.
    let _guard = guard;

    if tile.state() == TileLoadState::Destroying {
        tile.set_state(TileLoadState::Failed);
        return;
    }
    if request.is_cancelled() {
        // cancel_load_content already reset the state; this result belongs
        // to a request nobody owns anymore.
        return;
    }

    let Some(result) = outcome else {
        return;
    };

    let response = match result {
        Ok(response) => response,
        Err(error) => {
            request.record_status(0);
            warn!(url = %request.url(), error = %error, "did not receive a valid response for tile content");
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::TileContent,
                request.url(),
                error.to_string(),
            ));
            tile.set_state(TileLoadState::FailedTemporarily);
            return;
        }
    };

    request.record_status(response.status);

    if !response.is_success() {
        warn!(url = %request.url(), status = response.status, "received error status for tile content");
        shared.failures.report(
            TilesetLoadFailure::new(
                LoadType::TileContent,
                request.url(),
                format!("HTTP {}", response.status),
            )
            .with_status(response.status),
        );
        tile.set_state(TileLoadState::FailedTemporarily);
        return;
    }

    let input = DecodeInput {
        context: tile.context().clone(),
        tile_id: tile.id().clone(),
        bounding_volume: tile.bounding_volume(),
        geometric_error: tile.geometric_error(),
        transform: *tile.transform(),
        content_bounding_volume: tile.content_bounding_volume().cloned(),
        refine: tile.refine(),
        url: request.url().to_string(),
        content_type: response.content_type.clone(),
        data: response.body.clone(),
    };

    let decoded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        shared.registry.create_content(input)
    }));

    let mut content = match decoded {
        Ok(Ok(Some(content))) => content,
        Ok(Ok(None)) => DecodedContent::empty(),
        Ok(Err(decode_error)) => {
            shared.failures.report(
                TilesetLoadFailure::new(LoadType::TileContent, request.url(), decode_error.to_string())
                    .with_status(response.status),
            );
            tile.set_state(TileLoadState::Failed);
            return;
        }
        Err(_panic) => {
            error!(url = %request.url(), "content decoder panicked");
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::TileContent,
                request.url(),
                "content decoder panicked",
            ));
            tile.set_state(TileLoadState::Failed);
            return;
        }
    };
    content.http_status = response.status;

    let load_thread_result = if content.scene.is_some() {
        shared.externals.renderer.prepare_in_load_thread(tile, &content)
    } else {
        None
    };

    // Re-check before committing: the tile may have been marked for
    // destruction (or this request cancelled and the tile reloaded) while
    // we were decoding. A stale continuation must never write into a live
    // tile.
    let destroying = tile.state() == TileLoadState::Destroying;
    if destroying || request.is_cancelled() {
        if load_thread_result.is_some() {
            shared.externals.renderer.free(tile, load_thread_result, None);
        }
        if destroying {
            tile.set_state(TileLoadState::Failed);
        }
        return;
    }

    tile.set_content(content);
    tile.resources_mut().load_thread = load_thread_result;
    tile.set_state(TileLoadState::ContentLoaded);
}

/// Main-thread per-frame step for one tile.
///
/// Finalizes `ContentLoaded` tiles (renderer main-thread preparation,
/// external-children attachment, metadata application) into `Done`, and
/// dispatches `FailedTemporarily` tiles to their context's failure hook.
/// For every other state this does not touch the tile's state.
pub(crate) fn update_tile(tileset: &Tileset, tile: &Arc<Tile>) {
    match tile.state() {
        TileLoadState::FailedTemporarily => {
            let action = match tile.context().failed_tile_callback() {
                Some(callback) => callback(tile),
                None => FailedTileAction::GiveUp,
            };
            match action {
                FailedTileAction::GiveUp => tile.set_state(TileLoadState::Failed),
                FailedTileAction::Retry => {
                    tile.unload_content(tileset.shared().externals.renderer.as_ref());
                }
                FailedTileAction::Wait => {}
            }
        }
        TileLoadState::ContentLoaded => {
            finalize_content(tileset, tile);
        }
        _ => {}
    }

    create_implicit_children(tileset.shared(), tile);
}

fn finalize_content(tileset: &Tileset, tile: &Arc<Tile>) {
    let renderer = tileset.shared().externals.renderer.clone();

    let load_thread_result = tile.resources_mut().load_thread.take();
    let main_thread_result = renderer.prepare_in_main_thread(tile, load_thread_result);
    tile.resources_mut().main_thread = main_thread_result;

    let (has_content, has_scene, children, new_context, updated_volume, ranges) = {
        let mut guard = tile.content_mut();
        match guard.as_mut() {
            Some(content) => (
                true,
                content.scene.is_some(),
                content.external_children.clone(),
                content.new_context.take(),
                content.updated_bounding_volume.take(),
                std::mem::take(&mut content.available_tile_ranges),
            ),
            None => (false, false, None, None, None, Vec::new()),
        }
    };

    // Children delivered by content (external tilesets) apply only if the
    // tile has none of its own.
    if let Some(children) = children {
        if tile.children().is_empty() && !children.is_empty() {
            tile.attach_children(children);
            if let Some(context) = new_context {
                tileset.add_context(context);
            }
        }
    }

    // Content with no renderable payload must always be refined past.
    if has_content && !has_scene {
        tile.set_geometric_error(CONTENTLESS_GEOMETRIC_ERROR);
    }

    if let Some(volume) = updated_volume {
        tile.set_bounding_volume(volume);
    }

    if !ranges.is_empty() {
        if let Some(implicit) = tile.context().implicit() {
            for range in ranges {
                implicit.availability.add_range(range);
            }
        }
    }

    tile.clear_request();
    tile.set_state(TileLoadState::Done);
}

/// Expands implicit children for quadtree-addressed tiles whose context
/// carries an implicit tiling descriptor.
fn create_implicit_children(shared: &Arc<PipelineShared>, tile: &Arc<Tile>) {
    if !tile.children().is_empty() {
        return;
    }
    let id = match tile.id() {
        TileId::Quadtree(id) => *id,
        _ => return,
    };
    let Some(implicit) = tile.context().implicit() else {
        return;
    };

    if let Some(maximum_level) = implicit.maximum_level {
        if id.level >= maximum_level {
            return;
        }
    }

    let child_ids = id.children();

    // Entering a new subtree generation: kick off availability fetches so
    // later frames can expand further.
    if let Some(subtree_levels) = implicit.subtree_levels {
        if subtree_levels > 0
            && implicit.subtree_template_url.is_some()
            && (id.level + 1) % subtree_levels == 0
        {
            for child_id in &child_ids {
                request_subtree(shared, tile.context(), *child_id);
            }
        }
    }

    let (min_height, max_height) = match tile.bounding_volume() {
        BoundingVolume::Region {
            min_height,
            max_height,
            ..
        } => (min_height, max_height),
        _ => (DEFAULT_MIN_HEIGHT, DEFAULT_MAX_HEIGHT),
    };

    let available: Vec<QuadtreeTileId> = child_ids
        .into_iter()
        .filter(|child_id| implicit.availability.is_available(child_id))
        .collect();
    if available.is_empty() {
        return;
    }

    let geometric_error = tile.geometric_error() * 0.5;
    let children: Vec<Arc<Tile>> = available
        .into_iter()
        .map(|child_id| {
            let (west, south, east, north) = implicit.rectangle_for_tile(&child_id);
            let mut child = Tile::new(TileId::Quadtree(child_id), tile.context().clone());
            child.set_refine(tile.refine());
            child.set_transform(*tile.transform());
            child.set_bounding_volume(BoundingVolume::Region {
                west,
                south,
                east,
                north,
                min_height,
                max_height,
            });
            child.set_geometric_error(geometric_error);
            Arc::new(child)
        })
        .collect();

    tile.attach_children(children);
}

/// Fetches a subtree availability document, at most once per subtree root.
fn request_subtree(shared: &Arc<PipelineShared>, context: &Arc<TileContext>, root: QuadtreeTileId) {
    let Some(implicit) = context.implicit() else {
        return;
    };
    let Some(url) = implicit.subtree_url(&root, context.version()) else {
        return;
    };
    if !shared.subtrees.try_claim(root) {
        return;
    }

    let guard = shared.accounting.start();
    let headers = context.resolved_headers();
    let response_future = shared.externals.transport.request(&url, &headers);

    debug!(url = %url, level = root.level, x = root.x, y = root.y, "requesting subtree availability");

    let shared_bg = shared.clone();
    let context_bg = context.clone();
    shared.externals.task_processor.spawn(Box::pin(async move {
        let result = response_future.await;
        let shared_task = shared_bg.clone();
        shared_bg.externals.task_processor.start_task(Box::new(move || {
            let _guard = guard;
            process_subtree_response(&shared_task, &context_bg, root, &url, result);
        }));
    }));
}

fn process_subtree_response(
    shared: &Arc<PipelineShared>,
    context: &Arc<TileContext>,
    root: QuadtreeTileId,
    url: &str,
    result: Result<Response, TransportError>,
) {
    let Some(implicit) = context.implicit() else {
        return;
    };
    let subtree_levels = implicit.subtree_levels.unwrap_or(1);

    let response = match result {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
            shared.failures.report(
                TilesetLoadFailure::new(
                    LoadType::TileSubtree,
                    url,
                    format!("HTTP {}", response.status),
                )
                .with_status(response.status),
            );
            return;
        }
        Err(error) => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::TileSubtree,
                url,
                error.to_string(),
            ));
            return;
        }
    };

    // Binary subtrees go through the content registry like any other
    // payload; a registered decoder reports availability through
    // `available_tile_ranges`. JSON subtrees are interpreted here.
    if response.body.len() >= 4 && response.body[..4] == *b"subt" {
        let input = DecodeInput {
            context: context.clone(),
            tile_id: TileId::Quadtree(root),
            bounding_volume: BoundingVolume::Sphere {
                center: glam::DVec3::ZERO,
                radius: 0.0,
            },
            geometric_error: 0.0,
            transform: glam::DMat4::IDENTITY,
            content_bounding_volume: None,
            refine: crate::tile::Refine::Replace,
            url: url.to_string(),
            content_type: response.content_type.clone(),
            data: response.body.clone(),
        };
        match shared.registry.create_content(input) {
            Ok(Some(content)) => {
                for range in content.available_tile_ranges {
                    implicit.availability.add_range(range);
                }
            }
            Ok(None) => {
                shared.failures.report(TilesetLoadFailure::new(
                    LoadType::TileSubtree,
                    url,
                    "no decoder registered for binary subtree payload",
                ));
            }
            Err(error) => {
                shared.failures.report(TilesetLoadFailure::new(
                    LoadType::TileSubtree,
                    url,
                    error.to_string(),
                ));
            }
        }
        return;
    }

    match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(document) => {
            apply_subtree_json(&implicit.availability, &document, &root, subtree_levels);
        }
        Err(error) => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::TileSubtree,
                url,
                format!("malformed subtree document: {}", error),
            ));
        }
    }
}

fn resolve_content_url(tile: &Tile) -> Option<String> {
    match tile.id() {
        TileId::Url(url) if !url.is_empty() => Some(url.clone()),
        TileId::Url(_) => None,
        TileId::Quadtree(id) => {
            let context = tile.context();
            context
                .implicit()
                .and_then(|implicit| implicit.tile_url(id, context.version()))
        }
        TileId::Octree(_) => {
            warn!(tile_id = ?tile.id(), "octree implicit content is not resolvable without a registered template");
            None
        }
    }
}
