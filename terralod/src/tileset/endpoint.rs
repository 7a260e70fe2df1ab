//! Hosted-asset endpoint bootstrap and the 401 token-refresh protocol.
//!
//! A hosted asset is resolved through a token-issuing endpoint: the
//! endpoint response names the tileset document URL, an access token, and
//! attribution requirements. The bearer token eventually expires; tiles
//! then fail with HTTP 401 and are routed here by the failed-tile
//! callback. The protocol guarantees at most one refresh request in flight
//! per tileset, rewrites the context's `Authorization` header in place on
//! success, and sweeps every 401-failed tile of that context back to
//! `Unloaded` (success) or permanently failed (refresh failure), clearing
//! the refreshing flag and releasing its accounting exactly once either
//! way.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::context::{FailedTileAction, FailedTileCallback, TileContext};
use crate::error::{LoadType, TilesetLoadFailure};
use crate::tile::{Tile, TileLoadState};
use crate::tileset::{bootstrap, Tileset};
use crate::uri;

/// Configuration for a tileset resolved through a hosting endpoint.
#[derive(Clone, Debug)]
pub struct AssetEndpoint {
    /// Endpoint API base, e.g. `https://api.example.com`.
    pub endpoint_base: String,

    /// The asset to stream.
    pub asset_id: u64,

    /// Access token presented when querying the endpoint.
    pub access_token: String,
}

impl AssetEndpoint {
    pub fn new(
        endpoint_base: impl Into<String>,
        asset_id: u64,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_base: endpoint_base.into(),
            asset_id,
            access_token: access_token.into(),
        }
    }

    /// The endpoint URL queried at bootstrap and again on token refresh.
    pub(crate) fn endpoint_url(&self) -> String {
        format!(
            "{}/v1/assets/{}/endpoint?access_token={}",
            self.endpoint_base.trim_end_matches('/'),
            self.asset_id,
            self.access_token
        )
    }
}

/// Starts the endpoint bootstrap for a tileset constructed with
/// `Tileset::from_hosted_asset`.
pub(crate) fn start_load_from_endpoint(tileset: &Arc<Tileset>) {
    let Some(asset) = tileset.asset() else {
        return;
    };
    let url = asset.endpoint_url();

    let shared = tileset.shared().clone();
    let guard = shared.accounting.start();
    let response_future = shared.externals.transport.request(&url, &[]);

    debug!(asset_id = asset.asset_id, "requesting hosted asset endpoint");

    let tileset_bg = tileset.clone();
    let shared_bg = shared.clone();
    shared.externals.task_processor.spawn(Box::pin(async move {
        let result = response_future.await;
        let tileset_task = tileset_bg.clone();
        shared_bg.externals.task_processor.start_task(Box::new(move || {
            let _guard = guard;
            process_endpoint_response(&tileset_task, &url, result);
        }));
    }));
}

fn process_endpoint_response(
    tileset: &Arc<Tileset>,
    url: &str,
    result: Result<crate::transport::Response, crate::transport::TransportError>,
) {
    let shared = tileset.shared();

    let response = match result {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
            shared.failures.report(
                TilesetLoadFailure::new(
                    LoadType::AssetEndpoint,
                    url,
                    format!("HTTP {}", response.status),
                )
                .with_status(response.status),
            );
            return;
        }
        Err(error) => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::AssetEndpoint,
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
                LoadType::AssetEndpoint,
                url,
                format!("malformed endpoint response: {}", error),
            ));
            return;
        }
    };

    let asset_type = document.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let asset_url = document.get("url").and_then(|v| v.as_str()).unwrap_or("");
    let access_token = document
        .get("accessToken")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let document_url = match asset_type {
        // Terrain resources are layer documents one level below the
        // advertised URL.
        "TERRAIN" => uri::resolve(asset_url, "layer.json", true),
        "3DTILES" => asset_url.to_string(),
        other => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::AssetEndpoint,
                url,
                format!("unsupported asset type {:?}", other),
            ));
            return;
        }
    };

    if let Some(attributions) = document.get("attributions").and_then(|v| v.as_array()) {
        for attribution in attributions {
            if let Some(html) = attribution.get("html").and_then(|v| v.as_str()) {
                shared.externals.credits.add_credit(html);
            }
        }
    }

    let context = Arc::new({
        let mut context = TileContext::new(document_url.clone());
        context.push_header("Authorization", format!("Bearer {}", access_token));
        context.set_failed_tile_callback(make_failed_tile_callback(tileset));
        context
    });

    bootstrap::start_load_root_document(tileset, Some(context), document_url);
}

/// Builds the failure hook installed on hosted-asset contexts.
///
/// Anything other than an HTTP 401 gives up immediately. The first 401
/// starts a token refresh; 401s observed while a refresh is already in
/// flight just wait for it.
pub(crate) fn make_failed_tile_callback(tileset: &Arc<Tileset>) -> FailedTileCallback {
    let weak: Weak<Tileset> = Arc::downgrade(tileset);
    Arc::new(move |tile: &Tile| {
        let Some(tileset) = weak.upgrade() else {
            return FailedTileAction::GiveUp;
        };
        let Some(status) = tile.content_http_status() else {
            return FailedTileAction::GiveUp;
        };
        if status != 401 {
            return FailedTileAction::GiveUp;
        }
        if tileset.asset().is_none() {
            return FailedTileAction::GiveUp;
        }

        if tileset.try_begin_token_refresh() {
            start_token_refresh(&tileset, tile.context().clone());
        }
        FailedTileAction::Wait
    })
}

/// Issues the refresh request. The caller has already claimed the
/// single-in-flight slot.
fn start_token_refresh(tileset: &Arc<Tileset>, context: Arc<TileContext>) {
    let Some(asset) = tileset.asset() else {
        tileset.end_token_refresh();
        return;
    };
    let url = asset.endpoint_url();

    let shared = tileset.shared().clone();
    // Counts as an in-flight load so destructors and shutdown wait for the
    // refresh too.
    let guard = shared.accounting.start();
    let response_future = shared.externals.transport.request(&url, &[]);

    debug!(asset_id = asset.asset_id, "refreshing expired access token");

    let weak = Arc::downgrade(tileset);
    let shared_bg = shared.clone();
    shared.externals.task_processor.spawn(Box::pin(async move {
        let result = response_future.await;
        let shared_task = shared_bg.clone();
        shared_bg.externals.task_processor.start_task(Box::new(move || {
            let _guard = guard;
            process_token_refresh_response(&weak, &context, &url, result);
        }));
    }));
}

fn process_token_refresh_response(
    tileset: &Weak<Tileset>,
    context: &Arc<TileContext>,
    url: &str,
    result: Result<crate::transport::Response, crate::transport::TransportError>,
) {
    let Some(tileset) = tileset.upgrade() else {
        return;
    };
    let shared = tileset.shared();

    let refreshed_token = match result {
        Ok(response) if response.is_success() => {
            serde_json::from_slice::<serde_json::Value>(&response.body)
                .ok()
                .and_then(|document| {
                    document
                        .get("accessToken")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned)
                })
        }
        Ok(response) => {
            shared.failures.report(
                TilesetLoadFailure::new(
                    LoadType::AssetEndpoint,
                    url,
                    format!("token refresh failed with HTTP {}", response.status),
                )
                .with_status(response.status),
            );
            None
        }
        Err(error) => {
            shared.failures.report(TilesetLoadFailure::new(
                LoadType::AssetEndpoint,
                url,
                format!("token refresh failed: {}", error),
            ));
            None
        }
    };

    let succeeded = match &refreshed_token {
        Some(token) => {
            context.set_header("Authorization", format!("Bearer {}", token));
            true
        }
        None => {
            warn!(url = %url, "token refresh did not produce a new access token");
            false
        }
    };

    // Sweep every tile of this context that failed with 401: back to
    // Unloaded for retry on success, permanently failed otherwise.
    let renderer = shared.externals.renderer.clone();
    for tile in tileset.tiles_in_context(context) {
        if tile.state() == TileLoadState::FailedTemporarily
            && tile.content_http_status() == Some(401)
        {
            if succeeded {
                tile.unload_content(renderer.as_ref());
            } else {
                tile.mark_permanently_failed();
            }
        }
    }

    tileset.end_token_refresh();
}
