//! End-to-end pipeline tests against a deterministic mock transport.
//!
//! Everything here runs on a `DeferredTaskProcessor`: no work happens until
//! the test pumps it, which makes every interleaving of the fetch, decode,
//! and finalize stages reproducible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

use terralod::{
    AssetEndpoint, BoxFuture, ContentRegistry, CreditSystem, DecodedContent,
    DeferredTaskProcessor, NoopPrepareRendererResources, PrepareRendererResources,
    RendererResourceHandle, Response, TaskProcessor, Tile, TileLoadState, Tileset,
    TilesetExternals, TilesetOptions, Transport, TransportError,
};

// =============================================================================
// Test doubles
// =============================================================================

/// Mock transport serving canned responses keyed by URL, recording every
/// request it sees.
#[derive(Default)]
struct MockTransport {
    responses: Mutex<HashMap<String, Response>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MockTransport {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&self, url: &str, status: u16, content_type: Option<&str>, body: &[u8]) {
        self.responses.lock().insert(
            url.to_string(),
            Response {
                status,
                content_type: content_type.map(str::to_owned),
                body: Bytes::from(body.to_vec()),
            },
        );
    }

    fn request_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|(u, _)| u == url).count()
    }

    fn headers_of_last_request(&self, url: &str) -> Option<Vec<(String, String)>> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .map(|(_, headers)| headers.clone())
    }
}

impl Transport for MockTransport {
    fn request(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> BoxFuture<'static, Result<Response, TransportError>> {
        self.requests.lock().push((url.to_string(), headers.to_vec()));
        let response = self.responses.lock().get(url).cloned().unwrap_or(Response {
            status: 404,
            content_type: None,
            body: Bytes::new(),
        });
        Box::pin(async move { Ok(response) })
    }
}

/// Renderer hooks that count invocations and hand out numbered handles.
#[derive(Default)]
struct CountingRenderer {
    load_preps: AtomicUsize,
    main_preps: AtomicUsize,
    frees: AtomicUsize,
}

impl PrepareRendererResources for CountingRenderer {
    fn prepare_in_load_thread(
        &self,
        _tile: &Tile,
        _content: &DecodedContent,
    ) -> Option<RendererResourceHandle> {
        let n = self.load_preps.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(n))
    }

    fn prepare_in_main_thread(
        &self,
        _tile: &Tile,
        load_thread_result: Option<RendererResourceHandle>,
    ) -> Option<RendererResourceHandle> {
        self.main_preps.fetch_add(1, Ordering::SeqCst);
        load_thread_result
    }

    fn free(
        &self,
        _tile: &Tile,
        _load_thread_result: Option<RendererResourceHandle>,
        _main_thread_result: Option<RendererResourceHandle>,
    ) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    transport: Arc<MockTransport>,
    processor: Arc<DeferredTaskProcessor>,
    renderer: Arc<CountingRenderer>,
    credits: Arc<CreditSystem>,
    registry: Arc<ContentRegistry>,
}

impl Harness {
    fn new() -> Self {
        let mut registry = ContentRegistry::with_defaults();
        registry.register_by_magic(
            *b"b3dm",
            Arc::new(|input| Ok(DecodedContent::with_scene(Box::new(input.data.len())))),
        );
        registry.register_by_content_type(
            "application/vnd.quantized-mesh",
            Arc::new(|input| Ok(DecodedContent::with_scene(Box::new(input.data.len())))),
        );

        Self {
            transport: Arc::new(MockTransport::new()),
            processor: Arc::new(DeferredTaskProcessor::new()),
            renderer: Arc::new(CountingRenderer::default()),
            credits: Arc::new(CreditSystem::new()),
            registry: Arc::new(registry),
        }
    }

    fn externals(&self) -> TilesetExternals {
        TilesetExternals {
            transport: self.transport.clone(),
            renderer: self.renderer.clone(),
            task_processor: self.processor.clone(),
            credits: self.credits.clone(),
        }
    }

    fn tileset_from_url(&self, url: &str) -> Arc<Tileset> {
        Tileset::from_url(
            self.externals(),
            self.registry.clone(),
            url,
            TilesetOptions::default(),
        )
    }
}

const TILESET_URL: &str = "https://example.test/city/tileset.json";

fn simple_tileset_json(child_count: usize) -> String {
    let children: Vec<String> = (0..child_count)
        .map(|i| {
            format!(
                r#"{{
                    "boundingVolume": {{ "sphere": [0, 0, 0, 50] }},
                    "geometricError": 16,
                    "content": {{ "uri": "tiles/{}.b3dm" }}
                }}"#,
                i
            )
        })
        .collect();
    format!(
        r#"{{
            "asset": {{ "version": "1.0" }},
            "geometricError": 512,
            "root": {{
                "boundingVolume": {{ "sphere": [0, 0, 0, 100] }},
                "geometricError": 64,
                "refine": "REPLACE",
                "children": [{}]
            }}
        }}"#,
        children.join(",")
    )
}

// =============================================================================
// Bootstrap and the happy path
// =============================================================================

#[test]
fn test_bootstrap_builds_root_tree() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(2).as_bytes(),
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    assert!(tileset.root().is_none());

    harness.processor.pump_all();

    let root = tileset.root().expect("root tile after bootstrap");
    assert_eq!(root.children().len(), 2);
    assert!(tileset.supports_raster_overlays());
    assert_eq!(tileset.loads_in_progress(), 0);
    assert!(tileset.load_failures().is_empty());
}

#[test]
fn test_tile_loads_through_to_done() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        Some("application/octet-stream"),
        b"b3dm\x01\x00\x00\x00payload",
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();

    let tile = tileset.root().unwrap().children()[0].clone();
    assert_eq!(tile.state(), TileLoadState::Unloaded);

    tileset.load_tile_content(&tile);
    assert_eq!(tile.state(), TileLoadState::ContentLoading);

    harness.processor.pump_all();
    assert_eq!(tile.state(), TileLoadState::ContentLoaded);

    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Done);
    assert!(tile.is_renderable());
    assert_eq!(tileset.loads_in_progress(), 0);

    // The request handle is released on finalization.
    assert!(tile.content_request().is_none());
}

#[test]
fn test_load_content_is_idempotent() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        None,
        b"b3dm\x01\x00\x00\x00",
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    // Two calls in a row never issue two requests.
    tileset.load_tile_content(&tile);
    tileset.load_tile_content(&tile);
    harness.processor.pump_all();
    assert_eq!(
        harness
            .transport
            .request_count("https://example.test/city/tiles/0.b3dm"),
        1
    );

    // Loaded, Done, and Failed states are all no-ops too.
    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Done);
    tileset.load_tile_content(&tile);
    harness.processor.pump_all();
    assert_eq!(
        harness
            .transport
            .request_count("https://example.test/city/tiles/0.b3dm"),
        1
    );
}

#[test]
fn test_update_is_noop_outside_content_loaded() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Unloaded);

    tileset.load_tile_content(&tile);
    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::ContentLoading);
}

// =============================================================================
// Destroy-during-load
// =============================================================================

#[test]
fn test_destroy_during_load_never_reaches_content_loaded() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        None,
        b"b3dm\x01\x00\x00\x00",
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    tileset.load_tile_content(&tile);
    assert_eq!(tile.state(), TileLoadState::ContentLoading);

    // Destruction wins the race before the continuation runs.
    tile.prepare_to_destroy();
    assert_eq!(tile.state(), TileLoadState::Destroying);

    harness.processor.pump_all();
    assert_eq!(tile.state(), TileLoadState::Failed);
    assert_eq!(tileset.loads_in_progress(), 0);
}

#[test]
fn test_destroy_after_decode_queued_still_abandons() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        None,
        b"b3dm\x01\x00\x00\x00",
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    tileset.load_tile_content(&tile);
    // Run only the network completion; the decode task is now queued.
    harness.processor.pump();
    assert_eq!(tile.state(), TileLoadState::ContentLoading);

    tile.prepare_to_destroy();
    harness.processor.pump_all();
    assert_eq!(tile.state(), TileLoadState::Failed);
    tile.with_content(|content| assert!(content.is_none()));
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_http_error_fails_tile_and_reports() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness
        .transport
        .insert("https://example.test/city/tiles/0.b3dm", 500, None, b"");

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    tileset.load_tile_content(&tile);
    harness.processor.pump_all();
    assert_eq!(tile.state(), TileLoadState::FailedTemporarily);
    assert_eq!(tile.content_http_status(), Some(500));

    // No failure hook on a plain context: the next update gives up.
    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Failed);

    let failures = tileset.load_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].http_status, Some(500));
    assert_eq!(tileset.loads_in_progress(), 0);
}

#[test]
fn test_root_document_failure_reports_and_leaves_no_root() {
    let harness = Harness::new();
    harness.transport.insert(TILESET_URL, 200, None, b"this is not json");

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();

    assert!(tileset.root().is_none());
    let failures = tileset.load_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("malformed"));
}

// =============================================================================
// Unload / reload round-trip
// =============================================================================

#[test]
fn test_unload_then_reload_recreates_renderer_resources_once() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        None,
        b"b3dm\x01\x00\x00\x00",
    );

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    tileset.load_tile_content(&tile);
    harness.processor.pump_all();
    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Done);
    assert_eq!(harness.renderer.load_preps.load(Ordering::SeqCst), 1);
    assert_eq!(harness.renderer.main_preps.load(Ordering::SeqCst), 1);

    assert!(tileset.unload_tile_content(&tile));
    assert_eq!(tile.state(), TileLoadState::Unloaded);
    assert_eq!(harness.renderer.frees.load(Ordering::SeqCst), 1);

    tileset.load_tile_content(&tile);
    harness.processor.pump_all();
    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Done);

    // Exactly one further create on each path, no extra frees.
    assert_eq!(harness.renderer.load_preps.load(Ordering::SeqCst), 2);
    assert_eq!(harness.renderer.main_preps.load(Ordering::SeqCst), 2);
    assert_eq!(harness.renderer.frees.load(Ordering::SeqCst), 1);
}

// =============================================================================
// External tilesets (JSON fallback)
// =============================================================================

#[test]
fn test_external_tileset_content_attaches_children() {
    let harness = Harness::new();
    let external_uri = "https://example.test/city/sub/external.json";

    let tileset_json = r#"{
        "asset": { "version": "1.0" },
        "geometricError": 512,
        "root": {
            "boundingVolume": { "sphere": [0, 0, 0, 100] },
            "geometricError": 64,
            "content": { "uri": "sub/external.json" }
        }
    }"#;
    let external_json = r#"{
        "asset": { "version": "1.0" },
        "geometricError": 64,
        "root": {
            "boundingVolume": { "sphere": [0, 0, 0, 50] },
            "geometricError": 32,
            "content": { "uri": "leaf.b3dm" }
        }
    }"#;

    harness
        .transport
        .insert(TILESET_URL, 200, Some("application/json"), tileset_json.as_bytes());
    // Served with a content type nothing is registered for: resolution
    // falls through to the leading-'{' JSON fallback.
    harness
        .transport
        .insert(external_uri, 200, Some("text/plain"), external_json.as_bytes());

    let tileset = harness.tileset_from_url(TILESET_URL);
    harness.processor.pump_all();
    let root = tileset.root().unwrap();

    tileset.load_tile_content(&root);
    harness.processor.pump_all();
    assert_eq!(root.state(), TileLoadState::ContentLoaded);

    tileset.update_tiles();
    assert_eq!(root.state(), TileLoadState::Done);

    // External content: non-renderable, refined past unconditionally,
    // children grafted in, and protected from unload.
    assert!(!root.is_renderable());
    assert!(root.geometric_error() > 1.0e8);
    assert_eq!(root.children().len(), 1);
    let leaf = &root.children()[0];
    assert!(
        matches!(leaf.id(), terralod::TileId::Url(url) if url == "https://example.test/city/sub/leaf.b3dm")
    );
    assert!(!tileset.unload_tile_content(&root));
}

// =============================================================================
// Token refresh protocol
// =============================================================================

const ENDPOINT_URL: &str = "https://api.example.test/v1/assets/99/endpoint?access_token=master";
const ASSET_TILESET_URL: &str = "https://assets.example.test/99/tileset.json";

fn endpoint_response(token: &str) -> String {
    format!(
        r#"{{
            "type": "3DTILES",
            "url": "{}",
            "accessToken": "{}",
            "attributions": [{{ "html": "<span>Example Data</span>" }}]
        }}"#,
        ASSET_TILESET_URL, token
    )
}

fn hosted_harness() -> (Harness, Arc<Tileset>) {
    let harness = Harness::new();
    harness.transport.insert(
        ENDPOINT_URL,
        200,
        Some("application/json"),
        endpoint_response("tokenA").as_bytes(),
    );

    let tileset_json = format!(
        r#"{{
            "asset": {{ "version": "1.0" }},
            "geometricError": 512,
            "root": {{
                "boundingVolume": {{ "sphere": [0, 0, 0, 100] }},
                "geometricError": 64,
                "children": [{}]
            }}
        }}"#,
        (0..5)
            .map(|i| format!(
                r#"{{
                    "boundingVolume": {{ "sphere": [0, 0, 0, 50] }},
                    "geometricError": 16,
                    "content": {{ "uri": "tiles/{}.b3dm" }}
                }}"#,
                i
            ))
            .collect::<Vec<_>>()
            .join(",")
    );
    harness.transport.insert(
        ASSET_TILESET_URL,
        200,
        Some("application/json"),
        tileset_json.as_bytes(),
    );

    let tileset = Tileset::from_hosted_asset(
        harness.externals(),
        harness.registry.clone(),
        AssetEndpoint::new("https://api.example.test", 99, "master"),
        TilesetOptions::default(),
    );
    harness.processor.pump_all();
    (harness, tileset)
}

#[test]
fn test_hosted_bootstrap_installs_token_and_credits() {
    let (harness, tileset) = hosted_harness();

    let root = tileset.root().expect("root after hosted bootstrap");
    assert_eq!(root.children().len(), 5);

    let headers = harness
        .transport
        .headers_of_last_request(ASSET_TILESET_URL)
        .unwrap();
    assert!(headers.contains(&("Authorization".to_string(), "Bearer tokenA".to_string())));

    assert_eq!(
        harness.credits.snapshot(),
        vec!["<span>Example Data</span>".to_string()]
    );
}

#[test]
fn test_five_401s_trigger_exactly_one_refresh_and_retry() {
    let (harness, tileset) = hosted_harness();
    let root = tileset.root().unwrap();
    let children: Vec<Arc<Tile>> = root.children().to_vec();

    for i in 0..5 {
        harness.transport.insert(
            &format!("https://assets.example.test/99/tiles/{}.b3dm", i),
            401,
            None,
            b"",
        );
    }
    for child in &children {
        tileset.load_tile_content(child);
    }
    harness.processor.pump_all();
    for child in &children {
        assert_eq!(child.state(), TileLoadState::FailedTemporarily);
        assert_eq!(child.content_http_status(), Some(401));
    }

    // The refresh must succeed with a new token.
    harness.transport.insert(
        ENDPOINT_URL,
        200,
        Some("application/json"),
        endpoint_response("tokenB").as_bytes(),
    );

    // All five report 401 in the same frame; only one refresh goes out.
    tileset.update_tiles();
    harness.processor.pump_all();

    assert_eq!(harness.transport.request_count(ENDPOINT_URL), 2);
    for child in &children {
        assert_eq!(child.state(), TileLoadState::Unloaded);
    }
    assert_eq!(
        children[0]
            .context()
            .headers()
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone()),
        Some("Bearer tokenB".to_string())
    );
    assert_eq!(tileset.loads_in_progress(), 0);

    // Retried tiles now load with the refreshed header.
    for i in 0..5 {
        harness.transport.insert(
            &format!("https://assets.example.test/99/tiles/{}.b3dm", i),
            200,
            None,
            b"b3dm\x01\x00\x00\x00",
        );
    }
    for child in &children {
        tileset.load_tile_content(child);
    }
    harness.processor.pump_all();
    tileset.update_tiles();
    for child in &children {
        assert_eq!(child.state(), TileLoadState::Done);
    }
    let headers = harness
        .transport
        .headers_of_last_request("https://assets.example.test/99/tiles/0.b3dm")
        .unwrap();
    assert!(headers.contains(&("Authorization".to_string(), "Bearer tokenB".to_string())));
}

#[test]
fn test_failed_refresh_marks_tiles_permanently_failed() {
    let (harness, tileset) = hosted_harness();
    let root = tileset.root().unwrap();
    let children: Vec<Arc<Tile>> = root.children().to_vec();

    for i in 0..5 {
        harness.transport.insert(
            &format!("https://assets.example.test/99/tiles/{}.b3dm", i),
            401,
            None,
            b"",
        );
    }
    for child in &children {
        tileset.load_tile_content(child);
    }
    harness.processor.pump_all();

    // The refresh itself fails.
    harness.transport.insert(ENDPOINT_URL, 500, None, b"");

    tileset.update_tiles();
    harness.processor.pump_all();

    // No tile is silently left waiting forever.
    for child in &children {
        assert_eq!(child.state(), TileLoadState::Failed);
    }
    assert_eq!(tileset.loads_in_progress(), 0);
}

#[test]
fn test_non_401_failure_gives_up_without_refresh() {
    let (harness, tileset) = hosted_harness();
    let root = tileset.root().unwrap();
    let child = root.children()[0].clone();

    harness.transport.insert(
        "https://assets.example.test/99/tiles/0.b3dm",
        403,
        None,
        b"",
    );
    tileset.load_tile_content(&child);
    harness.processor.pump_all();
    assert_eq!(child.state(), TileLoadState::FailedTemporarily);

    tileset.update_tiles();
    harness.processor.pump_all();
    assert_eq!(child.state(), TileLoadState::Failed);
    // Bootstrap queried the endpoint once; no refresh was issued.
    assert_eq!(harness.transport.request_count(ENDPOINT_URL), 1);
}

// =============================================================================
// Terrain layers
// =============================================================================

const LAYER_URL: &str = "https://terrain.example.test/world/layer.json";

#[test]
fn test_terrain_layer_builds_quadtree_and_chains_parent() {
    let harness = Harness::new();
    let layer_json = r#"{
        "format": "quantized-mesh-1.0",
        "version": "1.2.0",
        "projection": "EPSG:4326",
        "attribution": "Terrain (c) Example",
        "tiles": ["{z}/{x}/{y}.terrain?v={version}"],
        "extensions": ["octvertexnormals"],
        "available": [
            [{ "startX": 0, "startY": 0, "endX": 1, "endY": 0 }]
        ],
        "maxzoom": 14,
        "parentUrl": "../base/layer.json"
    }"#;
    let parent_layer_json = r#"{
        "format": "quantized-mesh-1.0",
        "version": "1.0.0",
        "projection": "EPSG:4326",
        "tiles": ["{z}/{x}/{y}.terrain"]
    }"#;

    harness
        .transport
        .insert(LAYER_URL, 200, Some("application/json"), layer_json.as_bytes());
    harness.transport.insert(
        "https://terrain.example.test/base/layer.json",
        200,
        Some("application/json"),
        parent_layer_json.as_bytes(),
    );

    let tileset = harness.tileset_from_url(LAYER_URL);
    harness.processor.pump_all();

    let root = tileset.root().expect("synthetic terrain root");
    assert!(!tileset.supports_raster_overlays());
    assert_eq!(root.children().len(), 2);

    let context = root.context();
    assert_eq!(context.version(), Some("1.2.0"));
    assert!(context.underlying().is_some());
    assert_eq!(
        context.underlying().unwrap().base_url(),
        "https://terrain.example.test/base/layer.json"
    );
    assert_eq!(harness.credits.snapshot(), vec!["Terrain (c) Example".to_string()]);

    // Loading a level-0 tile substitutes the template and sends the
    // quantized-mesh Accept header.
    let child = root.children()[0].clone();
    let expected_url =
        "https://terrain.example.test/world/0/0/0.terrain?v=1.2.0&extensions=octvertexnormals";
    harness.transport.insert(
        expected_url,
        200,
        Some("application/vnd.quantized-mesh; extensions=octvertexnormals"),
        b"QM",
    );

    tileset.load_tile_content(&child);
    harness.processor.pump_all();
    assert_eq!(child.state(), TileLoadState::ContentLoaded);

    let headers = harness.transport.headers_of_last_request(expected_url).unwrap();
    assert!(headers
        .iter()
        .any(|(name, value)| name == "Accept" && value.contains("quantized-mesh")));

    tileset.update_tiles();
    assert_eq!(child.state(), TileLoadState::Done);

    // Availability listed level 1 tiles x 0..=1, y 0: expansion creates
    // exactly those children under the level-0 tiles.
    let grandchildren = child.children();
    assert_eq!(grandchildren.len(), 2);
}

#[test]
fn test_unsupported_projection_is_reported_not_fatal() {
    let harness = Harness::new();
    let layer_json = r#"{
        "format": "quantized-mesh-1.0",
        "projection": "EPSG:32633",
        "tiles": ["{z}/{x}/{y}.terrain"]
    }"#;
    harness
        .transport
        .insert(LAYER_URL, 200, Some("application/json"), layer_json.as_bytes());

    let tileset = harness.tileset_from_url(LAYER_URL);
    harness.processor.pump_all();

    assert!(tileset.root().is_none());
    let failures = tileset.load_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("unsupported layer projection"));
}

// =============================================================================
// Accounting
// =============================================================================

#[test]
fn test_decoder_failure_still_settles_accounting() {
    let harness = Harness::new();

    let mut registry = ContentRegistry::with_defaults();
    registry.register_by_magic(
        *b"boom",
        Arc::new(|_input| panic!("decoder exploded")),
    );
    let registry = Arc::new(registry);

    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        None,
        b"boom\x00\x00\x00\x00",
    );

    let tileset = Tileset::from_url(
        harness.externals(),
        registry,
        TILESET_URL,
        TilesetOptions::default(),
    );
    harness.processor.pump_all();
    let tile = tileset.root().unwrap().children()[0].clone();

    tileset.load_tile_content(&tile);
    harness.processor.pump_all();

    assert_eq!(tile.state(), TileLoadState::Failed);
    assert_eq!(tileset.loads_in_progress(), 0);
    assert_eq!(tileset.load_failures().len(), 1);
}

#[test]
fn test_noop_renderer_pipeline_still_completes() {
    let harness = Harness::new();
    harness.transport.insert(
        TILESET_URL,
        200,
        Some("application/json"),
        simple_tileset_json(1).as_bytes(),
    );
    harness.transport.insert(
        "https://example.test/city/tiles/0.b3dm",
        200,
        None,
        b"b3dm\x01\x00\x00\x00",
    );

    let externals = TilesetExternals {
        transport: harness.transport.clone(),
        renderer: Arc::new(NoopPrepareRendererResources),
        task_processor: harness.processor.clone(),
        credits: harness.credits.clone(),
    };
    let tileset = Tileset::from_url(
        externals,
        harness.registry.clone(),
        TILESET_URL,
        TilesetOptions::default(),
    );
    harness.processor.pump_all();

    let tile = tileset.root().unwrap().children()[0].clone();
    tileset.load_tile_content(&tile);
    harness.processor.pump_all();
    tileset.update_tiles();
    assert_eq!(tile.state(), TileLoadState::Done);
}
