//! `terralod inspect` - bootstrap a tileset and stream its tiles.
//!
//! Drives the load pipeline the way a host application would: request
//! content for every tile down to the chosen depth, call `update_tiles`
//! each iteration, and wait until all loads settle. Prints a per-state
//! summary, reported failures, and attribution credits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use terralod::{
    AssetEndpoint, ContentRegistry, CreditSystem, NoopPrepareRendererResources, ReqwestTransport,
    Tile, TileLoadState, Tileset, TilesetExternals, TilesetOptions, TokioTaskProcessor,
};

use crate::error::CliError;

/// Arguments for the inspect command.
#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Tileset document URL (a tileset.json or terrain layer.json)
    pub url: Option<String>,

    /// Hosted asset id (requires --token)
    #[arg(long, conflicts_with = "url")]
    pub asset_id: Option<u64>,

    /// Access token for the hosting endpoint
    #[arg(long, requires = "asset_id")]
    pub token: Option<String>,

    /// Hosting endpoint base URL
    #[arg(long, default_value = "https://api.cesium.com")]
    pub endpoint: String,

    /// Load tile content down to this tree depth (0 = root only)
    #[arg(long, default_value_t = 1)]
    pub depth: u32,

    /// Seconds to wait for loads to settle
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,
}

/// Run the inspect command.
pub fn run(args: InspectArgs) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Setup(e.to_string()))?;

    let externals = TilesetExternals {
        transport: Arc::new(
            ReqwestTransport::new().map_err(|e| CliError::Setup(e.to_string()))?,
        ),
        renderer: Arc::new(NoopPrepareRendererResources),
        task_processor: Arc::new(TokioTaskProcessor::new(runtime.handle().clone())),
        credits: Arc::new(CreditSystem::new()),
    };
    let credits = externals.credits.clone();
    let registry = Arc::new(ContentRegistry::with_defaults());

    let tileset = match (&args.url, args.asset_id, &args.token) {
        (Some(url), _, _) => {
            Tileset::from_url(externals, registry, url.clone(), TilesetOptions::default())
        }
        (None, Some(asset_id), Some(token)) => Tileset::from_hosted_asset(
            externals,
            registry,
            AssetEndpoint::new(args.endpoint.clone(), asset_id, token.clone()),
            TilesetOptions::default(),
        ),
        _ => {
            return Err(CliError::Usage(
                "provide a tileset URL, or --asset-id together with --token".to_string(),
            ))
        }
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .expect("static template is valid")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("bootstrapping tileset...");

    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    // Wait for the bootstrap continuations to produce a root tile.
    let root = loop {
        tileset.update_tiles();
        if let Some(root) = tileset.root() {
            break root;
        }
        if tileset.loads_in_progress() == 0 {
            spinner.finish_and_clear();
            let reason = tileset
                .load_failures()
                .first()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "no root tile was produced".to_string());
            return Err(CliError::BootstrapFailed(reason));
        }
        if Instant::now() >= deadline {
            spinner.finish_and_clear();
            return Err(CliError::Timeout { seconds: args.timeout });
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    debug!(children = root.children().len(), "root tile ready");

    // Stream content for every tile down to the requested depth, until all
    // of them settle. Tiles reset by a token refresh are requested again on
    // the next pass.
    loop {
        tileset.update_tiles();

        let targets = tiles_to_depth(&root, args.depth);
        let mut pending = 0usize;
        for tile in &targets {
            match tile.state() {
                TileLoadState::Unloaded => {
                    tileset.load_tile_content(tile);
                    pending += 1;
                }
                TileLoadState::ContentLoading
                | TileLoadState::ContentLoaded
                | TileLoadState::FailedTemporarily => pending += 1,
                _ => {}
            }
        }

        spinner.set_message(format!(
            "loading tiles: {} settled, {} pending, {} in flight",
            targets.len() - pending,
            pending,
            tileset.loads_in_progress()
        ));

        if pending == 0 && tileset.loads_in_progress() == 0 {
            break;
        }
        if Instant::now() >= deadline {
            spinner.finish_and_clear();
            return Err(CliError::Timeout { seconds: args.timeout });
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    spinner.finish_and_clear();

    print_summary(&tileset, &root, args.depth, &credits);
    Ok(())
}

fn tiles_to_depth(root: &Arc<Tile>, depth: u32) -> Vec<Arc<Tile>> {
    let mut tiles = Vec::new();
    collect_to_depth(root, 0, depth, &mut tiles);
    tiles
}

fn collect_to_depth(tile: &Arc<Tile>, level: u32, max_level: u32, out: &mut Vec<Arc<Tile>>) {
    out.push(tile.clone());
    if level < max_level {
        for child in tile.children() {
            collect_to_depth(child, level + 1, max_level, out);
        }
    }
}

fn print_summary(tileset: &Tileset, root: &Arc<Tile>, depth: u32, credits: &CreditSystem) {
    let targets = tiles_to_depth(root, depth);
    let all = tileset.tiles();

    let count = |state: TileLoadState| targets.iter().filter(|t| t.state() == state).count();
    let renderable = targets.iter().filter(|t| t.is_renderable()).count();

    println!("Tileset Summary");
    println!("===============");
    println!();
    println!("tiles in tree:        {}", all.len());
    println!("tiles to depth {}:     {}", depth, targets.len());
    println!("  done:               {}", count(TileLoadState::Done));
    println!("  failed:             {}", count(TileLoadState::Failed));
    println!("  without content:    {}", count(TileLoadState::Unloaded));
    println!("  renderable:         {}", renderable);

    let failures = tileset.load_failures();
    if !failures.is_empty() {
        println!();
        println!("failures ({}):", failures.len());
        for failure in failures.iter().take(10) {
            println!("  - {}", failure);
        }
        if failures.len() > 10 {
            println!("  ... and {} more", failures.len() - 10);
        }
    }

    let attribution = credits.snapshot();
    if !attribution.is_empty() {
        println!();
        println!("credits:");
        for html in attribution {
            println!("  - {}", html);
        }
    }
}
