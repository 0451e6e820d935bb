use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tile_watch::capture::{CommandCapture, FileCapture};
use tile_watch::codec;
use tile_watch::config::{
    DiffConfig, WatchConfig, DEFAULT_DIFF_THRESHOLD_PIXEL, DEFAULT_TILE_PIXEL_THRESHOLD,
    DEFAULT_TILE_SIZE, DEFAULT_YELLOW_ALPHA,
};
use tile_watch::decision::decide;
use tile_watch::logging::init_logger_exe;
use tile_watch::monitor::Monitor;
use tile_watch::notify::WebhookNotifier;
use tile_watch::overlay;
use tile_watch::schedule::{MonitoringWindow, Tick, Watcher};
use tile_watch::storage::FsStorage;
use tile_watch::tiles;
use tile_watch::util::{abs_path, ensure_parent_dir, write_json_pretty};

#[derive(Parser, Debug)]
#[command(
    name = "tile-watch",
    version,
    about = "Capture a page periodically and report tile-level visual changes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Compare two images once and emit a JSON summary
    Diff(DiffArgs),
    /// Run one cycle against the stored baseline using an existing capture file
    Check(CheckArgs),
    /// Capture on a schedule and notify on changes
    Watch(WatchArgs),
    /// Print the effective, validated configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Per-channel difference a pixel must exceed to count as changed
    #[arg(long, default_value_t = DEFAULT_DIFF_THRESHOLD_PIXEL)]
    diff_threshold_pixel: u8,
    /// Tile edge length in pixels
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    tile_size: u32,
    /// Changed pixels needed to mark a tile as changed
    #[arg(long, default_value_t = DEFAULT_TILE_PIXEL_THRESHOLD)]
    tile_pixel_threshold: u32,
    /// Highlight opacity in (0, 1]
    #[arg(long, default_value_t = DEFAULT_YELLOW_ALPHA)]
    yellow_alpha: f32,
}

#[derive(Args, Debug)]
struct DiffArgs {
    /// Path to previous image
    previous: PathBuf,
    /// Path to current image
    current: PathBuf,
    /// Path to write the highlighted overlay (PNG)
    #[arg(long)]
    overlay_out: Option<PathBuf>,
    /// Path to write the full JSON report
    #[arg(long)]
    json_out: Option<PathBuf>,
    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Capture image to compare against the baseline
    capture: PathBuf,
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Record the cycle without sending a notification
    #[arg(long, action = ArgAction::SetTrue)]
    no_notify: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run a single cycle and exit
    #[arg(long, action = ArgAction::SetTrue)]
    once: bool,
    /// Stop after this many cycles (0 = run forever)
    #[arg(long, default_value_t = 0)]
    max_cycles: u64,
    /// Ignore the monitoring window
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    init_logger_exe();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Diff(args) => command_diff(args),
        Commands::Check(args) => command_check(args),
        Commands::Watch(args) => command_watch(args),
        Commands::Config(args) => command_config(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "diff",
            "description": "Compare two screenshots tile by tile and write a highlighted overlay."
        }),
        json!({
            "name": "check",
            "description": "Run one baseline cycle for an existing capture file."
        }),
        json!({
            "name": "watch",
            "description": "Capture on an interval inside the monitoring window and notify on change."
        }),
        json!({
            "name": "config",
            "description": "Print the effective configuration after file and environment overrides."
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_diff(args: DiffArgs) -> Result<()> {
    let config = DiffConfig::new(
        args.tuning.diff_threshold_pixel,
        args.tuning.tile_size,
        args.tuning.tile_pixel_threshold,
        args.tuning.yellow_alpha,
    )?;

    let previous = codec::decode_file(&args.previous)
        .with_context(|| format!("failed to load previous image: {}", args.previous.display()))?;
    let current = codec::decode_file(&args.current)
        .with_context(|| format!("failed to load current image: {}", args.current.display()))?;

    let result = tiles::diff(&previous, &current, &config)?;
    let summary = decide(&result);

    let mut overlay_path = None;
    if let Some(out) = &args.overlay_out {
        let image = overlay::render(&current, &result, &config);
        let png = codec::encode(&image)?;
        ensure_parent_dir(out)?;
        std::fs::write(out, png)
            .with_context(|| format!("failed to write overlay: {}", out.display()))?;
        overlay_path = Some(abs_path(out).display().to_string());
    }

    let changed: Vec<_> = result.changed_tiles().collect();
    let payload = json!({
        "previous": abs_path(&args.previous).display().to_string(),
        "current": abs_path(&args.current).display().to_string(),
        "size": {"width": result.width, "height": result.height},
        "config": config,
        "grid": {"cols": result.grid.cols, "rows": result.grid.rows},
        "summary": summary,
        "changed_tiles": changed,
        "overlay": overlay_path,
    });

    if let Some(out) = &args.json_out {
        write_json_pretty(out, &payload)?;
    }

    println!("{}", serde_json::to_string(&payload)?);
    Ok(())
}

fn command_check(args: CheckArgs) -> Result<()> {
    if !args.capture.exists() {
        bail!("capture not found: {}", args.capture.display());
    }

    let config = load_config(args.config.as_deref())?;
    let diff_config = config.validate()?;
    let notifier = if args.no_notify {
        None
    } else {
        optional_notifier(&config)?
    };

    let storage = open_storage(&config)?;
    let mut watcher = Watcher::new(
        Monitor::new(diff_config, storage),
        FileCapture::new(&args.capture),
        notifier,
        MonitoringWindow::from_settings(&config.window)?,
        Duration::from_secs(config.interval_secs),
        config.notify.label.clone(),
    )
    .force(true);

    match watcher.tick(chrono::Utc::now())? {
        Tick::Completed(outcome) => println!("{}", serde_json::to_string(&outcome.to_json())?),
        Tick::OutsideWindow => println!("{}", serde_json::to_string(&json!({"outcome": "skipped"}))?),
    }
    Ok(())
}

fn command_watch(args: WatchArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let diff_config = config.validate()?;

    let Some(command) = config.capture.command.clone() else {
        bail!("capture.command is not set (config file or TILE_WATCH_CAPTURE_COMMAND)");
    };
    let capture = CommandCapture::new(command, Duration::from_secs(config.capture.timeout_secs));
    let notifier = optional_notifier(&config)?;
    if notifier.is_none() {
        log::warn!("notify.url is not set; changes will only be recorded on disk");
    }

    let storage = open_storage(&config)?;
    let mut watcher = Watcher::new(
        Monitor::new(diff_config, storage),
        capture,
        notifier,
        MonitoringWindow::from_settings(&config.window)?,
        Duration::from_secs(config.interval_secs),
        config.notify.label.clone(),
    )
    .force(args.force || config.force);

    let max_cycles = if args.once { 1 } else { args.max_cycles };
    log::info!(
        "watching every {}s into {} (max cycles: {})",
        config.interval_secs,
        abs_path(&config.out_dir).display(),
        max_cycles
    );
    let stats = watcher.run(max_cycles)?;

    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn command_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WatchConfig> {
    WatchConfig::load(path).with_context(|| match path {
        Some(path) => format!("failed to load config: {}", path.display()),
        None => "failed to load default config".to_string(),
    })
}

fn open_storage(config: &WatchConfig) -> Result<FsStorage> {
    FsStorage::open(&config.out_dir)
        .with_context(|| format!("output dir not writable: {}", config.out_dir.display()))
}

fn optional_notifier(config: &WatchConfig) -> Result<Option<WebhookNotifier>> {
    if config.notify.url.is_none() {
        return Ok(None);
    }
    Ok(Some(WebhookNotifier::from_settings(&config.notify)?))
}
