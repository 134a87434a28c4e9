use crate::config::{
    default_data_dir, default_resource_root, ClientConfig, ReadinessPolicy, SupervisorConfig,
};
use crate::model::{
    AppEvent, Channels, ModelFamily, NormalizationParams, SegmentationParams,
};
use crate::orchestrator::{run_session, BackendChoice, ScaleChoice, SessionPlan};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "cellpose-cli",
    version,
    about = "Cellpose cell segmentation client with a self-managed local backend"
)]
pub struct Cli {
    /// Use an already running backend instead of starting the bundled one
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Packaged backend: a directory or a .zip archive [default: backend/ or backend.zip next to the executable]
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Where the bundle is extracted [default: ~/.cellpose/backend]
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Image to segment
    #[arg(long, short = 'i')]
    pub image: Option<PathBuf>,

    /// Print the models the backend offers
    #[arg(long)]
    pub list_models: bool,

    /// Model family ("Cellpose SAM" / "CellposeSAM" or "Cellpose 3.1" / "Cellpose3.1")
    #[arg(long, default_value = "CellposeSAM", value_parser = parse_family)]
    pub model_type: ModelFamily,

    /// Model name within the family [default: first model the backend lists]
    #[arg(long)]
    pub model_name: Option<String>,

    /// Expected cell diameter in pixels
    #[arg(long, default_value_t = 30.0)]
    pub diameter: f64,

    /// Channel to segment
    #[arg(long, default_value_t = 0)]
    pub channel: u32,

    /// Optional helper channel (e.g. nuclei)
    #[arg(long)]
    pub channel2: Option<u32>,

    /// Ask the backend to run on the GPU
    #[arg(long)]
    pub use_gpu: bool,

    #[arg(long, default_value_t = 64)]
    pub batch_size: u32,

    /// Run dynamics at the original image resolution
    #[arg(long)]
    pub resample: bool,

    /// Use --normalize true or --normalize false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub normalize: bool,

    #[arg(long, default_value_t = 1.0)]
    pub percentile_low: f64,

    #[arg(long, default_value_t = 99.0)]
    pub percentile_high: f64,

    /// Tile size for tile normalization (0 disables)
    #[arg(long, default_value_t = 0)]
    pub tile_norm: u32,

    #[arg(long, default_value_t = 0.4)]
    pub flow_threshold: f64,

    #[arg(long, default_value_t = 0.0)]
    pub cellprob_threshold: f64,

    /// Downscale the upload by this factor in (0, 1]; outlines are mapped back
    #[arg(long, conflicts_with = "auto_scale")]
    pub scale: Option<f64>,

    /// Downscale images wider than 500 px to roughly 500 px before upload
    #[arg(long)]
    pub auto_scale: bool,

    /// How long to wait for the bundled backend to answer
    #[arg(long, default_value = "30s")]
    pub startup_timeout: humantime::Duration,

    /// Timeout for a single segmentation request
    #[arg(long, default_value = "10m")]
    pub request_timeout: humantime::Duration,

    /// Print JSON result
    #[arg(long)]
    pub json: bool,

    /// Print text summary (default)
    #[arg(long)]
    pub text: bool,

    /// Suppress progress output; only the JSON result is printed (requires --json)
    #[arg(long)]
    pub silent: bool,

    /// Write the JSON result to a file as well
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_family(s: &str) -> Result<ModelFamily, String> {
    ModelFamily::from_name(s).ok_or_else(|| {
        let known: Vec<_> = ModelFamily::ALL.iter().map(|f| f.backend_key()).collect();
        format!("unknown model family {s:?}; expected one of {}", known.join(", "))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Text,
    Json,
    Silent,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }
    if args.image.is_none() && !args.list_models {
        return Err(anyhow::anyhow!(
            "nothing to do: pass --image <path> to segment or --list-models"
        ));
    }
    if let Some(scale) = args.scale {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(anyhow::anyhow!("--scale must be in (0, 1], got {scale}"));
        }
    }

    let mode = if args.silent {
        OutputMode::Silent
    } else if args.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let plan = build_session_plan(&args);
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();

    // Single consumer: every progress message is rendered here, in arrival order.
    let progress_tx = out_tx.clone();
    let consumer = tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            let Some(msg) = render_event(&ev) else {
                continue;
            };
            match mode {
                OutputMode::Text => {
                    let _ = progress_tx.send(OutputLine::Stderr(msg));
                }
                OutputMode::Json => info!("{msg}"),
                OutputMode::Silent => {}
            }
        }
    });

    let outcome = run_session(plan, evt_tx).await;
    let _ = consumer.await;
    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => {
            drop(out_tx);
            let _ = out_handle.await;
            return Err(e);
        }
    };

    if let Some(result) = outcome.result.as_ref() {
        if let Some(path) = args.export_json.as_deref() {
            export_json(path, result)?;
            if mode == OutputMode::Text {
                let _ = out_tx.send(OutputLine::Stderr(format!("Exported JSON: {}", path.display())));
            }
        }
    }

    match mode {
        OutputMode::Text => {
            if args.list_models {
                if let Some(catalog) = outcome.catalog.as_ref() {
                    for line in crate::text_summary::build_catalog_summary(catalog).lines {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                }
            }
            if let Some(result) = outcome.result.as_ref() {
                for line in crate::text_summary::build_text_summary(result).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
        }
        OutputMode::Json | OutputMode::Silent => {
            let out = match (outcome.result.as_ref(), outcome.catalog.as_ref()) {
                (Some(result), _) => serde_json::to_string_pretty(result)?,
                (None, Some(catalog)) => serde_json::to_string_pretty(catalog)?,
                (None, None) => String::new(),
            };
            if !out.is_empty() {
                let _ = out_tx.send(OutputLine::Stdout(out));
            }
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

/// Human-readable progress line for an event, or `None` for events with nothing to say.
fn render_event(ev: &AppEvent) -> Option<String> {
    match ev {
        AppEvent::BackendStarting => Some("Starting local backend…".into()),
        AppEvent::BackendReady { base_url } => Some(format!("Backend ready at {base_url}")),
        AppEvent::BackendFailed { message } => Some(format!("Backend failed to start: {message}")),
        AppEvent::BackendStopped => Some("Backend stopped".into()),
        AppEvent::ModelsUpdated { catalog } => {
            let n: usize = catalog.0.values().map(Vec::len).sum();
            Some(format!("Backend lists {n} models"))
        }
        AppEvent::SegmentationStarted => Some("Segmenting…".into()),
        AppEvent::SegmentationCompleted { result } => {
            Some(format!("Segmentation finished: {} cells", result.cells.len()))
        }
        AppEvent::SegmentationFailed { message } => Some(format!("Segmentation failed: {message}")),
        AppEvent::Info(info) => Some(info.to_message()),
    }
}

fn export_json(path: &std::path::Path, result: &crate::model::SegmentationResult) -> Result<()> {
    let out = serde_json::to_string_pretty(result)?;
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// Build the session plan from CLI arguments.
fn build_session_plan(args: &Cli) -> SessionPlan {
    let backend = match args.backend_url.as_deref() {
        Some(url) => BackendChoice::External(url.trim().to_string()),
        None => BackendChoice::Bundled(build_supervisor_config(args)),
    };
    let scale = match (args.scale, args.auto_scale) {
        (_, true) => ScaleChoice::Auto,
        (Some(s), false) => ScaleChoice::Fixed(s),
        (None, false) => ScaleChoice::Original,
    };
    SessionPlan {
        backend,
        client: build_client_config(args),
        params: build_segmentation_params(args),
        image: args.image.clone(),
        scale,
        list_models: args.list_models,
    }
}

pub fn build_supervisor_config(args: &Cli) -> SupervisorConfig {
    let mut cfg = SupervisorConfig::new(
        args.bundle.clone().unwrap_or_else(default_resource_root),
        args.data_dir.clone().unwrap_or_else(default_data_dir),
    );
    cfg.readiness = ReadinessPolicy {
        deadline: Duration::from(args.startup_timeout),
        ..ReadinessPolicy::default()
    };
    cfg
}

pub fn build_client_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from(args.request_timeout),
        ..ClientConfig::default()
    }
}

pub fn build_segmentation_params(args: &Cli) -> SegmentationParams {
    SegmentationParams {
        model_family: args.model_type,
        model_name: args
            .model_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        diameter: args.diameter,
        channels: Channels {
            primary: args.channel,
            secondary: args.channel2,
        },
        use_gpu: args.use_gpu,
        batch_size: args.batch_size,
        resample: args.resample,
        normalization: args.normalize.then_some(NormalizationParams {
            percentile_low: args.percentile_low,
            percentile_high: args.percentile_high,
            tile_norm: args.tile_norm,
        }),
        flow_threshold: args.flow_threshold,
        cellprob_threshold: args.cellprob_threshold,
    }
}
