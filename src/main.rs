use clap::{Parser, ValueEnum};
use slate::{
    Classifier, DetectionStrategy, DispatchMode, EngineError, Frame, FrameLoop, LabelMap, Overlay,
    PipelineConfig, TickReport,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::Level;

#[derive(Parser)]
#[command(name = "slate")]
#[command(
    about = "Slate - find, rectify and classify a flat object in video frames",
    long_about = None
)]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Classifier model (ONNX); needs the `onnx` feature
    #[arg(long)]
    model: Option<PathBuf>,

    /// Class mapping, a JSON array or an object keyed by class index
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Detection strategy, overrides the configuration
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Minimum milliseconds between processed frames, overrides the configuration
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Frame images, processed in order as consecutive ticks
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Box,
    Quad,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum OutputFormat {
    /// One JSON report per line
    Json,
    /// One line per detected ROI
    Text,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        cfg.strategy = match strategy {
            StrategyArg::Box => DetectionStrategy::EdgeBox,
            StrategyArg::Quad => DetectionStrategy::Quad,
        };
    }
    if let Some(ms) = cli.interval_ms {
        cfg.frame_loop.min_interval_ms = ms;
    }
    // Stills have no display to keep responsive; classify each frame in place.
    cfg.frame_loop.dispatch = DispatchMode::Inline;
    cfg.validate()?;

    let labels = match &cli.labels {
        Some(path) => LabelMap::from_json_file(path)?,
        None => LabelMap::new(),
    };

    let mut frame_loop = FrameLoop::new(cfg.clone(), labels)?;
    if let Some(model) = &cli.model {
        frame_loop = frame_loop.with_classifier(load_classifier(model, &cfg)?)?;
    }

    let interval = Duration::from_millis(cfg.frame_loop.min_interval_ms);
    let start = Instant::now();
    for (i, path) in cli.images.iter().enumerate() {
        let frame = match Frame::open(path) {
            Ok(f) => Some(f),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot read frame");
                None
            }
        };
        let now = start + interval * i as u32;
        let report = frame_loop.tick(now, frame.as_ref());

        match cli.format {
            OutputFormat::Json => {
                let json_output = serde_json::json!({
                    "image": path.display().to_string(),
                    "report": &report,
                });
                println!("{}", serde_json::to_string(&json_output)?);
            }
            OutputFormat::Text => print_text(path, &report),
        }
    }

    frame_loop.stop();
    Ok(())
}

fn print_text(path: &Path, report: &TickReport) {
    if report.slots.is_empty() {
        println!("{}\t{:?}\t-", path.display(), report.status);
        return;
    }
    for slot in &report.slots {
        let geometry = match &slot.overlay {
            Overlay::Box(b) => format!("box {},{},{},{}", b.x, b.y, b.w, b.h),
            Overlay::Quad(q) => {
                let pts: Vec<String> = q
                    .corners
                    .iter()
                    .map(|p| format!("{:.1},{:.1}", p.x, p.y))
                    .collect();
                format!("quad {}", pts.join(" "))
            }
        };
        let label = match (&slot.label, slot.confidence_pct) {
            (Some(label), Some(pct)) => format!("{label} ({pct:.1}%)"),
            (None, Some(pct)) => format!("... ({pct:.1}%)"),
            _ => "-".to_string(),
        };
        println!("{}\t{}\t{}\t{}", path.display(), slot.slot, geometry, label);
    }
}

#[cfg(feature = "onnx")]
fn load_classifier(
    model: &Path,
    cfg: &PipelineConfig,
) -> Result<Box<dyn Classifier>, EngineError> {
    let classifier = slate::OrtClassifier::from_path(
        model,
        &cfg.engine,
        cfg.normalize.layout,
        cfg.normalize.input_size,
    )?;
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "onnx"))]
fn load_classifier(
    model: &Path,
    _cfg: &PipelineConfig,
) -> Result<Box<dyn Classifier>, EngineError> {
    Err(EngineError::Config(format!(
        "cannot load {}: built without the `onnx` feature",
        model.display()
    )))
}
