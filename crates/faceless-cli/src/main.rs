mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use faceless_core::frame;
use faceless_core::models::{
    DetectorSelection, ModelRegistry, RestorerModel, SwapperKind, SwapperModel, GENDER_AGE_FILE,
    LANDMARKER_68_FILE, LANDMARKER_68_FROM_5_FILE, OCCLUDER_FILE, PARSER_FILE,
};
use faceless_core::{FaceAnalyser, FaceMasker, FaceRestorer, FaceSelectionMode, FaceSwapper};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceless", about = "Face analysis, identity swap and restoration")]
struct Cli {
    /// TOML configuration file (default: $FACELESS_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Detector backend: retinaface, scrfd, yoloface, yunet or many
    #[arg(long, global = true)]
    detector: Option<DetectorSelection>,

    /// Identity transfer model (e.g. inswapper_128, simswap_256)
    #[arg(long, global = true)]
    swapper_model: Option<SwapperModel>,

    /// Restoration model (e.g. gfpgan_1.4, codeformer)
    #[arg(long, global = true)]
    restorer_model: Option<RestorerModel>,

    /// Worker threads for frame-directory jobs
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Target face selection: one, many or reference
    #[arg(long, global = true)]
    selection: Option<FaceSelectionMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the faces detected in an image as JSON
    Analyse { image: PathBuf },
    /// Swap the source identity onto target images
    Swap {
        /// Source image(s); their faces are averaged into one identity
        #[arg(long, required = true, num_args = 1..)]
        source: Vec<PathBuf>,
        /// Directory receiving 0001.png, 0002.png, ...
        #[arg(long)]
        output: PathBuf,
        #[arg(required = true)]
        targets: Vec<PathBuf>,
    },
    /// Swap the source identity onto every frame of a directory, in place
    SwapVideo {
        #[arg(long)]
        source: PathBuf,
        frames_dir: PathBuf,
    },
    /// Restore the faces of images
    Restore {
        #[arg(long)]
        output: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Restore the faces of every frame of a directory, in place
    RestoreVideo { frames_dir: PathBuf },
    /// List the model files the current configuration resolves to
    Models,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(detector) = cli.detector {
        config.analyser.detector = detector;
    }
    if let Some(model) = cli.swapper_model {
        config.swapper.model = model;
    }
    if let Some(model) = cli.restorer_model {
        config.restorer.model = model;
    }
    if let Some(workers) = cli.workers {
        config.scheduler.workers = workers;
    }
    if let Some(selection) = cli.selection {
        config.swapper.selection = selection;
    }

    let registry = config.registry();
    tracing::debug!(model_dir = %registry.model_dir().display(), "resolved model directory");

    match cli.command {
        Commands::Analyse { image } => {
            let analyser = FaceAnalyser::new(config.analyser, &registry);
            let frame = frame::read_frame(&image)?;
            let faces = analyser
                .get_many_faces(&frame)
                .with_context(|| format!("analysing {}", image.display()))?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Swap {
            source,
            output,
            targets,
        } => {
            let swapper = build_swapper(config, &registry);
            let written = swapper
                .swap_images(&source, &targets, &output)
                .context("swapping images")?;
            for path in written {
                println!("{}", path.display());
            }
        }
        Commands::SwapVideo { source, frames_dir } => {
            let swapper = build_swapper(config, &registry);
            let summary = swapper
                .swap_video(&source, &frames_dir)
                .with_context(|| format!("swapping frames in {}", frames_dir.display()))?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Restore { output, images } => {
            let restorer = build_restorer(config, &registry);
            let written = restorer
                .restore_images(&images, &output)
                .context("restoring images")?;
            for path in written {
                println!("{}", path.display());
            }
        }
        Commands::RestoreVideo { frames_dir } => {
            let restorer = build_restorer(config, &registry);
            let summary = restorer
                .restore_video(&frames_dir)
                .with_context(|| format!("restoring frames in {}", frames_dir.display()))?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Models => {
            for path in model_paths(&config, &registry) {
                let state = if path.exists() { "ok" } else { "missing" };
                println!("{state:>8}  {}", path.display());
            }
        }
    }

    Ok(())
}

fn build_swapper(mut config: Config, registry: &ModelRegistry) -> FaceSwapper {
    // The transfer model dictates which recognizer produces its embeddings.
    config.analyser.recognizer = config.swapper.model.descriptor().recognizer;
    let analyser = Arc::new(FaceAnalyser::new(config.analyser, registry));
    let masker = Arc::new(FaceMasker::new(registry));
    FaceSwapper::new(config.swapper, analyser, masker, registry).with_scheduler(config.scheduler)
}

fn build_restorer(config: Config, registry: &ModelRegistry) -> FaceRestorer {
    let analyser = Arc::new(FaceAnalyser::new(config.analyser, registry));
    let masker = Arc::new(FaceMasker::new(registry));
    FaceRestorer::new(config.restorer, analyser, masker, registry).with_scheduler(config.scheduler)
}

fn model_paths(config: &Config, registry: &ModelRegistry) -> Vec<PathBuf> {
    let swapper = config.swapper.model.descriptor();
    let mut files: Vec<&str> = config
        .analyser
        .detector
        .backends()
        .iter()
        .map(|model| model.file())
        .collect();
    files.extend([
        config.analyser.recognizer.file(),
        swapper.recognizer.file(),
        LANDMARKER_68_FILE,
        LANDMARKER_68_FROM_5_FILE,
        GENDER_AGE_FILE,
        OCCLUDER_FILE,
        PARSER_FILE,
        swapper.file,
        config.restorer.model.descriptor().file,
    ]);
    files.dedup();

    let mut paths: Vec<PathBuf> = files.into_iter().map(|file| registry.path(file)).collect();
    if swapper.kind == SwapperKind::Inswapper {
        paths.push(registry.embedding_map_path(swapper.file));
    }
    paths
}
