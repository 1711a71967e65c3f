use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::enroll::{self, EnrollError};
use facewatch_core::{FaceAnalyzer, FaceStore, OnnxAnalyzer};
use facewatch_hw::{Camera, DefaultOpener, SourceOpener, SourceSpec};
use image::RgbImage;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facewatch", version, about = "facewatch face database and camera tool")]
struct Cli {
    /// Face database snapshot
    #[arg(long, global = true, env = "FACEWATCH_DB_PATH", default_value = facewatch_core::database::DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from photo files, replacing any earlier registration
    Register {
        #[arg(short, long)]
        name: String,
        /// Directory containing the ONNX models
        #[arg(long, env = "FACEWATCH_MODEL_DIR")]
        model_dir: Option<PathBuf>,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// List registered people
    List,
    /// Show database totals
    Stats,
    /// List V4L2 capture devices
    Devices,
    /// Grab one frame from a video source and save it as JPEG
    Test {
        #[arg(short, long, env = "FACEWATCH_VIDEO_SOURCE", default_value = "0")]
        source: String,
        #[arg(short, long, default_value = "facewatch-test.jpg")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = FaceStore::new(&cli.db);

    match cli.command {
        Commands::Register {
            name,
            model_dir,
            photos,
        } => {
            let model_dir = model_dir.unwrap_or_else(facewatch_core::default_model_dir);
            let mut analyzer = OnnxAnalyzer::from_model_dir(&model_dir)
                .with_context(|| format!("failed to load models from {}", model_dir.display()))?;
            let stored = register(&mut analyzer, &store, &name, &photos)?;
            println!(
                "Registered {} with {stored} face vector(s) from {} photo(s)",
                name.trim(),
                photos.len()
            );
            println!("A running facewatchd picks this up on the next reload.");
        }
        Commands::List => {
            let db = store.load()?;
            if db.is_empty() {
                println!("No people registered");
            }
            for (id, (name, vectors)) in db.people().enumerate() {
                println!("{id:>3}  {name}  ({} vector(s))", vectors.len());
            }
        }
        Commands::Stats => {
            let db = store.load()?;
            println!("database:      {}", store.path().display());
            println!("people:        {}", db.len());
            println!("face vectors:  {}", db.total_vectors());
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
            }
        }
        Commands::Test { source, output } => {
            let opener = DefaultOpener::new(SourceSpec::parse(&source));
            println!("Opening {}...", opener.describe());
            let mut video = opener.open()?;
            let frame = video.read_frame()?;
            let jpeg = frame.encode_jpeg(facewatch_hw::DEFAULT_JPEG_QUALITY)?;
            std::fs::write(&output, jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Captured {}x{} frame #{} -> {}",
                frame.width,
                frame.height,
                frame.sequence,
                output.display()
            );
        }
    }

    Ok(())
}

/// Register `name` from image files. Unreadable files and photos without a
/// face are skipped; at least one must yield a face.
fn register(
    analyzer: &mut dyn FaceAnalyzer,
    store: &FaceStore,
    name: &str,
    photos: &[PathBuf],
) -> Result<usize> {
    let name = name.trim();
    if name.is_empty() {
        bail!("name must not be empty");
    }

    let images: Vec<RgbImage> = photos.iter().filter_map(|path| read_photo(path)).collect();
    let vectors = match enroll::collect_vectors(analyzer, &images) {
        Ok(vectors) => vectors,
        Err(EnrollError::NoFaceDetected) => bail!("no faces could be detected in any photo"),
        Err(e) => return Err(e.into()),
    };
    let stored = vectors.len();

    let mut db = store.load()?;
    db.register(name, vectors)?;
    store.save(&db)?;
    tracing::info!(name, vectors = stored, db = %store.path().display(), "person registered");
    Ok(stored)
}

fn read_photo(path: &Path) -> Option<RgbImage> {
    match image::open(path) {
        Ok(image) => Some(image.to_rgb8()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable photo");
            None
        }
    }
}
