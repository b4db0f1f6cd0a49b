use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{
    AppearanceStore, EngineConfig, EnrollError, FaceGate, ImageInput, ImageOutcome,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face enrollment and verification CLI")]
struct Cli {
    /// TOML config file (default: $FACEGATE_CONFIG, else built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from 3 or more face photos
    Enroll {
        /// Identity key assigned by the caller (e.g. employee ID)
        identity: String,
        /// Candidate photos
        #[arg(required = true, num_args = 1..)]
        images: Vec<PathBuf>,
    },
    /// Verify a photo against an enrolled identity
    Verify {
        identity: String,
        image: PathBuf,
    },
    /// Show store statistics
    Status,
    /// Remove an identity from the label map
    Forget { identity: String },
    /// Rebuild the model from retained patches, dropping forgotten identities
    Retrain,
    /// Run the face detector on a photo
    Detect {
        image: PathBuf,
        /// Also write the normalized patch of the strongest face as a PNG
        #[arg(long)]
        save_patch: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Enroll { identity, images } => {
            let gate = FaceGate::open(&config)?;
            let photos = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            let inputs: Vec<ImageInput<'_>> =
                photos.iter().map(|b| ImageInput::Encoded(b.as_slice())).collect();

            match gate.enroll(&identity, &inputs) {
                Ok(enrollment) => {
                    print_outcomes(&images, &enrollment.outcomes);
                    println!(
                        "Enrolled '{}' as label {} ({} images accepted)",
                        enrollment.identity, enrollment.label, enrollment.patches_added
                    );
                }
                Err(EnrollError::TooFewValid {
                    valid,
                    required,
                    outcomes,
                    ..
                }) => {
                    print_outcomes(&images, &outcomes);
                    eprintln!("Enrollment rejected: {valid} valid images, {required} required");
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Verify { identity, image } => {
            let gate = FaceGate::open(&config)?;
            let bytes = read_image(&image)?;
            let verification = gate.verify(&identity, &ImageInput::Encoded(&bytes))?;
            println!("{}", serde_json::to_string_pretty(&verification)?);
            if !verification.accepted {
                if let Some(reason) = &verification.reason {
                    eprintln!("Rejected: {reason}");
                }
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status => {
            let store = open_store(&config)?;
            println!("{}", serde_json::to_string_pretty(&store.stats()?)?);
        }
        Commands::Forget { identity } => {
            let store = open_store(&config)?;
            match store.forget(&identity)? {
                Some(label) => println!("Forgot '{identity}' (label {label} retired)"),
                None => {
                    eprintln!("'{identity}' is not enrolled");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Retrain => {
            let store = open_store(&config)?;
            let summary = store.retrain()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Detect { image, save_patch } => {
            let gate = FaceGate::open(&config)?;
            let bytes = read_image(&image)?;
            let input = ImageInput::Encoded(&bytes);
            let regions = gate.locate(&input)?;
            println!("{}", serde_json::to_string_pretty(&regions)?);
            if regions.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
            if let Some(out) = save_patch {
                gate.extract(&input)?
                    .to_gray()
                    .save(&out)
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("Patch written to {}", out.display());
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Store-only commands do not need the detector cascade.
fn open_store(config: &EngineConfig) -> Result<AppearanceStore> {
    AppearanceStore::open(&config.data_dir, config.store_options())
        .with_context(|| format!("opening store at {}", config.data_dir.display()))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_outcomes(paths: &[PathBuf], outcomes: &[ImageOutcome]) {
    for (path, outcome) in paths.iter().zip(outcomes) {
        match outcome {
            ImageOutcome::Accepted => println!("  ok    {}", path.display()),
            ImageOutcome::Rejected(reason) => println!("  skip  {}: {reason}", path.display()),
        }
    }
}
