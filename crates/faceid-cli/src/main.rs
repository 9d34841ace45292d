use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::enrollment::Response;
use faceid_core::{Config, EnrollmentService, ExtractionMode};
use std::path::PathBuf;

const BUS_NAME: &str = "io.faceid.FaceId1";
const OBJECT_PATH: &str = "/io/faceid/FaceId1";

#[derive(Parser)]
#[command(name = "faceid", about = "faceid face enrollment and verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a user from a video: extract faces, train and store a model
    Enroll {
        user: String,
        video: PathBuf,
    },
    /// Verify a probe image against a user's model
    Verify {
        user: String,
        image: PathBuf,
    },
    /// Extract face crops from a video or image without training
    Extract {
        source: PathBuf,
        output: PathBuf,
        /// Treat the source as a single still image
        #[arg(long)]
        image: bool,
        /// Frames per second of video time to run detection on
        #[arg(long)]
        sampling_rate: Option<f64>,
        /// Stop after this many faces
        #[arg(long)]
        max_faces: Option<usize>,
    },
    /// Retrain a user's model from existing crops, or train on a corpus
    Train {
        /// User whose `faces/{user}` crops to train on
        #[arg(required_unless_present = "corpus", conflicts_with = "corpus")]
        user: Option<String>,
        /// Directory with one subdirectory of crops per identity
        #[arg(long, requires = "name")]
        corpus: Option<PathBuf>,
        /// Name under which the corpus model is stored
        #[arg(long)]
        name: Option<String>,
    },
    /// List stored models
    List,
    /// Remove a user's model
    Remove {
        user: String,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Query the running daemon's status over D-Bus
    Status {
        /// Use the system bus instead of the session bus
        #[arg(long)]
        system: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    tracing::debug!(
        data_dir = %config.storage.data_dir.display(),
        cascade = %config.extraction.cascade_path.display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Enroll { user, video } => {
            let mut service = open_service(config)?;
            let response = service.upload_video(Some(&user), Some(&video));
            print_response(&response)?;
        }
        Commands::Verify { user, image } => {
            let mut service = open_service(config)?;
            let response = service.upload_image(Some(&user), Some(&image));
            print_response(&response)?;
        }
        Commands::Extract {
            source,
            output,
            image,
            sampling_rate,
            max_faces,
        } => {
            let mode = if image {
                ExtractionMode::Image
            } else {
                ExtractionMode::Video {
                    sampling_rate: sampling_rate.unwrap_or(config.extraction.sampling_rate),
                    max_faces: max_faces.unwrap_or(config.extraction.max_faces),
                }
            };
            let mut service = open_service(config)?;
            let count = service.extract(&source, &output, mode)?;
            if image && count == 0 {
                println!("No face detected");
            } else {
                println!("Extracted {count} face(s) to {}", output.display());
            }
        }
        Commands::Train { user, corpus, name } => {
            let mut service = open_service(config)?;
            let manifest = match (corpus, name, user) {
                (Some(root), Some(name), _) => {
                    let name = service.parse_user(&name)?;
                    service.train_corpus(&root, &name)?
                }
                (None, _, Some(user)) => {
                    let user = service.parse_user(&user)?;
                    service.train_user(&user)?
                }
                _ => bail!("either a user or --corpus with --name is required"),
            };
            println!(
                "Trained model '{}' over {:?}: {} epoch(s), validation accuracy {:.3}",
                manifest.user_id,
                manifest.classes,
                manifest.report.epochs_run,
                manifest.report.val_accuracy
            );
        }
        Commands::List => {
            let store = faceid_core::ModelStore::new(config.storage.models_dir());
            let manifests = store.list()?;
            if manifests.is_empty() {
                println!("No models stored");
            }
            for m in manifests {
                println!(
                    "{}\tclasses={:?}\tcreated={}\tval_accuracy={:.3}",
                    m.user_id,
                    m.classes,
                    m.created_at.to_rfc3339(),
                    m.report.val_accuracy
                );
            }
        }
        Commands::Remove { user } => {
            let user = faceid_core::UserId::parse(&user)?;
            let store = faceid_core::ModelStore::new(config.storage.models_dir());
            if store.remove(&user)? {
                println!("Removed model for {user}");
            } else {
                println!("No model stored for {user}");
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Status { system } => {
            tracing::debug!(system, "querying faceidd status");
            let conn = if system {
                zbus::Connection::system().await?
            } else {
                zbus::Connection::session().await?
            };
            let reply = conn
                .call_method(Some(BUS_NAME), OBJECT_PATH, Some(BUS_NAME), "Status", &())
                .await
                .context("faceidd is not reachable")?;
            let status: String = reply.body().deserialize()?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

fn open_service(config: Config) -> Result<EnrollmentService<faceid_core::CnnClassifier>> {
    tracing::info!(data_dir = %config.storage.data_dir.display(), "running pipeline in-process");
    EnrollmentService::with_opencv(config).context("failed to initialise enrollment pipeline")
}

/// Print a boundary response; a non-200 status becomes a non-zero exit.
fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    if !response.is_success() {
        bail!("request failed with status {}", response.status);
    }
    Ok(())
}
