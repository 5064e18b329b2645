use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use turnstile_core::{CredentialStore, Enroller, ImageSource, OnnxExtractor, SqliteFaceIndex};
use turnstile_hw::{Camera, CaptureService, RetryPolicy};

#[derive(Parser)]
#[command(name = "turnstile", about = "Turnstile access-control administration")]
struct Cli {
    #[command(flatten)]
    paths: StorePathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StorePathArgs {
    /// Credential store (SQLite)
    #[arg(long, global = true, env = "TURNSTILE_DB_PATH")]
    db: Option<PathBuf>,
    /// Face index (SQLite)
    #[arg(long, global = true, env = "TURNSTILE_FACE_INDEX_PATH")]
    face_index: Option<PathBuf>,
    /// FaceNet ONNX model
    #[arg(long, global = true, env = "TURNSTILE_MODEL_PATH")]
    model: Option<PathBuf>,
}

impl StorePathArgs {
    fn db(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| turnstile_core::default_data_dir().join("turnstile.db"))
    }

    fn face_index(&self) -> PathBuf {
        self.face_index
            .clone()
            .unwrap_or_else(|| turnstile_core::default_data_dir().join("face_index.db"))
    }

    fn model(&self) -> PathBuf {
        self.model
            .clone()
            .unwrap_or_else(turnstile_core::default_model_path)
    }

    fn open_stores(&self) -> Result<(CredentialStore, SqliteFaceIndex)> {
        let db = self.db();
        let store = CredentialStore::open(&db)
            .with_context(|| format!("failed to open credential store {}", db.display()))?;
        let face_index = self.face_index();
        let index = SqliteFaceIndex::open(&face_index)
            .with_context(|| format!("failed to open face index {}", face_index.display()))?;
        Ok((store, index))
    }

    fn load_model(&self) -> Result<OnnxExtractor> {
        Ok(OnnxExtractor::load(&self.model())?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a card holder from one or more face photos
    Enroll {
        /// Card holder name
        #[arg(short, long)]
        name: String,
        /// Card UID as printed by the reader (e.g. "C3 7F F2 D9")
        #[arg(short, long)]
        card: String,
        /// Photo files
        #[arg(required_unless_present = "folder", conflicts_with = "folder")]
        images: Vec<PathBuf>,
        /// Enroll every image in this directory instead
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// List enrolled card holders
    Users {
        #[arg(long)]
        json: bool,
    },
    /// Re-derive face index entries missing for enrolled photos
    Reconcile,
    /// Show recent access decisions
    Logs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Take one photo to check the camera
    Capture {
        #[arg(long, env = "TURNSTILE_CAMERA_DEVICE", default_value = "/dev/video0")]
        device: String,
        #[arg(long, env = "TURNSTILE_CAPTURE_DIR")]
        dir: Option<PathBuf>,
        /// Frames to discard first while exposure settles
        #[arg(long, default_value_t = 4)]
        warmup: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll {
            name,
            card,
            images,
            folder,
        } => {
            let source = match folder {
                Some(dir) => ImageSource::Folder(dir),
                None => ImageSource::Files(images),
            };
            let (mut store, index) = cli.paths.open_stores()?;
            let mut extractor = cli.paths.load_model()?;
            let outcome = Enroller::new(&mut store, &index, &mut extractor)
                .enroll(&name, &card, &source)
                .context("enrollment failed")?;

            let verb = if outcome.created { "Enrolled" } else { "Added photos for" };
            println!(
                "{verb} {} (id {}, card {}): {} photo(s)",
                outcome.user.name,
                outcome.user.id,
                outcome.user.card_uid,
                outcome.embedding_ids.len()
            );
            for (path, reason) in &outcome.skipped {
                println!("  skipped {}: {reason}", path.display());
            }
        }
        Commands::Users { json } => {
            let (store, _) = cli.paths.open_stores()?;
            let users = store.list_users()?;
            if json {
                let rows: Vec<_> = users
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "id": s.user.id,
                            "name": s.user.name,
                            "card_uid": s.user.card_uid,
                            "face_embedding_id": s.user.reference_embedding_id,
                            "image_count": s.image_count,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if users.is_empty() {
                println!("No users enrolled");
            } else {
                println!("{:<6} {:<24} {:<16} {}", "ID", "NAME", "CARD", "PHOTOS");
                for s in &users {
                    println!(
                        "{:<6} {:<24} {:<16} {}",
                        s.user.id, s.user.name, s.user.card_uid, s.image_count
                    );
                }
            }
        }
        Commands::Reconcile => {
            let (mut store, index) = cli.paths.open_stores()?;
            let mut extractor = cli.paths.load_model()?;
            let report = Enroller::new(&mut store, &index, &mut extractor).reconcile()?;

            println!(
                "checked {} photo(s), repaired {}",
                report.checked,
                report.repaired.len()
            );
            for (id, reason) in &report.failed {
                println!("  failed {id}: {reason}");
            }
            for user in &report.unrepairable {
                println!(
                    "  unrepairable: {} (card {}) references a missing embedding",
                    user.name, user.card_uid
                );
            }
            if !report.is_consistent() {
                bail!("stores are still inconsistent");
            }
        }
        Commands::Logs { limit, json } => {
            let (store, _) = cli.paths.open_stores()?;
            let entries = store.recent_access_logs(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No access recorded");
            } else {
                for e in &entries {
                    let user = e
                        .user_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{}  user {:<6} {}", e.timestamp, user, e.action);
                }
            }
        }
        Commands::Capture {
            device,
            dir,
            warmup,
        } => {
            let dir = dir.unwrap_or_else(|| turnstile_core::default_data_dir().join("captures"));
            let camera = Camera::open(&device, Duration::from_secs(2))?;
            println!(
                "{device}: {}x{} {:?}",
                camera.width, camera.height, camera.fourcc
            );
            camera.discard_warmup(warmup);
            let mut service = CaptureService::new(camera, dir, RetryPolicy::default())?;
            let path = service.capture()?;
            println!("Saved {}", path.display());
        }
    }

    Ok(())
}
