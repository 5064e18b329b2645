use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use turnstile_core::journal::{AuditLog, UnregisteredCards};
use turnstile_core::{DecisionEngine, Enroller, OnnxExtractor};
use turnstile_hw::{Camera, CaptureService, CardReader};

mod config;
mod pipeline;

use config::Config;
use pipeline::{ConsoleSink, ExtractorWorker, PipelineSettings, Processor, StorePaths};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "turnstiled starting");

    let config = Config::from_env();
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");
    let stores = StorePaths {
        db_path: config.db_path.clone(),
        face_index_path: config.face_index_path.clone(),
    };

    // Fail fast: every device and the model must be present before serving.
    let (mut store, index) = stores.open().context("failed to open stores")?;
    tracing::info!(
        db = %config.db_path.display(),
        face_index = %config.face_index_path.display(),
        "stores opened"
    );

    let mut extractor = OnnxExtractor::load(&config.model_path)?;
    tracing::info!(path = %config.model_path.display(), "embedding model loaded");

    if config.reconcile_on_start {
        let report = Enroller::new(&mut store, &index, &mut extractor)
            .reconcile()
            .context("face index reconciliation failed")?;
        if report.is_consistent() {
            tracing::info!(
                checked = report.checked,
                repaired = report.repaired.len(),
                "stores consistent"
            );
        } else {
            tracing::warn!(
                checked = report.checked,
                repaired = report.repaired.len(),
                failed = report.failed.len(),
                unrepairable = report.unrepairable.len(),
                "stores still inconsistent after reconciliation"
            );
        }
    }
    drop((store, index));

    let camera = Camera::open(&config.camera_device, config.capture_timeout())?;
    camera.discard_warmup(config.warmup_frames);
    let photos = CaptureService::new(camera, &config.capture_dir, config.retry_policy())?;

    let reader = CardReader::open(&config.serial_port, config.baud_rate)?;

    let worker = ExtractorWorker::spawn(extractor, config.extract_timeout())?;
    let processor = Processor::new(
        DecisionEngine::new(
            config.decision_policy(),
            UnregisteredCards::new(&config.unregistered_path),
        ),
        stores,
        AuditLog::new(&config.audit_log_path),
        worker,
        ConsoleSink,
    );

    let settings = PipelineSettings {
        queue_capacity: config.queue_capacity,
        poll_interval: config.poll_interval(),
        trust_reader_status: config.trust_reader_status,
    };
    let handle = pipeline::spawn(settings, reader, photos, processor)?;

    tracing::info!(
        port = %config.serial_port,
        camera = %config.camera_device,
        require_face = config.require_face,
        "turnstiled ready; present a card"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("turnstiled shutting down");

    tokio::task::spawn_blocking(move || handle.shutdown()).await?;

    Ok(())
}
