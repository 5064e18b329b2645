//! Card-event pipeline: listener thread → bounded queue → processor thread.
//!
//! The listener owns the serial line and the camera. For every card line it
//! takes a photo and enqueues an [`AccessRequest`]. The processor takes one
//! request at a time, runs the decision engine against freshly opened stores
//! and journals the verdict. Both loops check a shared [`CancellationToken`]
//! at the top of every iteration and never block longer than the poll
//! interval.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use turnstile_core::journal::{AuditLog, AuditRecord};
use turnstile_core::types::VerdictStatus;
use turnstile_core::{
    card, AccessAction, AccessRequest, CredentialLookup, CredentialStore, DecisionEngine,
    DenyReason, Embedding, EmbeddingExtractor, ExtractError, SqliteFaceIndex, Verdict,
};
use turnstile_hw::{CaptureService, FrameSource, LineSource};

/// Pause after a failed serial read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store: {0}")]
    Store(#[from] turnstile_core::StoreError),
    #[error("face index: {0}")]
    Index(#[from] turnstile_core::IndexError),
}

/// Takes a photo when a card is presented.
pub trait PhotoSource {
    /// `None` when no usable photo could be taken; the request then carries
    /// card evidence only.
    fn take_photo(&mut self) -> Option<PathBuf>;
}

impl<S: FrameSource> PhotoSource for CaptureService<S> {
    fn take_photo(&mut self) -> Option<PathBuf> {
        match self.capture() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "no photo for this card event");
                None
            }
        }
    }
}

/// Receives every verdict after it has been journaled.
pub trait VerdictSink {
    fn report(&self, request: &AccessRequest, verdict: &Verdict);
}

/// Reports verdicts through the log.
pub struct ConsoleSink;

impl VerdictSink for ConsoleSink {
    fn report(&self, request: &AccessRequest, verdict: &Verdict) {
        let uid = request.scan.uid.as_str();
        let action = verdict.action.to_string();
        if verdict.is_granted() {
            tracing::info!(uid, action, user = ?verdict.name, "ACCESS GRANTED: {}", verdict.message);
        } else if verdict.is_system_error() {
            tracing::error!(uid, action, "SYSTEM ERROR: {}", verdict.message);
        } else {
            tracing::warn!(uid, action, "ACCESS DENIED: {}", verdict.message);
        }
    }
}

impl VerdictSink for Sender<Verdict> {
    fn report(&self, _request: &AccessRequest, verdict: &Verdict) {
        let _ = self.send(verdict.clone());
    }
}

/// On-disk locations of the two authorization stores.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub db_path: PathBuf,
    pub face_index_path: PathBuf,
}

impl StorePaths {
    /// Open fresh handles to both stores.
    pub fn open(&self) -> Result<(CredentialStore, SqliteFaceIndex), PipelineError> {
        let store = CredentialStore::open(&self.db_path)?;
        let index = SqliteFaceIndex::open(&self.face_index_path)?;
        Ok((store, index))
    }
}

/// Messages sent to the extractor worker.
struct ExtractRequest {
    image_path: PathBuf,
    reply: Sender<Result<Embedding, ExtractError>>,
}

/// Embedding extraction on a dedicated thread, bounded by a timeout.
///
/// A request that times out keeps running on the worker; later requests
/// queue behind it. A panic inside the extractor fails that request only.
pub struct ExtractorWorker {
    tx: Sender<ExtractRequest>,
    timeout: Duration,
}

impl ExtractorWorker {
    /// Move `extractor` onto its own thread. The thread exits when the
    /// handle is dropped.
    pub fn spawn<X>(mut extractor: X, timeout: Duration) -> Result<Self, PipelineError>
    where
        X: EmbeddingExtractor + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded::<ExtractRequest>();

        std::thread::Builder::new()
            .name("turnstile-extractor".into())
            .spawn(move || {
                tracing::info!("extractor thread started");
                for req in rx {
                    let path = req.image_path.as_path();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(path)))
                        .unwrap_or_else(|payload| {
                            let reason = panic_message(payload.as_ref());
                            tracing::error!(path = %path.display(), panic = reason, "extractor panicked");
                            Err(ExtractError::InferenceFailed(format!(
                                "extractor panicked: {reason}"
                            )))
                        });
                    let _ = req.reply.send(result);
                }
                tracing::info!("extractor thread exiting");
            })
            .map_err(|source| PipelineError::Spawn {
                name: "extractor",
                source,
            })?;

        Ok(Self { tx, timeout })
    }
}

impl EmbeddingExtractor for ExtractorWorker {
    fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(ExtractRequest {
                image_path: image_path.to_path_buf(),
                reply: reply_tx,
            })
            .map_err(|_| ExtractError::WorkerGone)?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ExtractError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ExtractError::WorkerGone),
        }
    }
}

/// Consumer side: decides, journals and reports one request at a time.
pub struct Processor<X, K> {
    engine: DecisionEngine,
    stores: StorePaths,
    audit: AuditLog,
    extractor: X,
    sink: K,
}

impl<X: EmbeddingExtractor, K: VerdictSink> Processor<X, K> {
    pub fn new(
        engine: DecisionEngine,
        stores: StorePaths,
        audit: AuditLog,
        extractor: X,
        sink: K,
    ) -> Self {
        Self {
            engine,
            stores,
            audit,
            extractor,
            sink,
        }
    }

    /// Decide `request`, append it to the audit log and report it.
    ///
    /// Never fails: store faults and panics inside the decision become
    /// `access_denied: system_error`.
    pub fn process(&mut self, request: AccessRequest) -> Verdict {
        let verdict = match panic::catch_unwind(AssertUnwindSafe(|| self.decide(&request))) {
            Ok(verdict) => verdict,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(uid = %request.scan.uid, panic = reason, "decision panicked");
                let verdict = system_error(format!("System error: {reason}"));
                self.log_access_after_panic(&request, verdict.action);
                verdict
            }
        };

        let record = AuditRecord::for_outcome(&request.scan, verdict.action);
        if let Err(e) = self.audit.append(&record) {
            tracing::error!(error = %e, uid = %request.scan.uid, "failed to append audit log");
        }

        self.sink.report(&request, &verdict);
        verdict
    }

    fn decide(&mut self, request: &AccessRequest) -> Verdict {
        let (store, index) = match self.stores.open() {
            Ok(handles) => handles,
            Err(e) => {
                tracing::error!(error = %e, uid = %request.scan.uid, "cannot open stores");
                return system_error(format!("System error: {e}"));
            }
        };
        self.engine
            .decide(request, &store, &index, &mut self.extractor)
    }

    /// The engine's own access-log write is lost when it unwinds.
    fn log_access_after_panic(&self, request: &AccessRequest, action: AccessAction) {
        let logged = CredentialStore::open(&self.stores.db_path)
            .and_then(|store| store.log_access(None, action));
        if let Err(e) = logged {
            tracing::error!(error = %e, uid = %request.scan.uid, "failed to write access log");
        }
    }
}

fn system_error(message: String) -> Verdict {
    Verdict {
        status: VerdictStatus::Denied,
        action: AccessAction::Denied(DenyReason::SystemError),
        message,
        user_id: None,
        name: None,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Queue and loop tunables.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub trust_reader_status: bool,
}

/// Running pipeline threads.
pub struct PipelineHandle {
    cancel: CancellationToken,
    listener: JoinHandle<()>,
    processor: JoinHandle<()>,
}

impl PipelineHandle {
    /// Signal both loops to stop and wait for them.
    pub fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in [("listener", self.listener), ("processor", self.processor)] {
            if handle.join().is_err() {
                tracing::error!(thread = name, "pipeline thread panicked");
            }
        }
        tracing::info!("pipeline stopped");
    }
}

/// Start the listener and processor threads.
pub fn spawn<L, P, X, K>(
    settings: PipelineSettings,
    lines: L,
    photos: P,
    processor: Processor<X, K>,
) -> Result<PipelineHandle, PipelineError>
where
    L: LineSource + Send + 'static,
    P: PhotoSource + Send + 'static,
    X: EmbeddingExtractor + Send + 'static,
    K: VerdictSink + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (tx, rx) = bounded::<AccessRequest>(settings.queue_capacity.max(1));

    let listener = {
        let cancel = cancel.clone();
        std::thread::Builder::new()
            .name("turnstile-listener".into())
            .spawn(move || run_listener(lines, photos, tx, cancel, settings))
            .map_err(|source| PipelineError::Spawn {
                name: "listener",
                source,
            })?
    };

    let processor_thread = {
        let cancel_processor = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("turnstile-processor".into())
            .spawn(move || run_processor(processor, rx, cancel_processor, settings.poll_interval));
        match spawned {
            Ok(handle) => handle,
            Err(source) => {
                cancel.cancel();
                let _ = listener.join();
                return Err(PipelineError::Spawn {
                    name: "processor",
                    source,
                });
            }
        }
    };

    tracing::info!(
        queue_capacity = settings.queue_capacity,
        poll_ms = settings.poll_interval.as_millis() as u64,
        "pipeline started"
    );

    Ok(PipelineHandle {
        cancel,
        listener,
        processor: processor_thread,
    })
}

fn run_listener<L: LineSource, P: PhotoSource>(
    mut lines: L,
    mut photos: P,
    tx: Sender<AccessRequest>,
    cancel: CancellationToken,
    settings: PipelineSettings,
) {
    tracing::info!("listener thread started");

    'events: while !cancel.is_cancelled() {
        let line = match lines.next_line() {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "card reader read failed");
                std::thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        };

        let Some(mut scan) = card::parse_line(&line) else {
            tracing::debug!(line, "ignoring reader output");
            continue;
        };
        if !settings.trust_reader_status {
            scan.is_recognized = true;
        }
        tracing::info!(uid = %scan.uid, recognized = scan.is_recognized, "card detected");

        let photo = photos.take_photo();
        let mut request = AccessRequest { scan, photo };

        loop {
            if cancel.is_cancelled() {
                break 'events;
            }
            match tx.send_timeout(request, settings.poll_interval) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(pending)) => {
                    tracing::warn!(uid = %pending.scan.uid, "request queue full; waiting");
                    request = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    tracing::error!("processor gone; listener stopping");
                    break 'events;
                }
            }
        }
    }

    tracing::info!("listener thread exiting");
}

fn run_processor<X: EmbeddingExtractor, K: VerdictSink>(
    mut processor: Processor<X, K>,
    rx: Receiver<AccessRequest>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    tracing::info!("processor thread started");

    while !cancel.is_cancelled() {
        match rx.recv_timeout(poll_interval) {
            Ok(request) => {
                processor.process(request);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("processor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use turnstile_core::journal::UnregisteredCards;
    use turnstile_core::types::{FaceEmbeddingRecord, FaceOwner};
    use turnstile_core::{DecisionPolicy, FaceIndex};
    use turnstile_hw::SerialError;

    /// Replays a fixed script, then reports timeouts forever.
    struct ScriptedLines {
        script: VecDeque<Result<Option<String>, SerialError>>,
    }

    impl ScriptedLines {
        fn new(lines: &[&str]) -> Self {
            Self {
                script: lines.iter().map(|l| Ok(Some(l.to_string()))).collect(),
            }
        }
    }

    impl LineSource for ScriptedLines {
        fn next_line(&mut self) -> Result<Option<String>, SerialError> {
            match self.script.pop_front() {
                Some(next) => next,
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
            }
        }
    }

    /// Hands out the same photo path for every card.
    struct FixedPhoto(Option<PathBuf>);

    impl PhotoSource for FixedPhoto {
        fn take_photo(&mut self) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    struct StubExtractor {
        by_name: HashMap<String, Vec<f32>>,
        delay: Duration,
    }

    impl StubExtractor {
        fn new() -> Self {
            Self {
                by_name: [
                    ("anas_face.jpg".to_string(), vec![0.9, 0.1, 0.0]),
                    ("mohamed_face.jpg".to_string(), vec![0.0, 1.0, 0.0]),
                ]
                .into_iter()
                .collect(),
                delay: Duration::ZERO,
            }
        }
    }

    impl EmbeddingExtractor for StubExtractor {
        fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError> {
            std::thread::sleep(self.delay);
            let name = image_path.file_name().unwrap().to_string_lossy().to_string();
            self.by_name
                .get(&name)
                .cloned()
                .map(Embedding::new)
                .ok_or_else(|| ExtractError::InferenceFailed(format!("no face in {name}")))
        }
    }

    struct PanickingExtractor;

    impl EmbeddingExtractor for PanickingExtractor {
        fn extract(&mut self, _: &Path) -> Result<Embedding, ExtractError> {
            panic!("model blew up")
        }
    }

    struct Site {
        dir: tempfile::TempDir,
        stores: StorePaths,
    }

    impl Site {
        fn audit(&self) -> AuditLog {
            AuditLog::new(self.dir.path().join("rfid_log.json"))
        }

        fn unregistered(&self) -> PathBuf {
            self.dir.path().join("unregistered_cards.txt")
        }

        fn engine(&self, policy: DecisionPolicy) -> DecisionEngine {
            DecisionEngine::new(policy, UnregisteredCards::new(self.unregistered()))
        }

        fn audit_lines(&self) -> Vec<serde_json::Value> {
            std::fs::read_to_string(self.audit().path())
                .unwrap_or_default()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    /// Stores on disk with Anas enrolled on card C3 7F F2 D9.
    fn site() -> Site {
        let dir = tempfile::tempdir().unwrap();
        let stores = StorePaths {
            db_path: dir.path().join("turnstile.db"),
            face_index_path: dir.path().join("face_index.db"),
        };
        let (mut store, index) = stores.open().unwrap();
        let (anas, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        index
            .add(&FaceEmbeddingRecord {
                embedding_id: "anas-1".into(),
                owner: FaceOwner {
                    user_id: anas.id,
                    name: anas.name.clone(),
                    card_uid: anas.card_uid.clone(),
                },
                source_image_path: PathBuf::from("anas-1.jpg"),
                embedding: Embedding::new(vec![1.0, 0.0, 0.0]),
                enrolled_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();
        store
            .attach_embeddings(anas.id, &[("anas-1".into(), PathBuf::from("anas-1.jpg"))])
            .unwrap();
        Site { dir, stores }
    }

    fn request(uid: &str, photo: Option<&str>) -> AccessRequest {
        AccessRequest {
            scan: card::parse_line(&format!("Card UID: {uid} | Card recognized")).unwrap(),
            photo: photo.map(PathBuf::from),
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            queue_capacity: 4,
            poll_interval: Duration::from_millis(20),
            trust_reader_status: true,
        }
    }

    #[test]
    fn test_process_grants_and_journals() {
        let site = site();
        let mut processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            site.stores.clone(),
            site.audit(),
            StubExtractor::new(),
            ConsoleSink,
        );

        let verdict = processor.process(request("C3 7F F2 D9", Some("anas_face.jpg")));
        assert!(verdict.is_granted());
        assert_eq!(verdict.message, "Welcome Anas!");

        let audit = site.audit_lines();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0]["uid"], "C3 7F F2 D9");
        assert_eq!(audit[0]["type"], "access_granted");
        assert_eq!(audit[0]["is_recognized"], true);

        let (store, _) = site.stores.open().unwrap();
        assert_eq!(store.access_log_count().unwrap(), 1);
    }

    #[test]
    fn test_unopenable_store_is_system_error() {
        let site = site();
        let blocker = site.dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let stores = StorePaths {
            db_path: blocker.join("turnstile.db"),
            face_index_path: site.stores.face_index_path.clone(),
        };
        let mut processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            stores,
            site.audit(),
            StubExtractor::new(),
            ConsoleSink,
        );

        let verdict = processor.process(request("C3 7F F2 D9", Some("anas_face.jpg")));
        assert_eq!(verdict.deny_reason(), Some(DenyReason::SystemError));
        assert_eq!(site.audit_lines()[0]["type"], "access_denied: system_error");
    }

    #[test]
    fn test_panicking_decision_is_contained() {
        let site = site();
        let mut processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            site.stores.clone(),
            site.audit(),
            PanickingExtractor,
            ConsoleSink,
        );

        let verdict = processor.process(request("C3 7F F2 D9", Some("anas_face.jpg")));
        assert!(verdict.is_system_error());
        assert!(verdict.message.contains("model blew up"));
        assert_eq!(site.audit_lines()[0]["type"], "access_denied: system_error");

        let (store, _) = site.stores.open().unwrap();
        assert_eq!(store.access_log_count().unwrap(), 1);
        let logged = store.recent_access_logs(1).unwrap();
        assert_eq!(logged[0].user_id, None);
        assert_eq!(logged[0].action, AccessAction::Denied(DenyReason::SystemError));

        // The processor is still usable afterwards.
        let verdict = processor.process(request("99 99 99 99", None));
        assert_eq!(verdict.deny_reason(), Some(DenyReason::CardNotRegistered));
        assert_eq!(store.access_log_count().unwrap(), 2);
    }

    #[test]
    fn test_worker_passes_results_through() {
        let mut worker = ExtractorWorker::spawn(StubExtractor::new(), Duration::from_secs(5)).unwrap();
        let embedding = worker.extract(Path::new("anas_face.jpg")).unwrap();
        assert_eq!(embedding.dim(), 3);
        assert!(matches!(
            worker.extract(Path::new("nobody.jpg")),
            Err(ExtractError::InferenceFailed(_))
        ));
    }

    /// Panics on photos whose name contains "crash".
    struct CrashOnName(StubExtractor);

    impl EmbeddingExtractor for CrashOnName {
        fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError> {
            if image_path.to_string_lossy().contains("crash") {
                panic!("ort session poisoned");
            }
            self.0.extract(image_path)
        }
    }

    #[test]
    fn test_worker_survives_extractor_panic() {
        let mut worker =
            ExtractorWorker::spawn(CrashOnName(StubExtractor::new()), Duration::from_secs(5))
                .unwrap();

        match worker.extract(Path::new("crash.jpg")) {
            Err(ExtractError::InferenceFailed(msg)) => {
                assert!(msg.contains("ort session poisoned"))
            }
            other => panic!("expected inference failure, got {other:?}"),
        }
        assert_eq!(worker.extract(Path::new("anas_face.jpg")).unwrap().dim(), 3);
    }

    #[test]
    fn test_panic_behind_worker_denies_with_face_error() {
        let site = site();
        let worker =
            ExtractorWorker::spawn(CrashOnName(StubExtractor::new()), Duration::from_secs(5))
                .unwrap();
        let mut processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            site.stores.clone(),
            site.audit(),
            worker,
            ConsoleSink,
        );

        let verdict = processor.process(request("C3 7F F2 D9", Some("crash.jpg")));
        assert_eq!(verdict.deny_reason(), Some(DenyReason::FaceVerificationError));

        let verdict = processor.process(request("C3 7F F2 D9", Some("anas_face.jpg")));
        assert!(verdict.is_granted());
    }

    #[test]
    fn test_worker_times_out_slow_extraction() {
        let mut slow = StubExtractor::new();
        slow.delay = Duration::from_millis(500);
        let mut worker = ExtractorWorker::spawn(slow, Duration::from_millis(20)).unwrap();
        assert!(matches!(
            worker.extract(Path::new("anas_face.jpg")),
            Err(ExtractError::Timeout(_))
        ));
    }

    #[test]
    fn test_pipeline_end_to_end() {
        let site = site();
        let (verdict_tx, verdict_rx) = crossbeam_channel::unbounded();
        let processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            site.stores.clone(),
            site.audit(),
            StubExtractor::new(),
            verdict_tx,
        );
        let lines = ScriptedLines::new(&[
            "Scan PICC to see UID...",
            "Card UID: c3 7f f2 d9 | Card recognized",
            "Card UID: 99 99 99 99 | Card recognized",
            "garbage",
            "Card UID: 12 34 56 78 | Unknown card",
        ]);
        let photos = FixedPhoto(Some(PathBuf::from("anas_face.jpg")));

        let handle = spawn(settings(), lines, photos, processor).unwrap();
        let verdicts: Vec<Verdict> = (0..3)
            .map(|_| verdict_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        handle.shutdown();

        assert_eq!(verdicts[0].action, AccessAction::Granted);
        assert_eq!(verdicts[1].deny_reason(), Some(DenyReason::CardNotRegistered));
        assert_eq!(verdicts[1].message, "Card not registered");
        assert_eq!(verdicts[2].deny_reason(), Some(DenyReason::UnknownCard));

        let unregistered = std::fs::read_to_string(site.unregistered()).unwrap();
        assert_eq!(unregistered.lines().collect::<Vec<_>>(), vec!["99 99 99 99"]);

        let audit = site.audit_lines();
        assert_eq!(audit.len(), 3);
        assert_eq!(audit[1]["uid"], "99 99 99 99");
        assert_eq!(audit[1]["type"], "access_denied: card_not_registered");
        assert_eq!(audit[2]["is_recognized"], false);
    }

    #[test]
    fn test_untrusted_reader_status_goes_to_lookup() {
        let site = site();
        let (verdict_tx, verdict_rx) = crossbeam_channel::unbounded();
        let processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            site.stores.clone(),
            site.audit(),
            StubExtractor::new(),
            verdict_tx,
        );
        let lines = ScriptedLines::new(&["Card UID: C3 7F F2 D9 | Access denied"]);
        let photos = FixedPhoto(Some(PathBuf::from("anas_face.jpg")));

        let settings = PipelineSettings {
            trust_reader_status: false,
            ..settings()
        };
        let handle = spawn(settings, lines, photos, processor).unwrap();
        let verdict = verdict_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.shutdown();

        assert!(verdict.is_granted());
    }

    #[test]
    fn test_shutdown_with_idle_reader() {
        let site = site();
        let processor = Processor::new(
            site.engine(DecisionPolicy::default()),
            site.stores.clone(),
            site.audit(),
            StubExtractor::new(),
            ConsoleSink,
        );
        let handle = spawn(settings(), ScriptedLines::new(&[]), FixedPhoto(None), processor).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        assert!(site.audit_lines().is_empty());
    }
}
