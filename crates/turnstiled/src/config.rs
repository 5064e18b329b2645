use std::path::PathBuf;
use std::time::Duration;
use turnstile_core::DecisionPolicy;
use turnstile_hw::RetryPolicy;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Card reader tty (default: /dev/ttyACM0).
    pub serial_port: String,
    pub baud_rate: u32,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Root for the stores, journals and captured photos.
    pub data_dir: PathBuf,
    /// FaceNet ONNX model file.
    pub model_path: PathBuf,
    pub db_path: PathBuf,
    pub face_index_path: PathBuf,
    pub capture_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub unregistered_path: PathBuf,
    /// Deny when no photo could be taken.
    pub require_face: bool,
    /// Cosine similarity floor for the nearest enrolled face.
    pub min_similarity: f32,
    /// Requests buffered between the listener and the processor.
    pub queue_capacity: usize,
    /// How often blocked loops wake up to check for shutdown.
    pub poll_interval_ms: u64,
    pub capture_attempts: u32,
    pub capture_backoff_ms: u64,
    /// Upper bound on a single camera buffer dequeue.
    pub capture_timeout_ms: u64,
    pub extract_timeout_secs: u64,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Repair face index drift against the credential store before serving.
    pub reconcile_on_start: bool,
    /// Honour the reader's own "Card recognized" status. When off, every
    /// well-formed scan goes on to the credential lookup.
    pub trust_reader_status: bool,
}

impl Config {
    /// Load configuration from `TURNSTILE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("TURNSTILE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| turnstile_core::default_data_dir());

        Self {
            serial_port: std::env::var("TURNSTILE_SERIAL_PORT")
                .unwrap_or_else(|_| "/dev/ttyACM0".to_string()),
            baud_rate: env_u32("TURNSTILE_BAUD_RATE", 9600),
            camera_device: std::env::var("TURNSTILE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_path: env_path("TURNSTILE_MODEL_PATH", || {
                data_dir.join("models/facenet_vggface2.onnx")
            }),
            db_path: env_path("TURNSTILE_DB_PATH", || data_dir.join("turnstile.db")),
            face_index_path: env_path("TURNSTILE_FACE_INDEX_PATH", || {
                data_dir.join("face_index.db")
            }),
            capture_dir: env_path("TURNSTILE_CAPTURE_DIR", || data_dir.join("captures")),
            audit_log_path: env_path("TURNSTILE_AUDIT_LOG", || data_dir.join("rfid_log.json")),
            unregistered_path: env_path("TURNSTILE_UNREGISTERED_FILE", || {
                data_dir.join("unregistered_cards.txt")
            }),
            require_face: env_bool("TURNSTILE_REQUIRE_FACE", true),
            min_similarity: env_f32("TURNSTILE_MIN_SIMILARITY", 0.40),
            queue_capacity: env_usize("TURNSTILE_QUEUE_CAPACITY", 16).max(1),
            poll_interval_ms: env_u64("TURNSTILE_POLL_INTERVAL_MS", 1000),
            capture_attempts: env_u32("TURNSTILE_CAPTURE_ATTEMPTS", 3),
            capture_backoff_ms: env_u64("TURNSTILE_CAPTURE_BACKOFF_MS", 500),
            capture_timeout_ms: env_u64("TURNSTILE_CAPTURE_TIMEOUT_MS", 2000),
            extract_timeout_secs: env_u64("TURNSTILE_EXTRACT_TIMEOUT_SECS", 10),
            warmup_frames: env_usize("TURNSTILE_WARMUP_FRAMES", 4),
            reconcile_on_start: env_bool("TURNSTILE_RECONCILE_ON_START", true),
            trust_reader_status: env_bool("TURNSTILE_TRUST_READER_STATUS", true),
            data_dir,
        }
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            require_face: self.require_face,
            min_similarity: self.min_similarity,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.capture_attempts,
            backoff: Duration::from_millis(self.capture_backoff_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

fn env_path(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| default())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `0`, `false`, `no` and `off` disable; anything else set enables.
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
