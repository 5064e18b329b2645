//! turnstile-core: two-factor (card + face) access decisions.
//!
//! Holds the credential store, the face index, the embedding extractor seam,
//! enrollment, and the decision engine that ties them together.

pub mod card;
pub mod credentials;
pub mod decision;
pub mod enroll;
pub mod extractor;
pub mod face_index;
pub mod journal;
pub mod types;

pub use credentials::{CredentialLookup, CredentialStore, StoreError};
pub use decision::{DecisionEngine, DecisionPolicy};
pub use enroll::{EnrollError, Enroller, ImageSource};
pub use extractor::{EmbeddingExtractor, ExtractError, OnnxExtractor};
pub use face_index::{FaceIndex, IndexError, SqliteFaceIndex};
pub use types::{AccessAction, AccessRequest, CardScan, DenyReason, Embedding, User, Verdict};

use std::path::PathBuf;

/// Per-user data directory: `$XDG_DATA_HOME/turnstile`, falling back to
/// `~/.local/share/turnstile`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("turnstile")
}

/// Default location of the FaceNet ONNX export.
pub fn default_model_path() -> PathBuf {
    default_data_dir().join("models/facenet_vggface2.onnx")
}
