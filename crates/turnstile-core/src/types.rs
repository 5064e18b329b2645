use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Face embedding vector (512-dimensional for the bundled FaceNet model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Mismatched lengths
    /// compare over the shared prefix.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// An enrolled card holder, as stored in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub card_uid: String,
    /// Most recently enrolled embedding for this user.
    pub reference_embedding_id: Option<String>,
}

/// Owner metadata attached to every face index record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceOwner {
    pub user_id: i64,
    pub name: String,
    pub card_uid: String,
}

/// One enrolled photo's embedding, as held by the face index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbeddingRecord {
    pub embedding_id: String,
    pub owner: FaceOwner,
    pub source_image_path: PathBuf,
    pub embedding: Embedding,
    /// RFC 3339 enrollment time.
    pub enrolled_at: String,
}

/// A ranked face index hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    pub embedding_id: String,
    pub owner: FaceOwner,
    pub source_image_path: PathBuf,
    /// Cosine similarity to the probe [-1, 1].
    pub similarity: f32,
}

/// A parsed line from the card reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardScan {
    pub uid: String,
    pub is_recognized: bool,
    pub raw_line: String,
}

/// One card presentation travelling from the listener to the decision engine.
///
/// Moved through the queue; exactly one stage owns it at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub scan: CardScan,
    /// Captured photo, `None` when capture failed.
    pub photo: Option<PathBuf>,
}

/// Why access was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    UnknownCard,
    CardNotRegistered,
    NoPhoto,
    FaceVerificationError,
    NoFaceMatch,
    FaceMismatch,
    SystemError,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCard => "unknown_card",
            Self::CardNotRegistered => "card_not_registered",
            Self::NoPhoto => "no_photo",
            Self::FaceVerificationError => "face_verification_error",
            Self::NoFaceMatch => "no_face_match",
            Self::FaceMismatch => "face_mismatch",
            Self::SystemError => "system_error",
        }
    }

    /// Abnormal outcomes that need operator attention, as opposed to
    /// ordinary business denials.
    pub fn is_system_error(&self) -> bool {
        matches!(self, Self::FaceVerificationError | Self::SystemError)
    }

    const ALL: [DenyReason; 7] = [
        Self::UnknownCard,
        Self::CardNotRegistered,
        Self::NoPhoto,
        Self::FaceVerificationError,
        Self::NoFaceMatch,
        Self::FaceMismatch,
        Self::SystemError,
    ];
}

/// Tagged outcome recorded in the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessAction {
    Granted,
    /// Granted on card evidence alone because no photo was available and the
    /// policy allows it.
    GrantedCardOnly,
    Denied(DenyReason),
}

impl AccessAction {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted | Self::GrantedCardOnly)
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => f.write_str("access_granted"),
            Self::GrantedCardOnly => f.write_str("access_granted: card_only"),
            Self::Denied(reason) => write!(f, "access_denied: {}", reason.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown access action: {0}")]
pub struct ParseActionError(pub String);

impl FromStr for AccessAction {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access_granted" => return Ok(Self::Granted),
            "access_granted: card_only" => return Ok(Self::GrantedCardOnly),
            _ => {}
        }
        let reason = s
            .strip_prefix("access_denied: ")
            .and_then(|tag| DenyReason::ALL.into_iter().find(|r| r.as_str() == tag))
            .ok_or_else(|| ParseActionError(s.to_string()))?;
        Ok(Self::Denied(reason))
    }
}

impl Serialize for AccessAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Append-only access log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessLogEntry {
    pub id: i64,
    /// `None` when the card could not be tied to a user.
    pub user_id: Option<i64>,
    pub action: AccessAction,
    /// Store-assigned write time (`YYYY-MM-DD HH:MM:SS`, UTC).
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Granted,
    Denied,
}

/// Decision engine output for one access request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub action: AccessAction,
    pub message: String,
    pub user_id: Option<i64>,
    pub name: Option<String>,
}

impl Verdict {
    pub fn is_granted(&self) -> bool {
        self.status == VerdictStatus::Granted
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self.action {
            AccessAction::Denied(reason) => Some(reason),
            _ => None,
        }
    }

    /// Denial caused by an infrastructure fault rather than the card holder.
    pub fn is_system_error(&self) -> bool {
        self.deny_reason().is_some_and(|r| r.is_system_error())
    }
}
