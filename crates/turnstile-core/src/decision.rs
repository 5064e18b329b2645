//! Two-factor access decision.
//!
//! One run per [`AccessRequest`]: card lookup, then face verification against
//! the face index. Every run ends in exactly one access log row, whatever the
//! outcome, and never returns an error: infrastructure faults become
//! `access_denied: system_error` verdicts.

use crate::credentials::CredentialLookup;
use crate::extractor::EmbeddingExtractor;
use crate::face_index::FaceIndex;
use crate::journal::UnregisteredCards;
use crate::types::{AccessAction, AccessRequest, DenyReason, User, Verdict, VerdictStatus};

/// Tunables for the decision state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    /// Deny when no photo was captured. When false, a missing photo grants on
    /// card evidence alone (`access_granted: card_only`).
    pub require_face: bool,
    /// Nearest neighbours below this cosine similarity count as no match.
    pub min_similarity: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            require_face: true,
            min_similarity: 0.40,
        }
    }
}

/// The access decision state machine.
pub struct DecisionEngine {
    policy: DecisionPolicy,
    unregistered: UnregisteredCards,
}

/// Terminal state of one evaluation, before it is logged.
struct Outcome {
    action: AccessAction,
    message: String,
    user: Option<User>,
}

impl Outcome {
    fn denied(reason: DenyReason, message: impl Into<String>, user: Option<User>) -> Self {
        Self {
            action: AccessAction::Denied(reason),
            message: message.into(),
            user,
        }
    }
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy, unregistered: UnregisteredCards) -> Self {
        Self {
            policy,
            unregistered,
        }
    }

    /// Decide one access request and record it in the access log.
    ///
    /// A failed log write is reported but does not change the verdict.
    pub fn decide<C, I, X>(
        &self,
        request: &AccessRequest,
        credentials: &C,
        index: &I,
        extractor: &mut X,
    ) -> Verdict
    where
        C: CredentialLookup + ?Sized,
        I: FaceIndex + ?Sized,
        X: EmbeddingExtractor + ?Sized,
    {
        let outcome = self.evaluate(request, credentials, index, extractor);
        let user_id = outcome.user.as_ref().map(|u| u.id);

        if let Err(e) = credentials.log_access(user_id, outcome.action) {
            tracing::error!(
                error = %e,
                uid = %request.scan.uid,
                action = %outcome.action,
                "failed to write access log entry"
            );
        }

        Verdict {
            status: if outcome.action.is_granted() {
                VerdictStatus::Granted
            } else {
                VerdictStatus::Denied
            },
            action: outcome.action,
            message: outcome.message,
            user_id,
            name: outcome.user.map(|u| u.name),
        }
    }

    fn evaluate<C, I, X>(
        &self,
        request: &AccessRequest,
        credentials: &C,
        index: &I,
        extractor: &mut X,
    ) -> Outcome
    where
        C: CredentialLookup + ?Sized,
        I: FaceIndex + ?Sized,
        X: EmbeddingExtractor + ?Sized,
    {
        let scan = &request.scan;

        if !scan.is_recognized {
            return Outcome::denied(DenyReason::UnknownCard, "Unknown card", None);
        }

        let user = match credentials.user_by_card(&scan.uid) {
            Ok(Some(user)) => user,
            Ok(None) => {
                if let Err(e) = self.unregistered.record(&scan.uid) {
                    tracing::error!(error = %e, uid = %scan.uid, "failed to record unregistered card");
                }
                return Outcome::denied(DenyReason::CardNotRegistered, "Card not registered", None);
            }
            Err(e) => {
                tracing::error!(error = %e, uid = %scan.uid, "credential lookup failed");
                return Outcome::denied(DenyReason::SystemError, format!("System error: {e}"), None);
            }
        };

        let Some(photo) = request.photo.as_deref() else {
            if self.policy.require_face {
                return Outcome::denied(
                    DenyReason::NoPhoto,
                    "Face photo required but none was captured",
                    Some(user),
                );
            }
            tracing::warn!(user_id = user.id, "no photo captured; granting on card evidence only");
            return Outcome {
                action: AccessAction::GrantedCardOnly,
                message: format!("Welcome {}! (card only, no photo captured)", user.name),
                user: Some(user),
            };
        };

        let probe = match extractor.extract(photo) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(error = %e, photo = %photo.display(), "embedding extraction failed");
                return Outcome::denied(
                    DenyReason::FaceVerificationError,
                    format!("Face verification error: {e}"),
                    Some(user),
                );
            }
        };

        let nearest = match index.search(&probe, 1) {
            Ok(hits) => hits.into_iter().next(),
            Err(e) => {
                tracing::error!(error = %e, "face index search failed");
                return Outcome::denied(DenyReason::SystemError, format!("System error: {e}"), Some(user));
            }
        };

        let Some(nearest) = nearest else {
            return Outcome::denied(DenyReason::NoFaceMatch, "No matching face found", Some(user));
        };

        tracing::debug!(
            embedding_id = %nearest.embedding_id,
            similarity = nearest.similarity,
            "nearest face"
        );

        if nearest.similarity < self.policy.min_similarity {
            return Outcome::denied(
                DenyReason::NoFaceMatch,
                format!(
                    "No matching face found (best similarity {:.2})",
                    nearest.similarity
                ),
                Some(user),
            );
        }

        if nearest.owner.name.to_lowercase() != user.name.to_lowercase() {
            return Outcome::denied(
                DenyReason::FaceMismatch,
                format!("Face mismatch for card holder {}", user.name),
                Some(user),
            );
        }

        Outcome {
            action: AccessAction::Granted,
            message: format!("Welcome {}!", user.name),
            user: Some(user),
        }
    }
}
