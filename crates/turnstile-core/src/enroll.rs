//! Enrollment of card holders and repair of the credential store ↔ face
//! index invariant.

use crate::card::normalize_uid;
use crate::credentials::{CredentialStore, StoreError};
use crate::extractor::EmbeddingExtractor;
use crate::face_index::{FaceIndex, IndexError};
use crate::types::{Embedding, FaceEmbeddingRecord, FaceOwner, User};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("credential store: {0}")]
    Store(#[from] StoreError),
    #[error("face index: {0}")]
    Index(#[from] IndexError),
    #[error("invalid card UID {0:?}; expected hex byte pairs like \"C3 7F F2 D9\"")]
    InvalidCard(String),
    #[error("name must not be empty")]
    EmptyName,
    #[error("cannot read image folder {path}: {source}")]
    Folder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images to enroll")]
    NoImages,
    #[error("none of the {attempted} images produced a usable embedding")]
    NoUsableImages { attempted: usize },
}

/// Where enrollment photos come from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Files(Vec<PathBuf>),
    /// Every image file directly inside a folder, sorted by name.
    Folder(PathBuf),
}

impl ImageSource {
    pub fn resolve(&self) -> Result<Vec<PathBuf>, EnrollError> {
        match self {
            Self::Files(paths) => Ok(paths.clone()),
            Self::Folder(dir) => image_files_in(dir),
        }
    }
}

/// Result of a successful enrollment.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub user: User,
    pub created: bool,
    /// New embedding ids, in enrollment order.
    pub embedding_ids: Vec<String>,
    /// Images that were skipped, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub repaired: Vec<String>,
    /// Embedding ids that could not be re-derived, with the reason.
    pub failed: Vec<(String, String)>,
    /// Users whose reference embedding is missing from the index and has no
    /// stored image to re-derive it from.
    pub unrepairable: Vec<User>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.failed.is_empty() && self.unrepairable.is_empty()
    }
}

/// Writes enrollments to both stores.
pub struct Enroller<'a, I: ?Sized, X: ?Sized> {
    store: &'a mut CredentialStore,
    index: &'a I,
    extractor: &'a mut X,
}

impl<'a, I, X> Enroller<'a, I, X>
where
    I: FaceIndex + ?Sized,
    X: EmbeddingExtractor + ?Sized,
{
    pub fn new(store: &'a mut CredentialStore, index: &'a I, extractor: &'a mut X) -> Self {
        Self {
            store,
            index,
            extractor,
        }
    }

    /// Enroll photos for a card holder, creating the user if the card is new.
    ///
    /// Photos without a usable embedding are skipped. If none is usable,
    /// nothing is written.
    pub fn enroll(
        &mut self,
        name: &str,
        card_uid: &str,
        images: &ImageSource,
    ) -> Result<EnrollOutcome, EnrollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollError::EmptyName);
        }
        let card_uid =
            normalize_uid(card_uid).ok_or_else(|| EnrollError::InvalidCard(card_uid.to_string()))?;

        let paths = images.resolve()?;
        if paths.is_empty() {
            return Err(EnrollError::NoImages);
        }
        let attempted = paths.len();

        let mut skipped = Vec::new();
        let mut extracted: Vec<(PathBuf, Embedding)> = Vec::new();
        for path in paths {
            match self.extractor.extract(&path) {
                Ok(embedding) => extracted.push((path, embedding)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping image");
                    skipped.push((path, e.to_string()));
                }
            }
        }
        if extracted.is_empty() {
            return Err(EnrollError::NoUsableImages { attempted });
        }

        let (user, created) = self.store.ensure_user(name, &card_uid)?;
        if !created && user.name != name {
            tracing::warn!(
                registered = %user.name,
                given = name,
                card_uid = %card_uid,
                "card already enrolled under another name; keeping registered name"
            );
        }
        let owner = FaceOwner {
            user_id: user.id,
            name: user.name.clone(),
            card_uid: user.card_uid.clone(),
        };

        let mut attached = Vec::new();
        for (path, embedding) in extracted {
            let record = FaceEmbeddingRecord {
                embedding_id: uuid::Uuid::new_v4().to_string(),
                owner: owner.clone(),
                source_image_path: path,
                embedding,
                enrolled_at: chrono::Utc::now().to_rfc3339(),
            };
            match self.index.add(&record) {
                Ok(()) => attached.push((record.embedding_id, record.source_image_path)),
                Err(e) => {
                    tracing::warn!(path = %record.source_image_path.display(), error = %e, "face index rejected image");
                    skipped.push((record.source_image_path, e.to_string()));
                }
            }
        }

        if attached.is_empty() {
            if created {
                self.store.remove_bare_user(user.id)?;
            }
            return Err(EnrollError::NoUsableImages { attempted });
        }

        self.store.attach_embeddings(user.id, &attached)?;
        let user = self
            .store
            .user_by_id(user.id)?
            .ok_or(StoreError::UserNotFound(user.id))?;

        tracing::info!(
            user_id = user.id,
            name = %user.name,
            enrolled = attached.len(),
            attempted,
            "enrollment complete"
        );

        Ok(EnrollOutcome {
            user,
            created,
            embedding_ids: attached.into_iter().map(|(id, _)| id).collect(),
            skipped,
        })
    }

    /// Re-derive face index entries that the credential store references but
    /// the index lacks.
    pub fn reconcile(&mut self) -> Result<ReconcileReport, EnrollError> {
        let rows = self.store.face_embeddings()?;
        let mut indexed: HashSet<String> = self.index.ids()?;
        let mut report = ReconcileReport {
            checked: rows.len(),
            ..ReconcileReport::default()
        };

        for row in rows {
            if indexed.contains(&row.embedding_id) {
                continue;
            }
            tracing::info!(embedding_id = %row.embedding_id, "embedding missing from face index; re-deriving");

            let embedding = match self.extractor.extract(&row.image_path) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(path = %row.image_path.display(), error = %e, "re-derivation failed");
                    report.failed.push((row.embedding_id, e.to_string()));
                    continue;
                }
            };
            let record = FaceEmbeddingRecord {
                embedding_id: row.embedding_id,
                owner: row.owner,
                source_image_path: row.image_path,
                embedding,
                enrolled_at: chrono::Utc::now().to_rfc3339(),
            };
            match self.index.add(&record) {
                Ok(()) => {
                    indexed.insert(record.embedding_id.clone());
                    report.repaired.push(record.embedding_id);
                }
                Err(e) => report.failed.push((record.embedding_id, e.to_string())),
            }
        }

        report.unrepairable = self
            .store
            .orphan_references()?
            .into_iter()
            .filter(|u| {
                u.reference_embedding_id
                    .as_ref()
                    .is_some_and(|id| !indexed.contains(id))
            })
            .collect();

        tracing::info!(
            checked = report.checked,
            repaired = report.repaired.len(),
            failed = report.failed.len(),
            unrepairable = report.unrepairable.len(),
            "reconciliation completed"
        );
        Ok(report)
    }
}

fn image_files_in(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let entries = std::fs::read_dir(dir).map_err(|source| EnrollError::Folder {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    files.sort();

    tracing::debug!(folder = %dir.display(), count = files.len(), "found image files");
    Ok(files)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialLookup;
    use crate::extractor::ExtractError;
    use crate::face_index::SqliteFaceIndex;

    /// Derives a deterministic embedding from the file name; names
    /// containing "noface" fail.
    struct NameExtractor;

    impl EmbeddingExtractor for NameExtractor {
        fn extract(&mut self, image_path: &Path) -> Result<Embedding, ExtractError> {
            let name = image_path.file_name().unwrap().to_string_lossy().to_string();
            if name.contains("noface") {
                return Err(ExtractError::InferenceFailed(format!("no face in {name}")));
            }
            let seed = name.bytes().map(f32::from).sum::<f32>();
            Ok(Embedding::new(vec![seed.sin(), seed.cos(), 1.0]))
        }
    }

    fn files(names: &[&str]) -> ImageSource {
        ImageSource::Files(names.iter().map(PathBuf::from).collect())
    }

    #[test]
    fn test_enroll_n_photos_round_trip() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let mut extractor = NameExtractor;

        let outcome = Enroller::new(&mut store, &index, &mut extractor)
            .enroll("Anas", "c3 7f f2 d9", &files(&["1.jpg", "2.jpg", "3.jpg"]))
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.embedding_ids.len(), 3);
        let distinct: HashSet<_> = outcome.embedding_ids.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert_eq!(outcome.user.card_uid, "C3 7F F2 D9");
        assert_eq!(
            outcome.user.reference_embedding_id.as_ref(),
            outcome.embedding_ids.last()
        );

        let rows = store.face_embeddings().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.owner.user_id == outcome.user.id));
        assert_eq!(index.len().unwrap(), 3);
        for id in &outcome.embedding_ids {
            assert!(index.contains(id).unwrap());
        }
    }

    #[test]
    fn test_enroll_existing_card_appends_and_keeps_name() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let mut extractor = NameExtractor;
        let mut enroller = Enroller::new(&mut store, &index, &mut extractor);

        let first = enroller
            .enroll("Anas", "C3 7F F2 D9", &files(&["1.jpg"]))
            .unwrap();
        let second = enroller
            .enroll("Anas S.", "C3 7F F2 D9", &files(&["2.jpg"]))
            .unwrap();

        assert!(!second.created);
        assert_eq!(second.user.id, first.user.id);
        assert_eq!(second.user.name, "Anas");
        assert_eq!(
            second.user.reference_embedding_id.as_ref(),
            second.embedding_ids.last()
        );
        assert_eq!(store.list_users().unwrap()[0].image_count, 2);
    }

    #[test]
    fn test_enroll_skips_unusable_images() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let mut extractor = NameExtractor;

        let outcome = Enroller::new(&mut store, &index, &mut extractor)
            .enroll("Anas", "C3 7F F2 D9", &files(&["noface.jpg", "good.jpg"]))
            .unwrap();
        assert_eq!(outcome.embedding_ids.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].0, PathBuf::from("noface.jpg"));
    }

    #[test]
    fn test_enroll_without_usable_images_writes_nothing() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let mut extractor = NameExtractor;

        let err = Enroller::new(&mut store, &index, &mut extractor)
            .enroll("Anas", "C3 7F F2 D9", &files(&["noface1.jpg", "noface2.jpg"]))
            .unwrap_err();
        assert!(matches!(err, EnrollError::NoUsableImages { attempted: 2 }));
        assert!(store.user_by_card("C3 7F F2 D9").unwrap().is_none());
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn test_enroll_rejects_bad_input() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let mut extractor = NameExtractor;
        let mut enroller = Enroller::new(&mut store, &index, &mut extractor);

        assert!(matches!(
            enroller.enroll("  ", "C3 7F F2 D9", &files(&["1.jpg"])),
            Err(EnrollError::EmptyName)
        ));
        assert!(matches!(
            enroller.enroll("Anas", "not-a-card", &files(&["1.jpg"])),
            Err(EnrollError::InvalidCard(_))
        ));
        assert!(matches!(
            enroller.enroll("Anas", "C3 7F F2 D9", &files(&[])),
            Err(EnrollError::NoImages)
        ));
    }

    #[test]
    fn test_folder_source_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.jpeg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let found = ImageSource::Folder(dir.path().to_path_buf()).resolve().unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a.jpg", "b.PNG", "c.jpeg"]);
    }

    #[test]
    fn test_missing_folder_is_error() {
        let err = ImageSource::Folder(PathBuf::from("/nonexistent/photos"))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, EnrollError::Folder { .. }));
    }

    #[test]
    fn test_reconcile_restores_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::open_in_memory().unwrap();
        let mut extractor = NameExtractor;

        let lost_index = SqliteFaceIndex::open(dir.path().join("lost.db")).unwrap();
        let enrolled = Enroller::new(&mut store, &lost_index, &mut extractor)
            .enroll("Anas", "C3 7F F2 D9", &files(&["1.jpg", "2.jpg"]))
            .unwrap();

        let fresh_index = SqliteFaceIndex::open(dir.path().join("fresh.db")).unwrap();
        let report = Enroller::new(&mut store, &fresh_index, &mut extractor)
            .reconcile()
            .unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.repaired.len(), 2);
        assert!(report.is_consistent());
        for id in &enrolled.embedding_ids {
            assert!(fresh_index.contains(id).unwrap());
        }

        let again = Enroller::new(&mut store, &fresh_index, &mut extractor)
            .reconcile()
            .unwrap();
        assert!(again.repaired.is_empty());
    }

    #[test]
    fn test_reconcile_reports_failures_and_orphans() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let (user, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store
            .attach_embeddings(user.id, &[("gone".into(), PathBuf::from("noface.jpg"))])
            .unwrap();
        let (legacy, _) = store.ensure_user("Legacy", "01 02 03 04").unwrap();
        store.set_reference_embedding(legacy.id, "legacy-ref");

        let mut extractor = NameExtractor;
        let report = Enroller::new(&mut store, &index, &mut extractor)
            .reconcile()
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "gone");
        assert_eq!(report.unrepairable.len(), 1);
        assert_eq!(report.unrepairable[0].id, legacy.id);
        assert_eq!(
            report.unrepairable[0].reference_embedding_id.as_deref(),
            Some("legacy-ref")
        );
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_reconcile_ignores_orphan_reference_present_in_index() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let index = SqliteFaceIndex::open_in_memory().unwrap();
        let (legacy, _) = store.ensure_user("Legacy", "01 02 03 04").unwrap();
        store.set_reference_embedding(legacy.id, "legacy-ref");
        index
            .add(&FaceEmbeddingRecord {
                embedding_id: "legacy-ref".into(),
                owner: FaceOwner {
                    user_id: legacy.id,
                    name: legacy.name.clone(),
                    card_uid: legacy.card_uid.clone(),
                },
                source_image_path: PathBuf::from("legacy.jpg"),
                embedding: Embedding::new(vec![0.0, 1.0, 0.0]),
                enrolled_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();

        let mut extractor = NameExtractor;
        let report = Enroller::new(&mut store, &index, &mut extractor)
            .reconcile()
            .unwrap();
        assert_eq!(report.checked, 0);
        assert!(report.unrepairable.is_empty());
        assert!(report.is_consistent());
    }
}
