//! Credential store: enrolled users, their photo rows and the access log.
//!
//! Backed by a single SQLite file. Handles are cheap to open and are not
//! shared across threads; each consumer opens its own.

use crate::types::{AccessAction, AccessLogEntry, FaceOwner, User};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    card_uid TEXT UNIQUE NOT NULL,
    face_embedding_id TEXT
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    face_embedding_id TEXT NOT NULL,
    image_path TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users (id),
    UNIQUE (face_embedding_id)
);

CREATE TABLE IF NOT EXISTS access_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    action TEXT NOT NULL,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (user_id) REFERENCES users (id)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("user {0} not found")]
    UserNotFound(i64),
}

/// The two operations the decision engine needs from the credential store.
pub trait CredentialLookup {
    fn user_by_card(&self, card_uid: &str) -> Result<Option<User>, StoreError>;

    /// Append one access log row; the timestamp is assigned by the store.
    fn log_access(
        &self,
        user_id: Option<i64>,
        action: AccessAction,
    ) -> Result<AccessLogEntry, StoreError>;
}

/// A user together with the number of enrolled photos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub user: User,
    pub image_count: usize,
}

/// A `face_embeddings` row joined with its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFaceEmbedding {
    pub embedding_id: String,
    pub owner: FaceOwner,
    pub image_path: PathBuf,
}

/// SQLite-backed credential store.
pub struct CredentialStore {
    conn: Connection,
}

impl CredentialStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn user_by_id(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let user = self
            .conn
            .query_row(
                "SELECT id, name, card_uid, face_embedding_id FROM users WHERE id = ?1",
                params![user_id],
                decode_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Return the user holding `card_uid`, creating it with `name` if absent.
    ///
    /// The boolean is `true` when the user was created. An existing user keeps
    /// its registered name.
    pub fn ensure_user(&self, name: &str, card_uid: &str) -> Result<(User, bool), StoreError> {
        if let Some(user) = self.user_by_card(card_uid)? {
            return Ok((user, false));
        }

        self.conn.execute(
            "INSERT INTO users (name, card_uid) VALUES (?1, ?2)",
            params![name, card_uid],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(user_id = id, name, card_uid, "created user");

        Ok((
            User {
                id,
                name: name.to_string(),
                card_uid: card_uid.to_string(),
                reference_embedding_id: None,
            },
            true,
        ))
    }

    /// Record enrolled photos for a user in one transaction.
    ///
    /// Inserts a `face_embeddings` row per entry and points the user's
    /// reference embedding at the last one.
    pub fn attach_embeddings(
        &mut self,
        user_id: i64,
        embeddings: &[(String, PathBuf)],
    ) -> Result<(), StoreError> {
        let Some((last_id, _)) = embeddings.last() else {
            return Ok(());
        };

        let tx = self.conn.transaction()?;
        for (embedding_id, image_path) in embeddings {
            tx.execute(
                "INSERT INTO face_embeddings (user_id, face_embedding_id, image_path)
                 VALUES (?1, ?2, ?3)",
                params![user_id, embedding_id, image_path.to_string_lossy()],
            )?;
        }
        let updated = tx.execute(
            "UPDATE users SET face_embedding_id = ?1 WHERE id = ?2",
            params![last_id, user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a user that has no photos and no access history.
    ///
    /// Returns `false` if the user still has dependent rows.
    pub fn remove_bare_user(&self, user_id: i64) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM users
             WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM face_embeddings WHERE user_id = ?1)
               AND NOT EXISTS (SELECT 1 FROM access_logs WHERE user_id = ?1)",
            params![user_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.name, u.card_uid, u.face_embedding_id, COUNT(f.id)
             FROM users u
             LEFT JOIN face_embeddings f ON u.id = f.user_id
             GROUP BY u.id
             ORDER BY u.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let user = decode_user(row)?;
            let count: i64 = row.get(4)?;
            Ok(UserSummary {
                user,
                image_count: usize::try_from(count)
                    .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(4, count))?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every enrolled photo with its owner, oldest first.
    pub fn face_embeddings(&self) -> Result<Vec<StoredFaceEmbedding>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT f.face_embedding_id, f.image_path, u.id, u.name, u.card_uid
             FROM face_embeddings f
             JOIN users u ON f.user_id = u.id
             ORDER BY f.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let image_path: String = row.get(1)?;
            Ok(StoredFaceEmbedding {
                embedding_id: row.get(0)?,
                image_path: PathBuf::from(image_path),
                owner: FaceOwner {
                    user_id: row.get(2)?,
                    name: row.get(3)?,
                    card_uid: row.get(4)?,
                },
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Users whose reference embedding has no `face_embeddings` row, and so
    /// cannot be re-derived from a stored image.
    pub fn orphan_references(&self) -> Result<Vec<User>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.name, u.card_uid, u.face_embedding_id
             FROM users u
             WHERE u.face_embedding_id IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM face_embeddings f
                   WHERE f.face_embedding_id = u.face_embedding_id
               )
             ORDER BY u.id ASC",
        )?;
        let rows = stmt.query_map([], decode_user)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Point a user at a reference embedding without a `face_embeddings` row,
    /// the shape left behind by older enrollment tools.
    #[cfg(test)]
    pub(crate) fn set_reference_embedding(&self, user_id: i64, embedding_id: &str) {
        self.conn
            .execute(
                "UPDATE users SET face_embedding_id = ?1 WHERE id = ?2",
                params![embedding_id, user_id],
            )
            .unwrap();
    }

    /// Most recent access log rows, newest first.
    pub fn recent_access_logs(&self, limit: usize) -> Result<Vec<AccessLogEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, action, timestamp FROM access_logs
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], decode_log_entry)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn access_log_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM access_logs", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

impl CredentialLookup for CredentialStore {
    fn user_by_card(&self, card_uid: &str) -> Result<Option<User>, StoreError> {
        let user = self
            .conn
            .query_row(
                "SELECT id, name, card_uid, face_embedding_id FROM users WHERE card_uid = ?1",
                params![card_uid],
                decode_user,
            )
            .optional()?;
        Ok(user)
    }

    fn log_access(
        &self,
        user_id: Option<i64>,
        action: AccessAction,
    ) -> Result<AccessLogEntry, StoreError> {
        self.conn.execute(
            "INSERT INTO access_logs (user_id, action) VALUES (?1, ?2)",
            params![user_id, action.to_string()],
        )?;
        let id = self.conn.last_insert_rowid();
        let entry = self.conn.query_row(
            "SELECT id, user_id, action, timestamp FROM access_logs WHERE id = ?1",
            params![id],
            decode_log_entry,
        )?;
        Ok(entry)
    }
}

fn decode_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        card_uid: row.get(2)?,
        reference_embedding_id: row.get(3)?,
    })
}

fn decode_log_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessLogEntry> {
    let action_raw: String = row.get(2)?;
    let action = action_raw
        .parse::<AccessAction>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(AccessLogEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        action,
        timestamp: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DenyReason;

    #[test]
    fn test_ensure_user_creates_once() {
        let store = CredentialStore::open_in_memory().unwrap();
        let (first, created) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        assert!(created);
        assert_eq!(first.reference_embedding_id, None);

        let (second, created) = store.ensure_user("Someone Else", "C3 7F F2 D9").unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "Anas");
    }

    #[test]
    fn test_user_by_card_miss() {
        let store = CredentialStore::open_in_memory().unwrap();
        assert_eq!(store.user_by_card("99 99 99 99").unwrap(), None);
    }

    #[test]
    fn test_attach_embeddings_sets_latest_reference() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let (user, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store
            .attach_embeddings(
                user.id,
                &[
                    ("e-1".into(), PathBuf::from("/photos/1.jpg")),
                    ("e-2".into(), PathBuf::from("/photos/2.jpg")),
                ],
            )
            .unwrap();

        let user = store.user_by_id(user.id).unwrap().unwrap();
        assert_eq!(user.reference_embedding_id.as_deref(), Some("e-2"));

        let rows = store.face_embeddings().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.owner.user_id == user.id));
        assert_eq!(rows[0].image_path, PathBuf::from("/photos/1.jpg"));
    }

    #[test]
    fn test_attach_embeddings_rejects_duplicate_ids() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let (user, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store
            .attach_embeddings(user.id, &[("e-1".into(), PathBuf::from("a.jpg"))])
            .unwrap();
        let dup = store.attach_embeddings(user.id, &[("e-1".into(), PathBuf::from("b.jpg"))]);
        assert!(dup.is_err());
        assert_eq!(store.face_embeddings().unwrap().len(), 1);
    }

    #[test]
    fn test_list_users_counts_images() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let (anas, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store.ensure_user("Mohamed", "F1 11 8A 3F").unwrap();
        store
            .attach_embeddings(
                anas.id,
                &[("a".into(), PathBuf::from("1.jpg")), ("b".into(), PathBuf::from("2.jpg"))],
            )
            .unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].image_count, 2);
        assert_eq!(users[1].image_count, 0);
    }

    #[test]
    fn test_log_access_assigns_timestamp() {
        let store = CredentialStore::open_in_memory().unwrap();
        let entry = store
            .log_access(None, AccessAction::Denied(DenyReason::UnknownCard))
            .unwrap();
        assert_eq!(entry.user_id, None);
        assert_eq!(entry.action, AccessAction::Denied(DenyReason::UnknownCard));
        assert!(!entry.timestamp.is_empty());

        let (user, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store.log_access(Some(user.id), AccessAction::Granted).unwrap();

        let logs = store.recent_access_logs(10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, AccessAction::Granted);
        assert_eq!(logs[0].user_id, Some(user.id));
        assert_eq!(store.access_log_count().unwrap(), 2);
    }

    #[test]
    fn test_orphan_references() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let (user, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store
            .attach_embeddings(user.id, &[("kept".into(), PathBuf::from("1.jpg"))])
            .unwrap();
        assert!(store.orphan_references().unwrap().is_empty());

        store.set_reference_embedding(user.id, "legacy");
        let orphans = store.orphan_references().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].reference_embedding_id.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_remove_bare_user() {
        let mut store = CredentialStore::open_in_memory().unwrap();
        let (bare, _) = store.ensure_user("Bare", "01 02 03 04").unwrap();
        assert!(store.remove_bare_user(bare.id).unwrap());
        assert_eq!(store.user_by_id(bare.id).unwrap(), None);

        let (enrolled, _) = store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        store
            .attach_embeddings(enrolled.id, &[("e".into(), PathBuf::from("1.jpg"))])
            .unwrap();
        assert!(!store.remove_bare_user(enrolled.id).unwrap());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/access_control.db");
        let store = CredentialStore::open(&path).unwrap();
        store.ensure_user("Anas", "C3 7F F2 D9").unwrap();
        drop(store);

        let reopened = CredentialStore::open(&path).unwrap();
        assert!(reopened.user_by_card("C3 7F F2 D9").unwrap().is_some());
    }
}
