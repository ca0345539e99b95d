//! SQLite-backed record store.
//!
//! # Schema
//!
//! - `users`: `id`, `type`, `pubkey`
//! - `repos`: `id`, `name`, `group_path`, `contrib_policy`
//! - `repo_maintainers`: `repo_id`, `user_id`
//! - `merge_requests`: `repo_id`, `local_id`, `creator`, `source_ref`,
//!   `dest_branch`, `status`, `title`, with `UNIQUE(repo_id, source_ref)`
//! - `federated_identities`: `user_id`, `service`, `remote_username`
//!
//! The `UNIQUE(repo_id, source_ref)` constraint is what serializes
//! concurrent merge-request creation for the same branch name; callers see
//! the loser of the race as [`StoreError::DuplicateSourceRef`].

use std::path::Path;
use std::str::FromStr as _;
use std::sync::Mutex;

use graft_core::models::{ContributionPolicy, UserKind};
use rusqlite::{params, Connection, OptionalExtension as _, TransactionBehavior};
use tracing::info;

use super::{MergeRequest, PushAccess, RecordStore, StoreError};

/// Schema version stamped into `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    type    TEXT NOT NULL,
    pubkey  TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS repos (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    group_path      TEXT NOT NULL DEFAULT '',
    contrib_policy  TEXT NOT NULL DEFAULT 'public'
);
CREATE TABLE IF NOT EXISTS repo_maintainers (
    repo_id  INTEGER NOT NULL REFERENCES repos(id),
    user_id  INTEGER NOT NULL REFERENCES users(id),
    UNIQUE(repo_id, user_id)
);
CREATE TABLE IF NOT EXISTS merge_requests (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id      INTEGER NOT NULL REFERENCES repos(id),
    local_id     INTEGER NOT NULL,
    creator      INTEGER REFERENCES users(id),
    source_ref   TEXT NOT NULL,
    dest_branch  TEXT,
    status       TEXT NOT NULL DEFAULT 'open',
    title        TEXT,
    UNIQUE(repo_id, source_ref),
    UNIQUE(repo_id, local_id)
);
CREATE TABLE IF NOT EXISTS federated_identities (
    user_id          INTEGER NOT NULL REFERENCES users(id),
    service          TEXT NOT NULL,
    remote_username  TEXT NOT NULL,
    UNIQUE(user_id, service)
);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

/// Record store backed by a single SQLite connection.
///
/// The connection sits behind a mutex; every operation is a short
/// transaction, so contention stays negligible next to the socket I/O
/// around it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if necessary) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        info!(db = %path.display(), "record store opened");
        Ok(store)
    }

    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version == 0 {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        } else if version != SCHEMA_VERSION {
            return Err(StoreError::Backend {
                message: format!("unsupported schema version {version}"),
            });
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("record store lock poisoned")
    }

    /// Creates a repository and returns its id. Administrative surface,
    /// also used to seed tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on database failure.
    pub fn add_repo(
        &self,
        name: &str,
        group_path: &[String],
        policy: ContributionPolicy,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO repos (name, group_path, contrib_policy) VALUES (?1, ?2, ?3)",
            params![name, group_path.join("/"), policy.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Creates a user of the given kind and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on database failure.
    pub fn add_user(&self, kind: UserKind, pubkey: Option<&str>) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (type, pubkey) VALUES (?1, ?2)",
            params![kind.as_str(), pubkey],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Grants a user direct access to a repository.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on database failure.
    pub fn add_maintainer(&self, repo_id: i64, user_id: i64) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR IGNORE INTO repo_maintainers (repo_id, user_id) VALUES (?1, ?2)",
            params![repo_id, user_id],
        )?;
        Ok(())
    }
}

fn row_to_merge_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeRequest> {
    Ok(MergeRequest {
        repo_id: row.get(0)?,
        local_id: row.get::<_, i64>(1)? as u64,
        creator: row.get(2)?,
        source_ref: row.get(3)?,
        dest_branch: row.get(4)?,
        status: row.get(5)?,
        title: row.get(6)?,
    })
}

impl RecordStore for SqliteStore {
    fn resolve_push_access(&self, repo_id: i64, pubkey: &str) -> Result<PushAccess, StoreError> {
        let conn = self.lock();

        let policy: Option<String> = conn
            .query_row(
                "SELECT contrib_policy FROM repos WHERE id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()?;
        let policy = policy.ok_or(StoreError::UnknownRepo { repo_id })?;
        let policy = ContributionPolicy::from_str(&policy).map_err(|e| StoreError::Backend {
            message: e.to_string(),
        })?;

        let user: Option<(i64, String)> = if pubkey.is_empty() {
            None
        } else {
            conn.query_row(
                "SELECT id, type FROM users WHERE pubkey = ?1",
                params![pubkey],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let (user_id, user_kind) = match user {
            Some((id, kind)) => {
                let kind = UserKind::from_str(&kind).map_err(|e| StoreError::Backend {
                    message: e.to_string(),
                })?;
                (Some(id), kind)
            }
            None => (None, UserKind::Unknown),
        };

        let direct_access = match user_id {
            Some(id) => {
                let found: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM repo_maintainers WHERE repo_id = ?1 AND user_id = ?2",
                        params![repo_id, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                found.is_some()
            }
            None => false,
        };

        Ok(PushAccess {
            user_id,
            user_kind,
            direct_access,
            policy,
        })
    }

    fn create_merge_request(
        &self,
        repo_id: i64,
        creator: Option<i64>,
        source_ref: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let local_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(local_id), 0) + 1 FROM merge_requests WHERE repo_id = ?1",
            params![repo_id],
            |row| row.get(0),
        )?;

        let inserted = tx.execute(
            "INSERT INTO merge_requests (repo_id, local_id, creator, source_ref, status)
             VALUES (?1, ?2, ?3, ?4, 'open')",
            params![repo_id, local_id, creator, source_ref],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::DuplicateSourceRef {
                    source_ref: source_ref.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;
        Ok(local_id as u64)
    }

    fn find_merge_request(
        &self,
        repo_id: i64,
        source_ref: &str,
    ) -> Result<Option<MergeRequest>, StoreError> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT repo_id, local_id, creator, source_ref, dest_branch, status, title
                 FROM merge_requests WHERE repo_id = ?1 AND source_ref = ?2",
                params![repo_id, source_ref],
                row_to_merge_request,
            )
            .optional()?;
        Ok(found)
    }

    fn add_pubkey_user(&self, pubkey: &str) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (type, pubkey) VALUES (?1, ?2)",
            params![UserKind::PubkeyOnly.as_str(), pubkey],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn mark_user_federated(
        &self,
        user_id: i64,
        service: &str,
        remote_username: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownUser { user_id });
        }

        // Only a pubkey-only user is upgraded; registered users keep their
        // kind.
        tx.execute(
            "UPDATE users SET type = 'federated' WHERE id = ?1 AND type = 'pubkey_only'",
            params![user_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO federated_identities (user_id, service, remote_username)
             VALUES (?1, ?2, ?3)",
            params![user_id, service, remote_username],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_repo(policy: ContributionPolicy) -> (SqliteStore, i64) {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo_id = store.add_repo("demo", &["infra".to_owned()], policy).unwrap();
        (store, repo_id)
    }

    #[test]
    fn open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graft.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.add_repo("demo", &[], ContributionPolicy::Public).unwrap();
        }
        // Schema version check passes on reopen.
        let store = SqliteStore::open(&path).unwrap();
        let access = store.resolve_push_access(1, "").unwrap();
        assert_eq!(access.policy, ContributionPolicy::Public);
    }

    #[test]
    fn merge_request_local_ids_are_per_repo() {
        let (store, repo_a) = store_with_repo(ContributionPolicy::Public);
        let repo_b = store.add_repo("other", &[], ContributionPolicy::Public).unwrap();

        assert_eq!(
            store.create_merge_request(repo_a, None, "contrib/a").unwrap(),
            1
        );
        assert_eq!(
            store.create_merge_request(repo_a, None, "contrib/b").unwrap(),
            2
        );
        assert_eq!(
            store.create_merge_request(repo_b, None, "contrib/a").unwrap(),
            1
        );
    }

    #[test]
    fn duplicate_source_ref_rejected_by_constraint() {
        let (store, repo_id) = store_with_repo(ContributionPolicy::Public);
        store
            .create_merge_request(repo_id, Some(1), "contrib/foo")
            .unwrap();
        let err = store
            .create_merge_request(repo_id, Some(2), "contrib/foo")
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSourceRef { .. }));
    }

    #[test]
    fn find_merge_request_roundtrip() {
        let (store, repo_id) = store_with_repo(ContributionPolicy::Public);
        let user = store.add_user(UserKind::Registered, Some("ssh-ed25519 AAAA")).unwrap();
        store
            .create_merge_request(repo_id, Some(user), "contrib/foo")
            .unwrap();

        let mr = store
            .find_merge_request(repo_id, "contrib/foo")
            .unwrap()
            .unwrap();
        assert_eq!(mr.creator, Some(user));
        assert_eq!(mr.status, "open");
        assert_eq!(mr.local_id, 1);

        assert!(store
            .find_merge_request(repo_id, "contrib/none")
            .unwrap()
            .is_none());
    }

    #[test]
    fn anonymous_creator_is_null_not_zero() {
        let (store, repo_id) = store_with_repo(ContributionPolicy::Public);
        store
            .create_merge_request(repo_id, None, "contrib/anon")
            .unwrap();
        let mr = store
            .find_merge_request(repo_id, "contrib/anon")
            .unwrap()
            .unwrap();
        assert_eq!(mr.creator, None);
    }

    #[test]
    fn resolve_push_access_paths() {
        let (store, repo_id) = store_with_repo(ContributionPolicy::Federated);
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample user@host";
        let user = store.add_user(UserKind::Registered, Some(key)).unwrap();

        // Unknown key: no user, no direct access.
        let access = store.resolve_push_access(repo_id, "ssh-rsa BBBB").unwrap();
        assert_eq!(access.user_id, None);
        assert_eq!(access.user_kind, UserKind::Unknown);
        assert!(!access.direct_access);
        assert_eq!(access.policy, ContributionPolicy::Federated);

        // Known key without a maintainer grant.
        let access = store.resolve_push_access(repo_id, key).unwrap();
        assert_eq!(access.user_id, Some(user));
        assert_eq!(access.user_kind, UserKind::Registered);
        assert!(!access.direct_access);

        // Maintainer grant flips direct access.
        store.add_maintainer(repo_id, user).unwrap();
        let access = store.resolve_push_access(repo_id, key).unwrap();
        assert!(access.direct_access);

        // Unknown repo is an error, not a miss.
        assert!(matches!(
            store.resolve_push_access(9999, key),
            Err(StoreError::UnknownRepo { .. })
        ));
    }

    #[test]
    fn federation_upgrade_only_touches_pubkey_only_users() {
        let (store, _) = store_with_repo(ContributionPolicy::Public);
        let pubkey_user = store.add_pubkey_user("ssh-ed25519 KEY1").unwrap();
        let registered = store.add_user(UserKind::Registered, Some("ssh-ed25519 KEY2")).unwrap();

        store
            .mark_user_federated(pubkey_user, "codeberg", "alice")
            .unwrap();
        store
            .mark_user_federated(registered, "codeberg", "bob")
            .unwrap();

        let access = store.resolve_push_access(1, "ssh-ed25519 KEY1").unwrap();
        assert_eq!(access.user_kind, UserKind::Federated);
        let access = store.resolve_push_access(1, "ssh-ed25519 KEY2").unwrap();
        assert_eq!(access.user_kind, UserKind::Registered);

        assert!(matches!(
            store.mark_user_federated(9999, "codeberg", "carol"),
            Err(StoreError::UnknownUser { .. })
        ));
    }
}
