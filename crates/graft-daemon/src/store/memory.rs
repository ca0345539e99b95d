//! In-memory record store.
//!
//! Mirrors [`super::sqlite::SqliteStore`] semantics closely enough for
//! admission tests: the same uniqueness constraint on (repository, source
//! ref), the same per-repository numbering, the same federation upgrade
//! rule.

use std::collections::HashMap;
use std::sync::Mutex;

use graft_core::models::{ContributionPolicy, UserKind};

use super::{MergeRequest, PushAccess, RecordStore, StoreError};

#[derive(Default)]
struct Inner {
    next_user_id: i64,
    next_repo_id: i64,
    /// user id -> (kind, pubkey)
    users: HashMap<i64, (UserKind, Option<String>)>,
    /// repo id -> policy
    repos: HashMap<i64, ContributionPolicy>,
    /// (repo id, user id) maintainer grants
    maintainers: Vec<(i64, i64)>,
    /// (repo id, source ref) -> merge request
    merge_requests: HashMap<(i64, String), MergeRequest>,
    /// (user id, service) -> remote username
    federated: HashMap<(i64, String), String>,
}

/// Record store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository and returns its id.
    pub fn add_repo(&self, policy: ContributionPolicy) -> i64 {
        let mut inner = self.lock();
        inner.next_repo_id += 1;
        let id = inner.next_repo_id;
        inner.repos.insert(id, policy);
        id
    }

    /// Creates a user and returns its id.
    pub fn add_user(&self, kind: UserKind, pubkey: Option<&str>) -> i64 {
        let mut inner = self.lock();
        inner.next_user_id += 1;
        let id = inner.next_user_id;
        inner
            .users
            .insert(id, (kind, pubkey.map(ToOwned::to_owned)));
        id
    }

    /// Grants a user direct access to a repository.
    pub fn add_maintainer(&self, repo_id: i64, user_id: i64) {
        let mut inner = self.lock();
        if !inner.maintainers.contains(&(repo_id, user_id)) {
            inner.maintainers.push((repo_id, user_id));
        }
    }

    /// Number of merge requests across all repositories.
    #[must_use]
    pub fn merge_request_count(&self) -> usize {
        self.lock().merge_requests.len()
    }

    /// The federated identity recorded for a user on a service, if any.
    #[must_use]
    pub fn federated_identity(&self, user_id: i64, service: &str) -> Option<String> {
        self.lock()
            .federated
            .get(&(user_id, service.to_owned()))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

impl RecordStore for MemoryStore {
    fn resolve_push_access(&self, repo_id: i64, pubkey: &str) -> Result<PushAccess, StoreError> {
        let inner = self.lock();
        let policy = *inner
            .repos
            .get(&repo_id)
            .ok_or(StoreError::UnknownRepo { repo_id })?;

        let user = if pubkey.is_empty() {
            None
        } else {
            inner
                .users
                .iter()
                .find(|(_, (_, key))| key.as_deref() == Some(pubkey))
                .map(|(id, (kind, _))| (*id, *kind))
        };

        let (user_id, user_kind) = match user {
            Some((id, kind)) => (Some(id), kind),
            None => (None, UserKind::Unknown),
        };
        let direct_access = user_id
            .map(|id| inner.maintainers.contains(&(repo_id, id)))
            .unwrap_or(false);

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
        let mut inner = self.lock();
        let key = (repo_id, source_ref.to_owned());
        if inner.merge_requests.contains_key(&key) {
            return Err(StoreError::DuplicateSourceRef {
                source_ref: source_ref.to_owned(),
            });
        }
        let local_id = inner
            .merge_requests
            .values()
            .filter(|mr| mr.repo_id == repo_id)
            .map(|mr| mr.local_id)
            .max()
            .unwrap_or(0)
            + 1;
        inner.merge_requests.insert(
            key,
            MergeRequest {
                repo_id,
                local_id,
                creator,
                source_ref: source_ref.to_owned(),
                dest_branch: None,
                status: "open".to_owned(),
                title: None,
            },
        );
        Ok(local_id)
    }

    fn find_merge_request(
        &self,
        repo_id: i64,
        source_ref: &str,
    ) -> Result<Option<MergeRequest>, StoreError> {
        Ok(self
            .lock()
            .merge_requests
            .get(&(repo_id, source_ref.to_owned()))
            .cloned())
    }

    fn add_pubkey_user(&self, pubkey: &str) -> Result<i64, StoreError> {
        Ok(self.add_user(UserKind::PubkeyOnly, Some(pubkey)))
    }

    fn mark_user_federated(
        &self,
        user_id: i64,
        service: &str,
        remote_username: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some((kind, _)) = inner.users.get_mut(&user_id) else {
            return Err(StoreError::UnknownUser { user_id });
        };
        if *kind == UserKind::PubkeyOnly {
            *kind = UserKind::Federated;
        }
        inner.federated.insert(
            (user_id, service.to_owned()),
            remote_username.to_owned(),
        );
        Ok(())
    }
}
