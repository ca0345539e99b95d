//! Federated-identity verification.
//!
//! A repository with a `federated` contribution policy accepts pushers who
//! can prove an identity on a known external service. The pusher supplies
//! `fedid=<service>:<username>` as a push option; verification fetches the
//! service's published SSH key list for that username and checks that the
//! pusher's key appears on it. On success the user is marked `federated`
//! in the record store and the identity is recorded, atomically.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{RecordStore, StoreError};

/// Errors produced by federation checks.
#[derive(Debug, Error)]
pub enum FedAuthError {
    /// The named service is not one of the known key-list providers.
    #[error("unknown federated service {service:?}")]
    UnknownService {
        /// Service name as supplied by the pusher.
        service: String,
    },

    /// The remote username contains characters outside the safe set.
    #[error("invalid remote username {username:?}")]
    InvalidUsername {
        /// Username as supplied by the pusher.
        username: String,
    },

    /// The key list could not be fetched.
    #[error("key list fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The record store rejected the federation upgrade.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Out-of-band verification of a federated identity claim.
#[async_trait]
pub trait FederationVerifier: Send + Sync {
    /// Checks whether `pubkey` is published under `remote_username` on
    /// `service`; on a match, records the identity for `user_id`.
    ///
    /// Returns `Ok(false)` when the key is simply not on the list.
    ///
    /// # Errors
    ///
    /// Returns [`FedAuthError`] for malformed claims, fetch failures, or
    /// store failures.
    async fn verify(
        &self,
        user_id: Option<i64>,
        service: &str,
        remote_username: &str,
        pubkey: &str,
    ) -> Result<bool, FedAuthError>;
}

/// Returns whether `pubkey` appears in a fetched key list.
///
/// Only the first two whitespace-separated fields of each line count (key
/// type and key material); trailing comments on either side are ignored.
#[must_use]
pub fn key_list_contains(key_list: &str, pubkey: &str) -> bool {
    let needle = normalize_key(pubkey);
    if needle.is_empty() {
        return false;
    }
    key_list
        .lines()
        .any(|line| normalize_key(line) == needle)
}

fn normalize_key(line: &str) -> String {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(kind), Some(material)) => format!("{kind} {material}"),
        _ => String::new(),
    }
}

fn validate_username(username: &str) -> Result<(), FedAuthError> {
    let ok = !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if ok {
        Ok(())
    } else {
        Err(FedAuthError::InvalidUsername {
            username: username.to_owned(),
        })
    }
}

/// URL of the published key list for a username on a service.
///
/// # Errors
///
/// Returns [`FedAuthError::UnknownService`] for anything but the known
/// providers, and [`FedAuthError::InvalidUsername`] when the username
/// cannot be safely placed in a URL path.
pub fn key_list_url(service: &str, username: &str) -> Result<String, FedAuthError> {
    validate_username(username)?;
    match service {
        "sr.ht" => Ok(format!("https://meta.sr.ht/~{username}.keys")),
        "github" => Ok(format!("https://github.com/{username}.keys")),
        "codeberg" => Ok(format!("https://codeberg.org/{username}.keys")),
        "tangled" => Ok(format!("https://tangled.sh/keys/{username}")),
        other => Err(FedAuthError::UnknownService {
            service: other.to_owned(),
        }),
    }
}

/// Verifier that fetches key lists over HTTPS.
pub struct HttpFederationVerifier {
    http: reqwest::Client,
    store: Arc<dyn RecordStore>,
}

impl HttpFederationVerifier {
    /// Creates a verifier recording successes into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
        }
    }
}

#[async_trait]
impl FederationVerifier for HttpFederationVerifier {
    async fn verify(
        &self,
        user_id: Option<i64>,
        service: &str,
        remote_username: &str,
        pubkey: &str,
    ) -> Result<bool, FedAuthError> {
        let url = key_list_url(service, remote_username)?;
        debug!(%url, "fetching federated key list");
        let body = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if !key_list_contains(&body, pubkey) {
            return Ok(false);
        }

        if let Some(user_id) = user_id {
            self.store
                .mark_user_federated(user_id, service, remote_username)?;
            info!(user_id, service, remote_username, "user federated");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExampleKeyMaterial user@host";

    #[test]
    fn key_match_ignores_comments() {
        let list = "ssh-rsa OTHER someone@else\n\
                    ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExampleKeyMaterial another-comment\n";
        assert!(key_list_contains(list, KEY));
    }

    #[test]
    fn key_match_requires_both_fields() {
        assert!(!key_list_contains("ssh-ed25519\n", KEY));
        assert!(!key_list_contains("", KEY));
        assert!(!key_list_contains("ssh-ed25519 DIFFERENT\n", KEY));
    }

    #[test]
    fn malformed_pubkey_never_matches() {
        assert!(!key_list_contains("anything at all\n", ""));
        assert!(!key_list_contains("ssh-ed25519 AAAA\n", "just-one-field"));
    }

    #[test]
    fn url_mapping_per_service() {
        assert_eq!(
            key_list_url("sr.ht", "alice").unwrap(),
            "https://meta.sr.ht/~alice.keys"
        );
        assert_eq!(
            key_list_url("github", "alice").unwrap(),
            "https://github.com/alice.keys"
        );
        assert_eq!(
            key_list_url("codeberg", "alice").unwrap(),
            "https://codeberg.org/alice.keys"
        );
        assert_eq!(
            key_list_url("tangled", "alice").unwrap(),
            "https://tangled.sh/keys/alice"
        );
        assert!(matches!(
            key_list_url("example", "alice"),
            Err(FedAuthError::UnknownService { .. })
        ));
    }

    #[test]
    fn hostile_usernames_rejected() {
        assert!(matches!(
            key_list_url("github", "../evil"),
            Err(FedAuthError::InvalidUsername { .. })
        ));
        assert!(matches!(
            key_list_url("github", "a/b"),
            Err(FedAuthError::InvalidUsername { .. })
        ));
        assert!(matches!(
            key_list_url("github", ""),
            Err(FedAuthError::InvalidUsername { .. })
        ));
    }
}
