//! Shared domain model types.
//!
//! These enums mirror the string forms stored in the record store; the
//! conversions are lossless in both directions so admission decisions and
//! SQL rows agree on spelling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a pushing user is known to the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserKind {
    /// No user record; anonymous pushes under a `public` policy.
    Unknown,
    /// Auto-provisioned from an SSH public key, nothing else known.
    PubkeyOnly,
    /// A registered account.
    Registered,
    /// Identity verified against a federated service's published keys.
    Federated,
}

impl UserKind {
    /// Record-store string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::PubkeyOnly => "pubkey_only",
            Self::Registered => "registered",
            Self::Federated => "federated",
        }
    }

    /// Whether this kind satisfies a `federated` contribution policy
    /// without a fresh federation check.
    #[must_use]
    pub const fn is_trusted_for_federated(self) -> bool {
        matches!(self, Self::Federated | Self::Registered)
    }
}

impl std::str::FromStr for UserKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Unknown),
            "pubkey_only" => Ok(Self::PubkeyOnly),
            "registered" => Ok(Self::Registered),
            "federated" => Ok(Self::Federated),
            other => Err(UnknownVariant {
                what: "user kind",
                got: other.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for UserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may push contribution branches to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionPolicy {
    /// Anyone, including anonymous pushers.
    Public,
    /// Anyone presenting an SSH public key.
    SshPubkey,
    /// Federated or registered users only.
    Federated,
    /// Registered users only.
    RegisteredUser,
    /// Maintainers only.
    Closed,
}

impl ContributionPolicy {
    /// Record-store string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::SshPubkey => "ssh_pubkey",
            Self::Federated => "federated",
            Self::RegisteredUser => "registered_user",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for ContributionPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "ssh_pubkey" => Ok(Self::SshPubkey),
            "federated" => Ok(Self::Federated),
            "registered_user" => Ok(Self::RegisteredUser),
            "closed" => Ok(Self::Closed),
            other => Err(UnknownVariant {
                what: "contribution policy",
                got: other.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for ContributionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string did not match any known variant.
#[derive(Debug, Error)]
#[error("unknown {what}: {got:?}")]
pub struct UnknownVariant {
    what: &'static str,
    got: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_kind_string_forms_roundtrip() {
        for kind in [
            UserKind::Unknown,
            UserKind::PubkeyOnly,
            UserKind::Registered,
            UserKind::Federated,
        ] {
            assert_eq!(kind.as_str().parse::<UserKind>().unwrap(), kind);
        }
    }

    #[test]
    fn policy_string_forms_roundtrip() {
        for policy in [
            ContributionPolicy::Public,
            ContributionPolicy::SshPubkey,
            ContributionPolicy::Federated,
            ContributionPolicy::RegisteredUser,
            ContributionPolicy::Closed,
        ] {
            assert_eq!(
                policy.as_str().parse::<ContributionPolicy>().unwrap(),
                policy
            );
        }
    }

    #[test]
    fn federated_trust_covers_registered() {
        assert!(UserKind::Federated.is_trusted_for_federated());
        assert!(UserKind::Registered.is_trusted_for_federated());
        assert!(!UserKind::PubkeyOnly.is_trusted_for_federated());
        assert!(!UserKind::Unknown.is_trusted_for_federated());
    }

    #[test]
    fn unknown_strings_rejected() {
        assert!("maintainer".parse::<UserKind>().is_err());
        assert!("open".parse::<ContributionPolicy>().is_err());
    }
}
