//! Error taxonomy for reconciliation sessions and the remote authority.

use serde::{Deserialize, Serialize};

use crate::types::{ActualMembership, GroupHandle, Identifier, MembershipSnapshot};

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// How a remote failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Timeouts, rate limiting, "not yet consistent". Retried.
    Transient,
    /// The referenced entity does not exist. Never retried.
    NotFound,
    /// Malformed request and everything else. Never retried.
    Permanent,
}

/// Error codes the authority uses for conditions that clear up on their own.
const TRANSIENT_CODES: &[&str] = &[
    "ClientError.NetworkError",
    "ClientError.HttpStatusCodeError",
    "InternalError",
    "RequestLimitExceeded",
    "ResourceInUse",
    "ResourceUnavailable",
    "FailedOperation.NotConsistent",
];

const NOT_FOUND_PREFIX: &str = "ResourceNotFound";

/// Classify an authority error code.
pub fn classify_code(code: &str) -> RemoteErrorKind {
    if code.starts_with(NOT_FOUND_PREFIX) {
        return RemoteErrorKind::NotFound;
    }
    let transient = TRANSIENT_CODES
        .iter()
        .any(|t| code == *t || code.starts_with(&format!("{}.", t)));
    if transient {
        RemoteErrorKind::Transient
    } else {
        RemoteErrorKind::Permanent
    }
}

/// A failure reported by (or on the way to) the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    /// Build an error whose kind is derived from the code.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let kind = classify_code(&code);
        RemoteError {
            code,
            message: message.into(),
            kind,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError {
            code: "InternalError".into(),
            message: message.into(),
            kind: RemoteErrorKind::Transient,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RemoteError {
            code: "ResourceNotFound.UserNotExist".into(),
            message: message.into(),
            kind: RemoteErrorKind::NotFound,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            code: code.into(),
            message: message.into(),
            kind: RemoteErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

// ---------------------------------------------------------------------------
// ReconcileError
// ---------------------------------------------------------------------------

/// Everything a reconciliation operation can fail with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    /// A transient remote failure outlived its retry budget.
    #[error("{op} still failing after {attempts} attempt(s): {source}")]
    Transient {
        op: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// A remote failure that retrying cannot fix.
    #[error("{op} failed: {source}")]
    Remote {
        op: String,
        #[source]
        source: RemoteError,
    },

    /// One or more names could not be resolved. The resolvable remainder has
    /// already been applied; `membership` is what the confirmatory read saw.
    #[error("group {group}: cannot resolve member(s): {}", .names.join(", "))]
    Unresolved {
        group: GroupHandle,
        names: Vec<String>,
        membership: Box<MembershipSnapshot>,
    },

    /// Invalid declaration, rejected before any remote call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The confirmatory read disagrees with what was applied.
    #[error(
        "group {}: membership diverged after apply ({} missing, {} unexpected)",
        .membership.group,
        .missing.len(),
        .unexpected.len()
    )]
    PartialApply {
        membership: ActualMembership,
        missing: Vec<Identifier>,
        unexpected: Vec<Identifier>,
    },

    /// The session deadline passed. Remote state is left as-is.
    #[error("{op} aborted: session deadline of {budget_ms}ms exceeded after {elapsed_ms}ms")]
    Timeout {
        op: String,
        elapsed_ms: u64,
        budget_ms: u64,
    },

    /// An operation was attempted from a lifecycle state that cannot reach it.
    #[error("illegal lifecycle transition: {0}")]
    Lifecycle(String),
}

impl ReconcileError {
    /// Errors after which simply re-running the operation may succeed.
    pub fn is_rerunnable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Transient { .. }
                | ReconcileError::Timeout { .. }
                | ReconcileError::PartialApply { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// SettingsError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_codes() {
        assert_eq!(classify_code("RequestLimitExceeded"), RemoteErrorKind::Transient);
        assert_eq!(
            classify_code("InternalError.DbError"),
            RemoteErrorKind::Transient
        );
        assert_eq!(
            classify_code("ResourceNotFound.UserNotExist"),
            RemoteErrorKind::NotFound
        );
        assert_eq!(
            classify_code("InvalidParameter.GroupIdError"),
            RemoteErrorKind::Permanent
        );
        // Prefix match only on whole segments.
        assert_eq!(classify_code("InternalErrorish"), RemoteErrorKind::Permanent);
    }

    #[test]
    fn from_code_sets_kind() {
        let e = RemoteError::from_code("ClientError.NetworkError", "reset by peer");
        assert!(e.is_transient());
        assert_eq!(e.to_string(), "[ClientError.NetworkError] reset by peer");
    }

    #[test]
    fn unresolved_lists_every_name() {
        let group = GroupHandle::new("7");
        let e = ReconcileError::Unresolved {
            group: group.clone(),
            names: vec!["ghost".into(), "phantom".into()],
            membership: Box::new(MembershipSnapshot {
                group: group.clone(),
                space: crate::types::MemberSpace::Name,
                members: Default::default(),
                actual: ActualMembership {
                    group,
                    members: Default::default(),
                },
                vacant: true,
            }),
        };
        assert_eq!(e.to_string(), "group 7: cannot resolve member(s): ghost, phantom");
        assert!(!e.is_rerunnable());
    }
}
