//! Driver error types.
//!
//! All errors in `libklc` are represented by the [`CsiError`] enum, which
//! derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel inside a
//! [`CsiMessage`](crate::message::CsiMessage) across the socket transport.
//!
//! Every variant classifies onto a status [`Code`].  Callers retry on
//! [`Code::Unavailable`]; the driver itself never retries.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status classification of a [`CsiError`].
///
/// A subset of the gRPC status codes, restricted to the kinds this driver
/// can actually produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// A required request field is missing or malformed.
    InvalidArgument,
    /// The volume or attachment record is absent.
    NotFound,
    /// No free device slot is left on the node.
    ResourceExhausted,
    /// The volume is published to a different node.
    FailedPrecondition,
    /// An external tool or transport failed; retryable.
    Unavailable,
    /// The operation is not supported by this driver.
    Unimplemented,
    /// Malformed external tool output or an unexpected local failure.
    Internal,
}

impl Code {
    /// Whether a caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Code::Unavailable)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::InvalidArgument => "InvalidArgument",
            Code::NotFound => "NotFound",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Unavailable => "Unavailable",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Unified error type for driver operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// Malformed request: empty identifier, bad slot name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// No attachment record exists for the volume.
    #[error("no attachment record for volume {0}")]
    RecordNotFound(String),

    /// Every device slot on the node is taken.
    #[error("no free device slot on node {node_id} ({slots} slots in use)")]
    ResourceExhausted {
        /// Node whose slots are exhausted.
        node_id: String,
        /// Size of the slot alphabet.
        slots: usize,
    },

    /// The volume is already published to another node.
    #[error("volume {volume_id} is already published to node {node_id}")]
    AlreadyPublished {
        /// Volume being published.
        volume_id: String,
        /// Node currently holding the attachment record.
        node_id: String,
    },

    /// An external tool is missing or its invocation failed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation is deliberately not supported.
    #[error("unsupported operation: {0}")]
    Unimplemented(String),

    /// Binding a device onto a target path failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        path: String,
        reason: String,
    },

    /// Unmounting or cleaning up a target path failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        path: String,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Classify this error onto the status taxonomy.
    #[must_use]
    pub const fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::VolumeNotFound(_) | Self::RecordNotFound(_) => Code::NotFound,
            Self::ResourceExhausted { .. } => Code::ResourceExhausted,
            Self::AlreadyPublished { .. } => Code::FailedPrecondition,
            Self::Unavailable(_) => Code::Unavailable,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. } | Self::UnmountFailed { .. } | Self::Internal(_) => {
                Code::Internal
            }
        }
    }

    /// Create a [`CsiError::Unavailable`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn unavailable<E: fmt::Display>(e: E) -> Self {
        Self::Unavailable(e.to_string())
    }

    /// Wrap any displayable error as [`CsiError::Internal`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::Unimplemented`] naming the rejected operation.
    pub fn unimplemented(operation: &str) -> Self {
        Self::Unimplemented(operation.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(
            CsiError::RecordNotFound("v".into()).code(),
            Code::NotFound
        );
        assert_eq!(
            CsiError::ResourceExhausted {
                node_id: "n".into(),
                slots: 24
            }
            .code(),
            Code::ResourceExhausted
        );
        assert_eq!(
            CsiError::MountFailed {
                path: "/mnt".into(),
                reason: "EBUSY".into()
            }
            .code(),
            Code::Internal
        );
        assert_eq!(
            CsiError::unimplemented("CreateSnapshot").code(),
            Code::Unimplemented
        );
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(CsiError::unavailable("virsh exited 1").code().is_retryable());
        assert!(!CsiError::internal("bad json").code().is_retryable());
    }

    #[test]
    fn unsupported_is_distinct_from_internal() {
        let err = CsiError::unimplemented("ListSnapshots");
        assert_eq!(err.to_string(), "unsupported operation: ListSnapshots");
        assert_ne!(err.code(), CsiError::internal("x").code());
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::AlreadyPublished {
            volume_id: "data1".into(),
            node_id: "node-a".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
