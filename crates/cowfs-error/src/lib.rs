#![forbid(unsafe_code)]
//! Error types for cowfs.
//!
//! # Error Taxonomy
//!
//! cowfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cowfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `CowfsError` | `cowfs-error` (this crate) | Errors returned by the object store and container API |
//!
//! ## Mapping Policy: ParseError → CowfsError
//!
//! `cowfs-error` does not depend on `cowfs-types`. The conversion is done in
//! `cowfs-btree`, which knows the block being parsed: every `ParseError`
//! raised while reading a live object becomes `Corruption { block, detail }`.
//!
//! ## Failure classes
//!
//! | Class | Variant | Retried? |
//! |-------|---------|----------|
//! | Structural invariant broken | `Corruption` | never |
//! | Stored checksum does not match | `ChecksumMismatch` | never |
//! | Lookup miss on an optional record | `NotFound` | n/a (normal outcome) |
//! | Space exhausted | `NoSpace` | caller aborts the transaction |
//! | Feature not implemented | `Unsupported` | never |
//!
//! A lookup miss on a record that must exist (an object-map entry for a live
//! virtual object, a checkpoint mapping for a live ephemeral object) is
//! reported as `Corruption`, not `NotFound`.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CowfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `ChecksumMismatch` | `EBADMSG` |
//! | `Format` / `Parse` | `EINVAL` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENODATA` |
//! | `Exists` | `EEXIST` |
//! | `RecordTooLarge` | `EOVERFLOW` |
//! | `ReadOnly` | `EROFS` |
//! | `NoTransaction` / `TransactionActive` | `EBUSY` |

use thiserror::Error;

/// Unified error type for all cowfs operations.
#[derive(Debug, Error)]
pub enum CowfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Raised for bad index records, tree-info inconsistencies, an exceeded
    /// descent depth, or a missing mandatory mapping.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The checksum stored in an object header does not match its contents.
    ///
    /// Treated like `Corruption` by every caller, kept separate for
    /// diagnostics.
    #[error("checksum mismatch at block {block}")]
    ChecksumMismatch { block: u64 },

    /// Invalid container geometry or malformed caller input.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// A path that is not implemented (e.g. multi-block checkpoint maps).
    ///
    /// Surfaced distinctly so callers can fail instead of silently
    /// truncating data.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No free blocks available.
    #[error("no space left on device")]
    NoSpace,

    /// An optional record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists.
    #[error("record exists")]
    Exists,

    /// A record cannot fit in an empty node.
    #[error("record of {size} bytes exceeds the node limit of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// The device is read-only and a write was attempted.
    #[error("read-only container")]
    ReadOnly,

    /// A mutation was attempted outside of a transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// A transaction was started while another one is in flight.
    #[error("a transaction is already in progress")]
    TransactionActive,
}

impl CowfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::ChecksumMismatch { .. } => libc::EBADMSG,
            Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENODATA,
            Self::Exists => libc::EEXIST,
            Self::RecordTooLarge { .. } => libc::EOVERFLOW,
            Self::ReadOnly => libc::EROFS,
            Self::NoTransaction | Self::TransactionActive => libc::EBUSY,
        }
    }

    /// Whether this error reports damaged on-disk state.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::ChecksumMismatch { .. })
    }
}

/// Result alias using `CowfsError`.
pub type Result<T> = std::result::Result<T, CowfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CowfsError, libc::c_int)> = vec![
            (CowfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CowfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (CowfsError::ChecksumMismatch { block: 3 }, libc::EBADMSG),
            (CowfsError::Format("test".into()), libc::EINVAL),
            (CowfsError::Parse("test".into()), libc::EINVAL),
            (CowfsError::Unsupported("cpm".into()), libc::EOPNOTSUPP),
            (CowfsError::NoSpace, libc::ENOSPC),
            (CowfsError::NotFound("test".into()), libc::ENODATA),
            (CowfsError::Exists, libc::EEXIST),
            (
                CowfsError::RecordTooLarge {
                    size: 9000,
                    max: 4000,
                },
                libc::EOVERFLOW,
            ),
            (CowfsError::ReadOnly, libc::EROFS),
            (CowfsError::NoTransaction, libc::EBUSY),
            (CowfsError::TransactionActive, libc::EBUSY),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(CowfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn checksum_mismatch_counts_as_corruption() {
        assert!(CowfsError::ChecksumMismatch { block: 1 }.is_corruption());
        assert!(
            CowfsError::Corruption {
                block: 1,
                detail: "x".into()
            }
            .is_corruption()
        );
        assert!(!CowfsError::NoSpace.is_corruption());
        assert!(!CowfsError::NotFound("k".into()).is_corruption());
    }

    #[test]
    fn display_formatting() {
        let err = CowfsError::Corruption {
            block: 42,
            detail: "b-tree depth exceeded".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: b-tree depth exceeded"
        );
        assert_eq!(
            CowfsError::ChecksumMismatch { block: 7 }.to_string(),
            "checksum mismatch at block 7"
        );
        assert_eq!(
            CowfsError::Unsupported("multiple checkpoint-mapping blocks".into()).to_string(),
            "unsupported operation: multiple checkpoint-mapping blocks"
        );
    }
}
