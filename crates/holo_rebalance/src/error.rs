//! Fatal invariant violations.
//!
//! Ordinary failures travel as `anyhow::Error`. The variants below mark a
//! bug or misconfiguration rather than a transient fault: the control loop
//! that hits one stops instead of retrying. Callers can tell them apart with
//! `err.downcast_ref::<InvariantViolation>()`.

use thiserror::Error;

use crate::key::{PartitionId, RecordKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("transaction access set contains fully replicated key {0}")]
    FullyReplicatedKey(RecordKey),

    #[error(
        "location of {key} diverged during migration: found on partition {found}, \
         expected source {source_part} or destination {dest_part}"
    )]
    LocationDiverged {
        key: RecordKey,
        found: PartitionId,
        source_part: PartitionId,
        dest_part: PartitionId,
    },
}

/// Returns the invariant violation carried by `err`, if any.
pub fn as_invariant_violation(err: &anyhow::Error) -> Option<&InvariantViolation> {
    err.downcast_ref::<InvariantViolation>()
}
