//! # Deterministic Id Derivation
//!
//! Both identifiers are hex-encoded SHA-256 over the UTF-8 fields joined
//! with a literal `::`:
//!
//! ```text
//! version_group_key = sha256_hex("{sender}::{receiver}::{dispatched_at}")
//! consignment_id    = sha256_hex("{sender}::{receiver}::{dispatched_at}::{version}")
//! ```
//!
//! `dispatched_at` is [`DispatchTimestamp::id_form`], which omits zero
//! seconds and a zero fraction (`2024-01-01T10:00`). Organisation ids
//! cannot contain `::`, and the timestamp and version never do, so the
//! joined input is unambiguous.

use sha2::{Digest, Sha256};

use crate::error::IntegrityError;
use crate::identity::{ConsignmentId, OrganisationId, VersionGroupKey};
use crate::temporal::DispatchTimestamp;

/// Field separator in the digest input.
pub const ID_SEPARATOR: &str = "::";

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn group_input(
    sender: &OrganisationId,
    receiver: &OrganisationId,
    dispatched_at: &DispatchTimestamp,
) -> String {
    [
        sender.as_str(),
        receiver.as_str(),
        dispatched_at.id_form().as_str(),
    ]
    .join(ID_SEPARATOR)
}

/// Key shared by every version of one logical consignment.
pub fn derive_version_group_key(
    sender: &OrganisationId,
    receiver: &OrganisationId,
    dispatched_at: &DispatchTimestamp,
) -> VersionGroupKey {
    let input = group_input(sender, receiver, dispatched_at);
    VersionGroupKey::from_digest_hex(sha256_hex(input.as_bytes()))
}

/// Id of one specific version of a consignment.
pub fn derive_consignment_id(
    sender: &OrganisationId,
    receiver: &OrganisationId,
    dispatched_at: &DispatchTimestamp,
    version: u32,
) -> ConsignmentId {
    let input = format!(
        "{}{ID_SEPARATOR}{version}",
        group_input(sender, receiver, dispatched_at)
    );
    ConsignmentId::from_digest_hex(sha256_hex(input.as_bytes()))
}

/// Recompute the id for `version` and compare it with a declared one.
///
/// A mismatch is an integrity failure: the declared id was produced from
/// different fields than the ones it travels with.
pub fn verify_declared_id(
    declared: &str,
    sender: &OrganisationId,
    receiver: &OrganisationId,
    dispatched_at: &DispatchTimestamp,
    version: u32,
) -> Result<ConsignmentId, IntegrityError> {
    let computed = derive_consignment_id(sender, receiver, dispatched_at, version);
    if computed.as_str() != declared {
        return Err(IntegrityError::IdMismatch {
            declared: declared.to_string(),
            computed: computed.to_string(),
            version_group_key: derive_version_group_key(sender, receiver, dispatched_at)
                .to_string(),
            version,
        });
    }
    Ok(computed)
}
