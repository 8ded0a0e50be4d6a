//! # Identity Newtypes
//!
//! Organisation ids are supplied by upstream systems; consignment ids and
//! version group keys are SHA-256 digests derived in [`crate::digest`].
//! Keeping them as distinct types means a version group key can never be
//! passed where a consignment id is expected.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::digest::ID_SEPARATOR;
use crate::error::ValidationError;

/// Identifier of a sending or receiving organisation.
///
/// Non-empty and free of the `::` separator used by id derivation, which
/// keeps the joined digest input unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct OrganisationId(String);

impl OrganisationId {
    /// Validate and wrap an organisation identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ValidationError::EmptyIdentifier {
                kind: "organisation id",
            });
        }
        if raw.contains(ID_SEPARATOR) {
            return Err(ValidationError::ForbiddenSeparator {
                kind: "organisation id",
                value: raw,
            });
        }
        Ok(Self(raw))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganisationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for OrganisationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Parse an existing hex digest.
            ///
            /// Accepts exactly 64 lowercase hex characters.
            pub fn from_hex(raw: impl Into<String>) -> Result<Self, ValidationError> {
                let raw = raw.into();
                let well_formed = raw.len() == 64
                    && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
                if !well_formed {
                    return Err(ValidationError::MalformedDigest { kind: $kind, value: raw });
                }
                Ok(Self(raw))
            }

            pub(crate) fn from_digest_hex(hex: String) -> Self {
                Self(hex)
            }

            /// Borrow the hex digest.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::from_hex(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

digest_newtype!(
    /// Content-addressed id of one version of a consignment.
    ConsignmentId,
    "consignment id"
);

digest_newtype!(
    /// Groups every version of one logical consignment ("idControl").
    VersionGroupKey,
    "version group key"
);
