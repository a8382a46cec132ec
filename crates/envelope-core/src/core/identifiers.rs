// crates/envelope-core/src/core/identifiers.rs
// ============================================================================
// Module: Envelope Identifiers
// Description: Canonical opaque identifiers for drivers, envelopes, and evidence.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! This module defines the canonical identifiers used throughout the
//! settlement envelope engine. Identifiers are opaque UTF-8 strings that
//! serialize transparently on the wire. The composite [`DriverKey`] pins an
//! envelope to one immutable driver snapshot (`id@version`).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Declares an opaque string identifier with the standard constructors.
macro_rules! opaque_string_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        ///
        /// # Invariants
        /// - Opaque UTF-8 string; no normalization or validation is applied by this type.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

opaque_string_id! {
    /// Driver identifier (e.g. `voucher.cash-disbursement`).
    DriverId
}

opaque_string_id! {
    /// Driver version identifier (e.g. `1.0.0`).
    DriverVersion
}

opaque_string_id! {
    /// Envelope identifier assigned by the host when a case is opened.
    EnvelopeId
}

opaque_string_id! {
    /// Opaque external correlation identifier (e.g. a voucher code).
    ReferenceCode
}

opaque_string_id! {
    /// Checklist item key from the driver's checklist template.
    ChecklistKey
}

opaque_string_id! {
    /// Document type satisfied by attachments (e.g. `SELFIE`).
    DocType
}

opaque_string_id! {
    /// Signal key from the driver's signal definitions.
    SignalKey
}

opaque_string_id! {
    /// Gate key from the driver's gate definitions.
    GateKey
}

opaque_string_id! {
    /// Attachment identifier assigned at upload time.
    AttachmentId
}

impl GateKey {
    /// Reserved gate key consulted for the `ready_to_settle` transition.
    pub const SETTLEABLE: &'static str = "settleable";

    /// Returns true when this is the reserved `settleable` gate.
    #[must_use]
    pub fn is_settleable(&self) -> bool {
        self.as_str() == Self::SETTLEABLE
    }
}

// ============================================================================
// SECTION: Composite Driver Key
// ============================================================================

/// Composite driver key pinning an envelope to one driver snapshot.
///
/// # Invariants
/// - Serializes as `id@version`; both components are non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverKey {
    /// Driver identifier.
    id: DriverId,
    /// Driver version.
    version: DriverVersion,
}

impl DriverKey {
    /// Creates a new driver key.
    #[must_use]
    pub fn new(id: DriverId, version: DriverVersion) -> Self {
        Self {
            id,
            version,
        }
    }

    /// Returns the driver identifier.
    #[must_use]
    pub const fn id(&self) -> &DriverId {
        &self.id
    }

    /// Returns the driver version.
    #[must_use]
    pub const fn version(&self) -> &DriverVersion {
        &self.version
    }
}

impl fmt::Display for DriverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Error returned when a driver key string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverKeyParseError {
    /// The offending input.
    pub raw: String,
}

impl fmt::Display for DriverKeyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid driver key `{}` (expected `id@version`)", self.raw)
    }
}

impl std::error::Error for DriverKeyParseError {}

impl FromStr for DriverKey {
    type Err = DriverKeyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('@') {
            Some((id, version)) if !id.is_empty() && !version.is_empty() => {
                Ok(Self::new(DriverId::new(id), DriverVersion::new(version)))
            }
            _ => Err(DriverKeyParseError {
                raw: value.to_string(),
            }),
        }
    }
}

impl Serialize for DriverKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DriverKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::missing_docs_in_private_items,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use super::DriverKey;
    use super::GateKey;

    #[test]
    fn driver_key_round_trips_through_display() {
        let key: DriverKey = "voucher.cash@1.2.0".parse().unwrap();
        assert_eq!(key.id().as_str(), "voucher.cash");
        assert_eq!(key.version().as_str(), "1.2.0");
        assert_eq!(key.to_string(), "voucher.cash@1.2.0");
    }

    #[test]
    fn driver_key_rejects_missing_version() {
        assert!("voucher.cash".parse::<DriverKey>().is_err());
        assert!("@1.0.0".parse::<DriverKey>().is_err());
        assert!("voucher.cash@".parse::<DriverKey>().is_err());
    }

    #[test]
    fn settleable_gate_key_is_recognized() {
        assert!(GateKey::new("settleable").is_settleable());
        assert!(!GateKey::new("docs_ready").is_settleable());
    }
}
