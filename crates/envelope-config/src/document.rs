// crates/envelope-config/src/document.rs
// ============================================================================
// Module: Driver Documents
// Description: Raw YAML driver documents, composition, and validated build.
// Purpose: Parse, merge, and validate driver configuration into snapshots.
// Dependencies: envelope-core, gate-logic, serde, serde_yaml, thiserror
// ============================================================================

//! ## Overview
//! A [`DriverDocument`] is the deserialized form of one YAML driver file.
//! Documents compose through `extends`: parents merge in declaration order
//! and the overlay wins, with registry-style lists merged by key. The
//! validated [`build`](DriverDocument::build) step parses every gate rule,
//! checks every cross-reference, and produces the immutable
//! [`Driver`] snapshot the runtime consumes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;

use envelope_core::AuditConfig;
use envelope_core::ChecklistItemKind;
use envelope_core::ChecklistTemplateItem;
use envelope_core::DocType;
use envelope_core::DocumentType;
use envelope_core::Driver;
use envelope_core::DriverKey;
use envelope_core::FormFlowMapping;
use envelope_core::GateDef;
use envelope_core::GateKey;
use envelope_core::ManifestConfig;
use envelope_core::PayloadSchema;
use envelope_core::PayloadStorage;
use envelope_core::SignalDef;
use gate_logic::RuleParseError;
use gate_logic::parse_rule;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced while loading, composing, or validating drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No driver file exists for the requested key.
    #[error("driver `{key}` not found under the registry root")]
    NotFound {
        /// The requested driver key.
        key: DriverKey,
    },
    /// A driver file could not be read.
    #[error("failed to read driver file `{path}`")]
    Io {
        /// The offending file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A driver file is not valid YAML for the document shape.
    #[error("failed to parse driver file `{path}`")]
    Parse {
        /// The offending file path.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
    /// The document has no `driver` section with an id and version.
    #[error("driver `{key}` is missing its `driver` section")]
    MissingDriverSection {
        /// The requested driver key.
        key: DriverKey,
    },
    /// The document's declared id/version disagrees with its location.
    #[error("driver file for `{expected}` declares itself as `{declared}`")]
    KeyMismatch {
        /// The key derived from the file location.
        expected: DriverKey,
        /// The key declared inside the document.
        declared: DriverKey,
    },
    /// An `extends` reference is not a valid `id@version` key.
    #[error("invalid extends reference `{reference}`")]
    InvalidExtends {
        /// The offending reference string.
        reference: String,
    },
    /// The `extends` chain loops back on itself.
    #[error("circular extends chain: {chain}")]
    CircularExtends {
        /// The chain, rendered `a@1 -> b@1 -> a@1`.
        chain: String,
    },
    /// A gate rule failed to parse.
    #[error("gate `{gate}` has a malformed rule")]
    MalformedRule {
        /// The gate key.
        gate: String,
        /// Parser diagnostic.
        #[source]
        source: RuleParseError,
    },
    /// A gate rule references a signal the driver does not define.
    #[error("gate `{gate}` references undefined signal `{reference}`")]
    UnknownSignalReference {
        /// The gate key.
        gate: String,
        /// The dangling reference.
        reference: String,
    },
    /// A gate rule references a gate defined later (or not at all).
    #[error("gate `{gate}` references gate `{reference}` before it is defined")]
    ForwardGateReference {
        /// The gate key.
        gate: String,
        /// The referenced gate.
        reference: String,
    },
    /// A gate rule references a context name outside the known namespaces.
    #[error("gate `{gate}` references unknown context name `{reference}`")]
    UnknownContextReference {
        /// The gate key.
        gate: String,
        /// The dangling reference.
        reference: String,
    },
    /// A checklist item lacks the link its kind requires.
    #[error("checklist item `{key}` of kind `{kind}` is missing its `{link}` link")]
    ChecklistLinkMissing {
        /// The checklist key.
        key: String,
        /// The item kind.
        kind: &'static str,
        /// The missing link field.
        link: &'static str,
    },
    /// A checklist item or mapping references an unregistered document type.
    #[error("`{referrer}` references unregistered document type `{doc_type}`")]
    UnregisteredDocType {
        /// The checklist key or mapping entry doing the referencing.
        referrer: String,
        /// The unregistered document type.
        doc_type: String,
    },
    /// A checklist item links a signal the driver does not define.
    #[error("checklist item `{key}` links undefined signal `{signal}`")]
    UnknownSignalLink {
        /// The checklist key.
        key: String,
        /// The undefined signal.
        signal: String,
    },
}

// ============================================================================
// SECTION: Document Shape
// ============================================================================

/// Identity section of a driver document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriverSection {
    /// Driver identifier; required on the leaf document.
    #[serde(default)]
    pub id: Option<String>,
    /// Driver version; required on the leaf document.
    #[serde(default)]
    pub version: Option<String>,
    /// Human-readable title.
    #[serde(default)]
    pub title: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Payload section of a driver document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PayloadSection {
    /// Payload schema reference.
    #[serde(default)]
    pub schema: Option<PayloadSchema>,
    /// Payload write strategy.
    #[serde(default)]
    pub storage: Option<PayloadStorage>,
}

/// One entry of the document-type registry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DocumentEntry {
    /// Document type key.
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: Option<String>,
    /// Acceptable mime types; empty means any.
    #[serde(default, alias = "allowed_mimes")]
    pub mimes: Vec<String>,
    /// Maximum attachment size in megabytes.
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    /// Whether multiple attachments of this type may coexist.
    #[serde(default)]
    pub multiple: bool,
}

/// Documents section of a driver document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DocumentsSection {
    /// Registry of acceptable document types.
    #[serde(default)]
    pub registry: Vec<DocumentEntry>,
}

/// Checklist section of a driver document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChecklistSection {
    /// Checklist template entries.
    #[serde(default)]
    pub template: Vec<ChecklistTemplateItem>,
}

/// Signals section of a driver document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalsSection {
    /// Signal definitions.
    #[serde(default)]
    pub definitions: Vec<SignalDef>,
}

/// One gate entry: a key and an unparsed rule string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateEntry {
    /// Gate key.
    pub key: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: Option<String>,
    /// Rule source text; parsed at build time.
    pub rule: String,
}

/// Gates section of a driver document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GatesSection {
    /// Gate definitions in evaluation order.
    #[serde(default)]
    pub definitions: Vec<GateEntry>,
}

/// Raw deserialized driver document, before composition and validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriverDocument {
    /// Identity section.
    #[serde(default)]
    pub driver: Option<DriverSection>,
    /// Parent documents, merged in order before this one.
    #[serde(default)]
    pub extends: Vec<String>,
    /// Payload section.
    #[serde(default)]
    pub payload: Option<PayloadSection>,
    /// Documents section.
    #[serde(default)]
    pub documents: Option<DocumentsSection>,
    /// Checklist section.
    #[serde(default)]
    pub checklist: Option<ChecklistSection>,
    /// Signals section.
    #[serde(default)]
    pub signals: Option<SignalsSection>,
    /// Gates section.
    #[serde(default)]
    pub gates: Option<GatesSection>,
    /// Audit configuration.
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    /// Manifest configuration.
    #[serde(default)]
    pub manifest: Option<ManifestConfig>,
    /// Declarative form-flow mapping.
    #[serde(default)]
    pub form_flow_mapping: Option<FormFlowMapping>,
}

// ============================================================================
// SECTION: Composition
// ============================================================================

impl DriverDocument {
    /// Merges `overlay` onto `self`: overlay fields win, registry-style
    /// lists merge by key with replaced entries keeping their position.
    #[must_use]
    pub fn merged_with(mut self, overlay: Self) -> Self {
        self.driver = merge_driver_section(self.driver, overlay.driver);
        self.payload = merge_payload_section(self.payload, overlay.payload);
        self.documents = merge_keyed(
            self.documents,
            overlay.documents,
            |s| s.registry,
            |entries| DocumentsSection {
                registry: entries,
            },
            |e| e.doc_type.clone(),
        );
        self.checklist = merge_keyed(
            self.checklist,
            overlay.checklist,
            |s| s.template,
            |entries| ChecklistSection {
                template: entries,
            },
            |e| e.key.to_string(),
        );
        self.signals = merge_keyed(
            self.signals,
            overlay.signals,
            |s| s.definitions,
            |entries| SignalsSection {
                definitions: entries,
            },
            |e| e.key.to_string(),
        );
        self.gates = merge_keyed(
            self.gates,
            overlay.gates,
            |s| s.definitions,
            |entries| GatesSection {
                definitions: entries,
            },
            |e| e.key.clone(),
        );
        self.audit = overlay.audit.or(self.audit);
        self.manifest = overlay.manifest.or(self.manifest);
        self.form_flow_mapping = overlay.form_flow_mapping.or(self.form_flow_mapping);
        self.extends = Vec::new();
        self
    }
}

/// Overlays driver identity fields over the parent's.
fn merge_driver_section(
    base: Option<DriverSection>,
    overlay: Option<DriverSection>,
) -> Option<DriverSection> {
    match (base, overlay) {
        (Some(base), Some(overlay)) => Some(DriverSection {
            id: overlay.id.or(base.id),
            version: overlay.version.or(base.version),
            title: overlay.title.or(base.title),
            description: overlay.description.or(base.description),
        }),
        (base, overlay) => overlay.or(base),
    }
}

/// Overlays payload settings over the parent's.
fn merge_payload_section(
    base: Option<PayloadSection>,
    overlay: Option<PayloadSection>,
) -> Option<PayloadSection> {
    match (base, overlay) {
        (Some(base), Some(overlay)) => Some(PayloadSection {
            schema: overlay.schema.or(base.schema),
            storage: overlay.storage.or(base.storage),
        }),
        (base, overlay) => overlay.or(base),
    }
}

/// Merges keyed entries: overlay entries replace same-key parent entries
/// in place and append otherwise.
fn merge_keyed<S, E>(
    base: Option<S>,
    overlay: Option<S>,
    into_entries: impl Fn(S) -> Vec<E>,
    from_entries: impl Fn(Vec<E>) -> S,
    key_of: impl Fn(&E) -> String,
) -> Option<S> {
    match (base, overlay) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only),
        (Some(base), Some(overlay)) => {
            let mut merged = into_entries(base);
            for entry in into_entries(overlay) {
                let key = key_of(&entry);
                match merged.iter().position(|existing| key_of(existing) == key) {
                    Some(index) => merged[index] = entry,
                    None => merged.push(entry),
                }
            }
            Some(from_entries(merged))
        }
    }
}

// ============================================================================
// SECTION: Validated Build
// ============================================================================

/// Checklist aggregate names the rule context provides.
const CHECKLIST_AGGREGATES: [&str; 7] = [
    "required_present",
    "required_accepted",
    "all_accepted",
    "has_rejected",
    "total",
    "required_count",
    "pending_count",
];

impl DriverDocument {
    /// Validates the composed document and builds the immutable snapshot.
    ///
    /// # Errors
    /// Returns a [`DriverError`] naming the first malformed rule, dangling
    /// reference, or missing link found.
    pub fn build(self, expected: &DriverKey) -> Result<Driver, DriverError> {
        let Some(section) = self.driver else {
            return Err(DriverError::MissingDriverSection {
                key: expected.clone(),
            });
        };
        let (Some(id), Some(version)) = (section.id, section.version) else {
            return Err(DriverError::MissingDriverSection {
                key: expected.clone(),
            });
        };
        let declared = DriverKey::new(id.clone().into(), version.clone().into());
        if &declared != expected {
            return Err(DriverError::KeyMismatch {
                expected: expected.clone(),
                declared,
            });
        }

        let payload = self.payload.unwrap_or_default();
        let documents: Vec<DocumentType> = self
            .documents
            .unwrap_or_default()
            .registry
            .into_iter()
            .map(|entry| DocumentType {
                doc_type: DocType::new(entry.doc_type),
                label: entry.label,
                allowed_mimes: entry.mimes,
                max_size_mb: entry.max_size_mb,
                multiple: entry.multiple,
            })
            .collect();
        let checklist = self.checklist.unwrap_or_default().template;
        let signals = self.signals.unwrap_or_default().definitions;

        validate_checklist(&checklist, &documents, &signals)?;
        let gates = build_gates(self.gates.unwrap_or_default().definitions, &signals)?;

        if let Some(mapping) = &self.form_flow_mapping {
            for doc_type in mapping.attachments.keys() {
                if !documents.iter().any(|d| &d.doc_type == doc_type) {
                    return Err(DriverError::UnregisteredDocType {
                        referrer: "form_flow_mapping".to_string(),
                        doc_type: doc_type.to_string(),
                    });
                }
            }
        }

        Ok(Driver {
            id: id.into(),
            version: version.into(),
            title: section.title,
            description: section.description,
            payload_schema: payload.schema.unwrap_or_default(),
            payload_storage: payload.storage.unwrap_or_default(),
            documents,
            checklist,
            signals,
            gates,
            audit: self.audit.unwrap_or_default(),
            manifest: self.manifest.unwrap_or_default(),
            form_flow_mapping: self.form_flow_mapping,
        })
    }
}

/// Checks checklist template links against registered documents and
/// signal definitions.
fn validate_checklist(
    checklist: &[ChecklistTemplateItem],
    documents: &[DocumentType],
    signals: &[SignalDef],
) -> Result<(), DriverError> {
    for item in checklist {
        match item.kind {
            ChecklistItemKind::Document => {
                let Some(doc_type) = &item.doc_type else {
                    return Err(DriverError::ChecklistLinkMissing {
                        key: item.key.to_string(),
                        kind: "document",
                        link: "doc_type",
                    });
                };
                if !documents.iter().any(|d| &d.doc_type == doc_type) {
                    return Err(DriverError::UnregisteredDocType {
                        referrer: item.key.to_string(),
                        doc_type: doc_type.to_string(),
                    });
                }
            }
            ChecklistItemKind::PayloadField => {
                if item.pointer.is_none() {
                    return Err(DriverError::ChecklistLinkMissing {
                        key: item.key.to_string(),
                        kind: "payload_field",
                        link: "pointer",
                    });
                }
            }
            ChecklistItemKind::Signal => {
                let Some(signal) = &item.signal else {
                    return Err(DriverError::ChecklistLinkMissing {
                        key: item.key.to_string(),
                        kind: "signal",
                        link: "signal",
                    });
                };
                if !signals.iter().any(|s| &s.key == signal) {
                    return Err(DriverError::UnknownSignalLink {
                        key: item.key.to_string(),
                        signal: signal.to_string(),
                    });
                }
            }
            ChecklistItemKind::Attestation => {
                if item.attestation_type.is_none() {
                    return Err(DriverError::ChecklistLinkMissing {
                        key: item.key.to_string(),
                        kind: "attestation",
                        link: "attestation_type",
                    });
                }
            }
        }
    }
    Ok(())
}

/// Parses gate rules and validates every reference they make.
fn build_gates(
    entries: Vec<GateEntry>,
    signals: &[SignalDef],
) -> Result<Vec<GateDef>, DriverError> {
    let mut gates: Vec<GateDef> = Vec::with_capacity(entries.len());
    for entry in entries {
        let rule = parse_rule(&entry.rule).map_err(|source| DriverError::MalformedRule {
            gate: entry.key.clone(),
            source,
        })?;
        for reference in rule.references() {
            validate_reference(&entry.key, reference, signals, &gates)?;
        }
        gates.push(GateDef {
            key: GateKey::new(entry.key),
            label: entry.label,
            rule,
            source: entry.rule,
        });
    }
    Ok(gates)
}

/// Validates one rule reference against the allowed context namespaces.
fn validate_reference(
    gate: &str,
    reference: &str,
    signals: &[SignalDef],
    earlier: &[GateDef],
) -> Result<(), DriverError> {
    if let Some(name) = reference.strip_prefix("checklist.") {
        if CHECKLIST_AGGREGATES.contains(&name) {
            return Ok(());
        }
    } else if let Some(name) = reference.strip_prefix("signal.") {
        if signals.iter().any(|s| s.key.as_str() == name) {
            return Ok(());
        }
        return Err(DriverError::UnknownSignalReference {
            gate: gate.to_string(),
            reference: reference.to_string(),
        });
    } else if let Some(name) = reference.strip_prefix("gate.") {
        if earlier.iter().any(|g| g.key.as_str() == name) {
            return Ok(());
        }
        return Err(DriverError::ForwardGateReference {
            gate: gate.to_string(),
            reference: reference.to_string(),
        });
    } else if matches!(
        reference,
        "payload.valid" | "payload.version" | "envelope.status" | "envelope.payload_version"
    ) {
        return Ok(());
    }
    Err(DriverError::UnknownContextReference {
        gate: gate.to_string(),
        reference: reference.to_string(),
    })
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

    use envelope_core::DriverKey;
    use envelope_core::SignalCategory;

    use super::DriverDocument;
    use super::DriverError;

    fn parse(yaml: &str) -> DriverDocument {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn key() -> DriverKey {
        DriverKey::new("voucher.cash".into(), "1.0.0".into())
    }

    const BASE: &str = r"
driver:
  id: voucher.cash
  version: 1.0.0
documents:
  registry:
    - type: SELFIE
      mimes: [image/jpeg]
      max_size_mb: 5
signals:
  definitions:
    - key: approved
      category: decision
gates:
  definitions:
    - key: payload_valid
      rule: payload.valid
    - key: settleable
      rule: gate.payload_valid && signal.approved
";

    #[test]
    fn builds_a_valid_document() {
        let driver = parse(BASE).build(&key()).unwrap();
        assert_eq!(driver.key(), key());
        assert_eq!(driver.gates.len(), 2);
        assert_eq!(driver.gates[1].source, "gate.payload_valid && signal.approved");
    }

    #[test]
    fn malformed_rule_is_a_load_error() {
        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
gates:
  definitions:
    - key: broken
      rule: 'signal.approved &&'
",
        );
        assert!(matches!(
            doc.build(&key()),
            Err(DriverError::MalformedRule { .. })
        ));
    }

    #[test]
    fn forward_gate_reference_is_rejected() {
        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
gates:
  definitions:
    - key: first
      rule: gate.second
    - key: second
      rule: payload.valid
",
        );
        assert!(matches!(
            doc.build(&key()),
            Err(DriverError::ForwardGateReference { .. })
        ));
    }

    #[test]
    fn undefined_signal_reference_is_rejected() {
        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
gates:
  definitions:
    - key: odd
      rule: signal.never_declared
",
        );
        assert!(matches!(
            doc.build(&key()),
            Err(DriverError::UnknownSignalReference { .. })
        ));
    }

    #[test]
    fn checklist_links_are_validated() {
        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
checklist:
  template:
    - key: selfie
      kind: document
      doc_type: SELFIE
",
        );
        assert!(matches!(
            doc.build(&key()),
            Err(DriverError::UnregisteredDocType { .. })
        ));

        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
checklist:
  template:
    - key: name
      kind: payload_field
",
        );
        assert!(matches!(
            doc.build(&key()),
            Err(DriverError::ChecklistLinkMissing { .. })
        ));
    }

    #[test]
    fn attestation_item_requires_its_type_link() {
        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
checklist:
  template:
    - key: identity_confirmed
      kind: attestation
",
        );
        assert!(matches!(
            doc.build(&key()),
            Err(DriverError::ChecklistLinkMissing {
                kind: "attestation",
                link: "attestation_type",
                ..
            })
        ));

        let doc = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
checklist:
  template:
    - key: identity_confirmed
      kind: attestation
      attestation_type: payee_identity
",
        );
        assert!(doc.build(&key()).is_ok());
    }

    #[test]
    fn omitted_signal_category_defaults_to_decision() {
        let driver = parse(
            r"
driver: { id: voucher.cash, version: 1.0.0 }
signals:
  definitions:
    - key: approved
",
        )
        .build(&key())
        .unwrap();
        assert_eq!(driver.signals[0].category, SignalCategory::Decision);
    }

    #[test]
    fn merge_by_key_replaces_and_appends() {
        let base = parse(BASE);
        let overlay = parse(
            r"
driver:
  version: 2.0.0
documents:
  registry:
    - type: SELFIE
      mimes: [image/jpeg, image/png]
    - type: RECEIPT
gates:
  definitions:
    - key: settleable
      rule: gate.payload_valid
",
        );
        let merged = base.merged_with(overlay);
        let driver = merged
            .build(&DriverKey::new("voucher.cash".into(), "2.0.0".into()))
            .unwrap();
        assert_eq!(driver.documents.len(), 2);
        assert_eq!(driver.documents[0].allowed_mimes.len(), 2);
        // Replaced gate keeps its original position after payload_valid.
        assert_eq!(driver.gates[1].source, "gate.payload_valid");
    }

    #[test]
    fn declared_key_must_match_location() {
        let doc = parse(BASE);
        let err = doc
            .build(&DriverKey::new("voucher.cash".into(), "9.9.9".into()))
            .unwrap_err();
        assert!(matches!(err, DriverError::KeyMismatch { .. }));
    }
}
