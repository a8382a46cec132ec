// crates/envelope-config/tests/registry.rs
// ============================================================================
// Module: Driver Registry Integration Tests
// Description: Registry loading against real directory fixtures.
// Purpose: Verify lookup layout, extends composition, caching, and errors.
// Dependencies: envelope-config, envelope-core, tempfile
// ============================================================================

//! Registry tests against temporary driver roots: versioned and flat
//! layouts, `extends` composition across files, circular chains, load-time
//! rule validation, and cache identity.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::missing_docs_in_private_items,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use envelope_config::DriverError;
use envelope_config::DriverRegistry;
use envelope_core::DriverId;
use envelope_core::DriverKey;
use envelope_core::DriverVersion;
use tempfile::TempDir;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

const CASH_V1: &str = r"
driver:
  id: voucher.cash
  version: 1.0.0
  title: Cash voucher
documents:
  registry:
    - type: SELFIE
      mimes: [image/jpeg]
signals:
  definitions:
    - key: approved
      category: decision
gates:
  definitions:
    - key: docs_ready
      rule: checklist.required_accepted
    - key: settleable
      rule: gate.docs_ready && signal.approved
";

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn id(value: &str) -> DriverId {
    DriverId::new(value)
}

fn version(value: &str) -> DriverVersion {
    DriverVersion::new(value)
}

// ============================================================================
// SECTION: Lookup
// ============================================================================

#[test]
fn loads_versioned_layout() {
    let root = TempDir::new().unwrap();
    write(root.path(), "voucher.cash/v1.0.0.yaml", CASH_V1);

    let registry = DriverRegistry::new(root.path());
    let driver = registry.load(&id("voucher.cash"), &version("1.0.0")).unwrap();
    assert_eq!(driver.title.as_deref(), Some("Cash voucher"));
    assert_eq!(driver.gates.len(), 2);
}

#[test]
fn falls_back_to_flat_layout() {
    let root = TempDir::new().unwrap();
    write(root.path(), "voucher.cash.yaml", CASH_V1);

    let registry = DriverRegistry::new(root.path());
    let driver = registry.load(&id("voucher.cash"), &version("1.0.0")).unwrap();
    assert_eq!(driver.key(), DriverKey::new(id("voucher.cash"), version("1.0.0")));
}

#[test]
fn unknown_driver_is_not_found() {
    let root = TempDir::new().unwrap();
    let registry = DriverRegistry::new(root.path());
    let err = registry.load(&id("missing"), &version("1.0.0")).unwrap_err();
    assert!(matches!(err, DriverError::NotFound { .. }));
}

#[test]
fn lists_available_drivers() {
    let root = TempDir::new().unwrap();
    write(root.path(), "voucher.cash/v1.0.0.yaml", CASH_V1);
    write(
        root.path(),
        "voucher.cash/v2.0.0.yaml",
        &CASH_V1.replace("1.0.0", "2.0.0"),
    );
    write(
        root.path(),
        "voucher.goods.yaml",
        &CASH_V1.replace("voucher.cash", "voucher.goods"),
    );

    let registry = DriverRegistry::new(root.path());
    let keys = registry.list();
    assert_eq!(
        keys,
        vec![
            DriverKey::new(id("voucher.cash"), version("1.0.0")),
            DriverKey::new(id("voucher.cash"), version("2.0.0")),
            DriverKey::new(id("voucher.goods"), version("1.0.0")),
        ]
    );
}

// ============================================================================
// SECTION: Composition
// ============================================================================

#[test]
fn extends_merges_parent_sections() {
    let root = TempDir::new().unwrap();
    write(root.path(), "voucher.base/v1.0.0.yaml", CASH_V1.replace("voucher.cash", "voucher.base").as_str());
    write(
        root.path(),
        "voucher.cash/v2.0.0.yaml",
        r"
driver:
  id: voucher.cash
  version: 2.0.0
extends: ['voucher.base@1.0.0']
documents:
  registry:
    - type: SELFIE
      mimes: [image/jpeg, image/png]
    - type: RECEIPT
",
    );

    let registry = DriverRegistry::new(root.path());
    let driver = registry.load(&id("voucher.cash"), &version("2.0.0")).unwrap();
    assert_eq!(driver.id.as_str(), "voucher.cash");
    assert_eq!(driver.version.as_str(), "2.0.0");
    // Overlay replaced SELFIE and appended RECEIPT; gates came from the parent.
    assert_eq!(driver.documents.len(), 2);
    assert_eq!(driver.documents[0].allowed_mimes.len(), 2);
    assert_eq!(driver.gates.len(), 2);
}

#[test]
fn circular_extends_is_a_load_error() {
    let root = TempDir::new().unwrap();
    write(
        root.path(),
        "a/v1.yaml",
        "driver: { id: a, version: '1' }\nextends: ['b@1']\n",
    );
    write(
        root.path(),
        "b/v1.yaml",
        "driver: { id: b, version: '1' }\nextends: ['a@1']\n",
    );

    let registry = DriverRegistry::new(root.path());
    let err = registry.load(&id("a"), &version("1")).unwrap_err();
    assert!(matches!(err, DriverError::CircularExtends { .. }));
}

// ============================================================================
// SECTION: Validation and Caching
// ============================================================================

#[test]
fn malformed_rule_fails_at_load_time() {
    let root = TempDir::new().unwrap();
    write(
        root.path(),
        "voucher.cash/v1.0.0.yaml",
        r"
driver: { id: voucher.cash, version: 1.0.0 }
gates:
  definitions:
    - key: broken
      rule: '(payload.valid'
",
    );

    let registry = DriverRegistry::new(root.path());
    let err = registry.load(&id("voucher.cash"), &version("1.0.0")).unwrap_err();
    assert!(matches!(err, DriverError::MalformedRule { .. }));
}

#[test]
fn cache_returns_the_same_snapshot() {
    let root = TempDir::new().unwrap();
    write(root.path(), "voucher.cash/v1.0.0.yaml", CASH_V1);

    let registry = DriverRegistry::new(root.path());
    let first = registry.load(&id("voucher.cash"), &version("1.0.0")).unwrap();

    // Even a deleted file keeps serving from the cache.
    fs::remove_file(root.path().join("voucher.cash/v1.0.0.yaml")).unwrap();
    let second = registry.load(&id("voucher.cash"), &version("1.0.0")).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}
