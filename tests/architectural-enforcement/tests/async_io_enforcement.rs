//! Integration Test: Async I/O, No Sleep, No Panics
//!
//! The supervisor shares one runtime with every surface. A blocking call in
//! any of them stalls the agent's stream readers, so production code must:
//! - launch and talk to the agent through `tokio::process`
//! - use `tokio::net`, `tokio::fs` and `tokio::io` inside async functions
//! - wait on I/O or timers, never `std::thread::sleep`
//! - propagate errors instead of calling `unwrap()`/`expect()`

use std::fs;

use architectural_enforcement::{
    scan_production, workspace_root, Violation, BLOCKING_RULES, PANIC_RULES, PRODUCTION_DIRS,
};

fn report(title: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[test]
fn test_production_dirs_exist() {
    let root = workspace_root();
    for dir in PRODUCTION_DIRS {
        assert!(root.join(dir).is_dir(), "missing {dir}");
    }
}

#[test]
fn test_no_blocking_io_in_production_code() {
    report(
        "CRITICAL: Blocking I/O found in production code!",
        &scan_production(BLOCKING_RULES),
    );
}

#[test]
fn test_no_panicking_shortcuts_in_production_code() {
    report(
        "unwrap()/expect() found in production code!",
        &scan_production(PANIC_RULES),
    );
}

/// The core crate is UI-agnostic: no CLI or WebSocket dependencies
#[test]
fn test_core_has_no_surface_dependencies() {
    let manifest = fs::read_to_string(workspace_root().join("conductor/core/Cargo.toml")).unwrap();
    let dependencies = manifest
        .split("[dev-dependencies]")
        .next()
        .unwrap_or_default();

    for forbidden in ["clap", "tokio-tungstenite", "tracing-subscriber", "anyhow"] {
        assert!(
            !dependencies
                .lines()
                .any(|l| l.trim_start().starts_with(&format!("{forbidden} "))
                    || l.trim_start().starts_with(&format!("{forbidden}="))),
            "conductor/core must not depend on {forbidden}"
        );
    }
}
