//! Sandbox module - Process isolation primitives
//!
//! This module provides the isolation mechanisms the runners build on:
//! - Execution limits and backend selection (`config`)
//! - Native confinement applied before exec: session, rlimits, namespaces
//! - Isolate box initialization, execution and cleanup
//! - Isolate meta file parsing
//!
//! The sandbox module does NOT:
//! - Interpret outcomes (that's the runner's job)
//! - Know about languages or test cases
//! - Compare outputs

pub mod config;
pub mod confine;
pub mod isolate_box;
pub mod meta;

// Re-exports for convenience
pub use config::{init_config, next_box_id, IsolationMode, SandboxBackend, SandboxConfig};
pub use confine::{jail_enabled, Confinement, Jail, JAIL_WORK_DIR};
pub use isolate_box::{ensure_isolate_available, is_cgroups_available, IsolateBox, Limits};
pub use meta::IsolateStatus;
