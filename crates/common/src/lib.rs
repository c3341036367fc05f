// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod limits;
pub mod process_utils;
pub mod runtime;

pub use config::{load_config, resolve_config_path, FleetConfig};
pub use runtime::{default_runtime_dir, ControlLock, PidMarker, RuntimeDir};
