//! Shared plumbing for the SceneMesh crates: logging setup, on-disk
//! locations and the framework-wide lock that guards calls into the
//! connection layer.

pub mod lock;
pub mod logging;
pub mod paths;

pub use lock::{FrameworkGuard, FrameworkLock};
