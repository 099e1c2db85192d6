//! testvm Core - Foundational Types
//!
//! This crate provides the types shared by the testvm runtime and CLI:
//! the error taxonomy, session configuration, the on-disk layout of a
//! session working directory, and lifecycle events.

pub mod config;
pub mod error;
pub mod event;
pub mod layout;

// Re-export commonly used types
pub use config::{Identities, LoginPolicy, ProgramConfig, ReadinessPolicy, SessionConfig};
pub use error::{Result, VmError};
pub use event::{EventEmitter, SessionEvent, SessionPhase};
pub use layout::SessionLayout;

/// testvm version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
