//! Session management module.
//!
//! This module provides interpreter spawning, the shared session registry, the
//! output pumps, idle eviction and the controller that ties them together.

pub mod controller;
pub mod monitor;
pub mod process;
pub mod pump;
pub mod registry;

pub use controller::SessionController;
pub use monitor::LivenessMonitor;
pub use process::{Session, SessionError, SessionStreams, ShellCommand};
pub use pump::{spawn_pump, spawn_session_pumps, OutputStream};
pub use registry::SessionRegistry;
