//! # shellmux Daemon Library
//!
//! This crate runs interactive command interpreters on behalf of a remote
//! peer, multiplexed over a single packet connection.
//!
//! ## Overview
//!
//! - **Sessions**: one interpreter process per session, with piped standard
//!   streams, an activity clock and a once-only teardown
//! - **Registry**: the shared map of live sessions
//! - **Pumps**: one task per output stream forwarding interpreter output
//! - **Liveness**: a periodic sweep evicting sessions the peer stopped pinging
//! - **Charset**: conversion between the interpreter's encoding and UTF-8
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Daemon Orchestrator                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                    Message Router                     │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                  Session Controller                   │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │   Session    │  │  I/O Pumps   │  │ Liveness Monitor │   │
//! │  │   Registry   │  │              │  │                  │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shellmux_daemon::{ChannelTransport, Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let (transport, outbound) = ChannelTransport::new();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config, Arc::new(transport))?;
//!     orchestrator.start().await?;
//!     // Stops the orchestrator once stdin closes.
//!     orchestrator
//!         .serve(tokio::io::stdin(), outbound, tokio::io::stdout())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod charset;
pub mod config;
pub mod orchestrator;
pub mod router;
pub mod session;
pub mod transport;

pub use charset::{EncodingError, Transcoder};
pub use config::{Config, ConfigError};
pub use orchestrator::{DaemonOrchestrator, OrchestratorState};
pub use router::{MessageRouter, RouterError, RouterResult};
pub use session::{
    LivenessMonitor, Session, SessionController, SessionError, SessionRegistry, ShellCommand,
};
pub use transport::{ChannelTransport, Transport};
