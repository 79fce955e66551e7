//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry, controller and router from the configuration, runs the liveness
//! monitor, and serves packets over a line-delimited JSON stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use shellmux_protocol::Packet;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::router::MessageRouter;
use crate::session::{LivenessMonitor, SessionController, SessionRegistry};
use crate::transport::Transport;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry shared by the controller, pumps and monitor.
    registry: Arc<SessionRegistry>,
    /// Message router.
    router: Arc<MessageRouter>,
    /// Liveness monitor task, present while running.
    monitor_handle: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator sending outbound packets to
    /// `transport`.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let transcoder = config
            .session
            .transcoder()
            .context("Failed to select local encoding")?;
        info!(
            encoding = transcoder.local_encoding().name(),
            shell = %config.session.shell,
            "Session settings"
        );

        let registry = Arc::new(SessionRegistry::new());
        let controller = Arc::new(SessionController::new(
            Arc::clone(&registry),
            transport,
            transcoder,
            config.session.shell_command(),
        ));
        let router = Arc::new(MessageRouter::new(controller));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            router,
            monitor_handle: None,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Starts background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        info!("Starting daemon orchestrator...");

        let monitor = LivenessMonitor::new(Arc::clone(&self.registry))
            .with_interval(self.config.session.sweep_interval())
            .with_max_idle(self.config.session.idle_timeout());
        self.monitor_handle = Some(tokio::spawn(monitor.run(self.shutdown_token.clone())));
        debug!("Started liveness monitor");

        *self.state.write().await = OrchestratorState::Running;

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops background tasks and tears down every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(handle) = self.monitor_handle.take() {
            if let Err(e) = handle.await {
                warn!("Liveness monitor task failed: {}", e);
            }
        }

        self.router.controller().shutdown().await;

        *self.state.write().await = OrchestratorState::Stopped;

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Serves packets until `reader` ends or shutdown is requested, then stops
    /// the orchestrator.
    ///
    /// Each line of `reader` is one JSON packet. Packets are routed one at a
    /// time in arrival order, so a session's init and input cannot overtake
    /// each other. Router replies and everything sent through the transport
    /// (whose receiving end is `outbound`) are written to `writer`, one JSON
    /// packet per line. Packets produced while sessions are torn down are
    /// written before this returns.
    pub async fn serve<R, W>(
        &mut self,
        reader: R,
        outbound: mpsc::UnboundedReceiver<Packet>,
        writer: W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Packet>();
        let writer_done = CancellationToken::new();
        let writer_handle = tokio::spawn(write_packets(
            writer,
            outbound,
            reply_rx,
            writer_done.clone(),
        ));

        let result = self.read_packets(reader, &reply_tx).await;

        self.stop().await?;

        writer_done.cancel();
        if let Err(e) = writer_handle.await {
            warn!("Packet writer task failed: {}", e);
        }

        result
    }

    async fn read_packets<R>(
        &self,
        reader: R,
        replies: &mpsc::UnboundedSender<Packet>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Serve loop received shutdown signal");
                    return Ok(());
                }
                line = lines.next_line() => line.context("Failed to read from input stream")?,
            };

            let Some(line) = line else {
                info!("Input stream closed");
                return Ok(());
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let packet = match Packet::from_json(line) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "Discarding malformed packet");
                    continue;
                }
            };

            if let Some(reply) = self.router.handle(packet).await {
                let _ = replies.send(reply);
            }
        }
    }
}

/// Writes packets from both channels as JSON lines.
///
/// Runs until both channels are closed, or until `done` fires and everything
/// already queued has been written.
async fn write_packets<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    mut replies: mpsc::UnboundedReceiver<Packet>,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut outbound_open = true;
    let mut replies_open = true;

    while outbound_open || replies_open {
        let packet = tokio::select! {
            // Queued packets win over `done`, so the queues drain first.
            biased;
            packet = outbound.recv(), if outbound_open => match packet {
                Some(packet) => packet,
                None => {
                    outbound_open = false;
                    continue;
                }
            },
            packet = replies.recv(), if replies_open => match packet {
                Some(packet) => packet,
                None => {
                    replies_open = false;
                    continue;
                }
            },
            _ = done.cancelled() => break,
        };

        if let Err(e) = write_packet(&mut writer, &packet).await {
            error!("Failed to write packet: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = packet.to_json().context("Failed to serialize packet")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("Failed to write to output stream")?;
    writer.flush().await.context("Failed to flush output stream")?;
    Ok(())
}
