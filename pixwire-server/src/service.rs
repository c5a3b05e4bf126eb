//! Server service core logic.
//!
//! Accepts client connections and streams the test-pattern window to
//! each of them:
//!
//! ```text
//!   TcpListener ─accept─▶ serve_client
//!                           ├─ feeder: AddWindow, then Damage every 1/fps ─▶ Session::run
//!                           ├─ run_writer(socket write half)
//!                           └─ FramedRead(socket read half) until disconnect
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use pixwire_core::{
    CodecRegistry, DamageOptions, FrameCodec, Packet, PixwireError, Session, SessionEvent, output_queue,
    run_writer,
};

use crate::config::ServerConfig;
use crate::pattern::TestPattern;

/// Window id of the test-pattern window.
pub const PATTERN_WID: u32 = 1;

// ── PixwireService ───────────────────────────────────────────────

/// The top-level server service.
pub struct PixwireService {
    config: Arc<ServerConfig>,
    registry: Arc<CodecRegistry>,
    running: Arc<AtomicBool>,
}

impl PixwireService {
    /// Create a service using the built-in codecs.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, CodecRegistry::with_defaults())
    }

    pub fn with_registry(config: ServerConfig, registry: CodecRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), PixwireError> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.network.listen_address, self.config.network.listen_port
        )
        .parse()
        .map_err(|e| PixwireError::Other(format!("invalid listen address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept clients on `listener` until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), PixwireError> {
        self.running.store(true, Ordering::SeqCst);
        info!("pixwire server listening on {}", listener.local_addr()?);

        let slots = Arc::new(Semaphore::new(self.config.network.max_connections.max(1) as usize));

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                warn!("rejecting {peer}: connection limit reached");
                tokio::spawn(reject(stream, FrameCodec::from_policy(&self.config.pipeline.compression)));
                continue;
            };

            info!("client connected from {peer}");
            let config = Arc::clone(&self.config);
            let registry = Arc::clone(&self.registry);
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, &config, &registry, &running).await {
                    error!("session with {peer} failed: {e}");
                }
                info!("session with {peer} ended");
                drop(permit);
            });
        }

        self.running.store(false, Ordering::SeqCst);
        info!("pixwire server stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

// ── Per-connection ───────────────────────────────────────────────

async fn reject(stream: TcpStream, codec: FrameCodec) {
    let mut framed = FramedWrite::new(stream, codec);
    if let Err(e) = framed.send(Packet::disconnect("too many connections")).await {
        debug!("failed to send rejection: {e}");
    }
}

/// Run one client: session, writer and a reader watching for disconnects.
async fn serve_client(
    stream: TcpStream,
    config: &ServerConfig,
    registry: &CodecRegistry,
    running: &Arc<AtomicBool>,
) -> Result<(), PixwireError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();

    let policy = Arc::new(config.to_pipeline_policy());
    let codec = FrameCodec::from_policy(&policy.compression);
    let (out_tx, out_rx) = output_queue();
    let session = Session::new(Arc::clone(&policy), registry, config.to_client_capabilities(), out_tx)?;

    let (events, events_rx) = mpsc::channel(64);
    let session_task = tokio::spawn(session.run(events_rx));
    let writer_task = tokio::spawn(run_writer(write_half, codec.clone(), out_rx));

    let capture = config.to_capture_config();
    let pattern = TestPattern::new(capture.clone());
    let damage = pattern.damage_rect();
    events
        .send(SessionEvent::AddWindow {
            wid: PATTERN_WID,
            source: Box::new(pattern),
        })
        .await
        .map_err(|_| PixwireError::ChannelClosed)?;

    let mut reader = FramedRead::new(read_half, codec);
    let mut ticker = tokio::time::interval(capture.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ev = SessionEvent::Damage {
                    wid: PATTERN_WID,
                    rect: damage,
                    options: DamageOptions::default(),
                };
                if events.send(ev).await.is_err() {
                    break None;
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(Packet::Disconnect { reason })) => {
                    info!(reason = %reason, "client disconnected");
                    break None;
                }
                Some(Ok(packet)) => debug!(kind = packet.kind(), "ignoring client packet"),
                Some(Err(e)) => {
                    warn!("client stream error: {e}");
                    break Some(e.to_string());
                }
                None => break None,
            },
            _ = PixwireService::wait_for_stop(running) => break Some("server shutting down".to_string()),
        }
    };

    if let Some(reason) = reason {
        let _ = events.send(SessionEvent::Shutdown { reason }).await;
    }
    drop(events);

    match session_task.await {
        Ok(result) => result?,
        Err(e) => error!("session task failed: {e}"),
    }
    match writer_task.await {
        Ok(Err(e)) => debug!("writer ended: {e}"),
        Err(e) => error!("writer task failed: {e}"),
        Ok(Ok(())) => {}
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
