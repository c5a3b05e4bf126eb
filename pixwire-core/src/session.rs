//! One client connection: capture context, encode worker and writer.
//!
//! ```text
//!   SessionEvent ─▶ Session::run (tokio task)
//!                     │ WindowSource per wid, timers
//!                     ▼
//!                   EncodeWorker (std::thread) ─▶ OutputQueue ─▶ run_writer ─▶ socket
//!                     ▲                               │
//!                     └──────── backlog() ◀───────────┘
//! ```
//!
//! The capture context never blocks on the network: the output queue is
//! unbounded and its occupancy feeds the batch delay instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;

use crate::caps::ClientCapabilities;
use crate::codec::FrameCodec;
use crate::codecs::CodecRegistry;
use crate::error::PixwireError;
use crate::image::FrameSource;
use crate::packet::Packet;
use crate::policy::PipelinePolicy;
use crate::region::Rectangle;
use crate::video::batch::BatchConfig;
use crate::video::source::{DamageOptions, WindowSource};
use crate::worker::{EncodeWorker, WorkItem};

// ── OutputQueue ──────────────────────────────────────────────────

/// Producer side of the packet queue, shared by the encode thread.
#[derive(Debug, Clone)]
pub struct OutputQueue {
    tx: mpsc::UnboundedSender<Packet>,
    backlog: Arc<AtomicUsize>,
}

/// Consumer side, drained by the network writer.
#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::UnboundedReceiver<Packet>,
    backlog: Arc<AtomicUsize>,
}

/// A connected queue pair.
pub fn output_queue() -> (OutputQueue, OutputReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        OutputQueue {
            tx,
            backlog: Arc::clone(&backlog),
        },
        OutputReceiver { rx, backlog },
    )
}

impl OutputQueue {
    pub fn push(&self, packet: Packet) -> Result<(), PixwireError> {
        self.backlog.fetch_add(1, Ordering::AcqRel);
        self.tx.send(packet).map_err(|e| {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            PixwireError::from(e)
        })
    }

    /// Packets queued but not yet written.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutputReceiver {
    pub async fn recv(&mut self) -> Option<Packet> {
        let packet = self.rx.recv().await?;
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        Some(packet)
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        let packet = self.rx.try_recv().ok()?;
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        Some(packet)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}

/// Write queued packets in FIFO order until the queue closes or a
/// disconnect has been sent.
pub async fn run_writer<W>(writer: W, codec: FrameCodec, mut rx: OutputReceiver) -> Result<(), PixwireError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, codec);
    let mut written: u64 = 0;
    while let Some(packet) = rx.recv().await {
        let last = matches!(packet, Packet::Disconnect { .. });
        if let Err(e) = framed.send(packet).await {
            tracing::warn!(error = %e, written, "network write failed");
            return Err(e);
        }
        written += 1;
        if last {
            break;
        }
    }
    tracing::debug!(written, "writer finished");
    Ok(())
}

// ── Session ──────────────────────────────────────────────────────

/// Input to the capture context.
pub enum SessionEvent {
    AddWindow { wid: u32, source: Box<dyn FrameSource> },
    CloseWindow { wid: u32 },
    Damage { wid: u32, rect: Rectangle, options: DamageOptions },
    Resize { wid: u32, width: u32, height: u32 },
    SetEncoding { wid: u32, encoding: String },
    ContentType { wid: u32, video: bool, text: bool },
    WindowState { wid: u32, fullscreen: bool, maximized: bool },
    Scrolled { wid: u32 },
    /// Stop encoding the window until it is damaged again.
    Suspend { wid: u32 },
    Shutdown { reason: String },
}

/// Capture context of one connection.
pub struct Session {
    policy: Arc<PipelinePolicy>,
    registry: CodecRegistry,
    caps: ClientCapabilities,
    batch: BatchConfig,
    windows: HashMap<u32, WindowSource>,
    worker: EncodeWorker,
    output: OutputQueue,
}

impl Session {
    /// Start the encode worker for a new connection.
    pub fn new(
        policy: Arc<PipelinePolicy>,
        registry: &CodecRegistry,
        caps: ClientCapabilities,
        output: OutputQueue,
    ) -> Result<Self, PixwireError> {
        let registry = registry.for_client(&caps);
        tracing::info!(
            video = ?registry.video_encodings(),
            pictures = ?registry.picture_encodings(),
            "session codecs"
        );
        let worker = EncodeWorker::spawn(
            Arc::clone(&policy),
            registry.clone(),
            Arc::new(caps.clone()),
            output.clone(),
        )?;
        Ok(Self {
            batch: BatchConfig::from_policy(&policy.batch),
            policy,
            registry,
            caps,
            windows: HashMap::new(),
            worker,
            output,
        })
    }

    pub fn window(&self, wid: u32) -> Option<&WindowSource> {
        self.windows.get(&wid)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn add_window(&mut self, wid: u32, source: Box<dyn FrameSource>, now: Instant) {
        let ws = WindowSource::new(
            wid,
            source,
            Arc::clone(&self.policy),
            self.registry.clone(),
            &self.caps,
            &self.batch,
            now,
        );
        tracing::debug!(wid, encoding = ws.encoding(), "window added");
        if let Some(mut old) = self.windows.insert(wid, ws) {
            old.cancel_damage();
        }
    }

    /// Apply one event. Returns `false` once the session should end.
    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) -> Result<bool, PixwireError> {
        match event {
            SessionEvent::AddWindow { wid, source } => self.add_window(wid, source, now),
            SessionEvent::CloseWindow { wid } => {
                if let Some(mut ws) = self.windows.remove(&wid) {
                    ws.cancel_damage();
                    self.worker.submit(WorkItem::CloseWindow(wid))?;
                }
            }
            SessionEvent::Damage { wid, rect, options } => match self.windows.get_mut(&wid) {
                Some(ws) => ws.damage(rect, options, now),
                None => tracing::debug!(wid, "damage for unknown window"),
            },
            SessionEvent::Resize { wid, width, height } => {
                if let Some(ws) = self.windows.get_mut(&wid) {
                    ws.resize(width, height, now);
                }
            }
            SessionEvent::SetEncoding { wid, encoding } => {
                if let Some(ws) = self.windows.get_mut(&wid) {
                    ws.set_encoding(&encoding, now);
                }
            }
            SessionEvent::ContentType { wid, video, text } => {
                if let Some(ws) = self.windows.get_mut(&wid) {
                    ws.set_content_type(video, text);
                }
            }
            SessionEvent::WindowState {
                wid,
                fullscreen,
                maximized,
            } => {
                if let Some(ws) = self.windows.get_mut(&wid) {
                    ws.set_window_state(fullscreen, maximized);
                }
            }
            SessionEvent::Scrolled { wid } => {
                if let Some(ws) = self.windows.get_mut(&wid) {
                    ws.record_scroll(now);
                }
            }
            SessionEvent::Suspend { wid } => {
                if let Some(ws) = self.windows.get_mut(&wid) {
                    ws.cancel_damage();
                    self.worker.submit(WorkItem::Suspend(wid))?;
                }
            }
            SessionEvent::Shutdown { reason } => {
                tracing::info!(reason = %reason, "session shutting down");
                for ws in self.windows.values_mut() {
                    ws.cancel_damage();
                }
                self.output.push(Packet::disconnect(reason))?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fire due timers and hand captured regions to the encode worker.
    pub fn poll(&mut self, now: Instant) -> Result<(), PixwireError> {
        let backlog = self.output.backlog() + self.worker.pending();
        for ws in self.windows.values_mut() {
            ws.update_batch_delay(now, backlog);
            for item in ws.poll(now) {
                self.worker.submit(WorkItem::Encode(item))?;
            }
        }
        Ok(())
    }

    /// Earliest timer of any window.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.windows.values_mut().filter_map(|ws| ws.next_deadline()).min()
    }

    /// Drive the capture context until shutdown or the event channel closes.
    ///
    /// The encode thread is joined off the async workers.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) -> Result<(), PixwireError> {
        let result = self.drive(&mut events).await;
        let worker = self.worker;
        if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
            tracing::error!("encode worker shutdown failed: {e}");
        }
        result
    }

    async fn drive(&mut self, events: &mut mpsc::Receiver<SessionEvent>) -> Result<(), PixwireError> {
        loop {
            let deadline = self.next_deadline();
            let sleep = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("session event channel closed");
                        break;
                    };
                    if !self.handle_event(event, Instant::now())? {
                        break;
                    }
                }
                _ = sleep => {}
            }
            if self.output.is_closed() {
                tracing::debug!("output queue closed, ending session");
                break;
            }
            self.poll(Instant::now())?;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
