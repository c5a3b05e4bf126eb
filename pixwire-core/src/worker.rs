//! The per-connection encode thread.
//!
//! ```text
//!   capture context ──Option<WorkItem>──▶ crossbeam FIFO ──▶ EncodeWorker thread
//!                                                              │ WindowVideoEncoder per wid
//!                                                              ▼
//!                                       SequenceGate::admit ─▶ OutputQueue
//! ```
//!
//! `None` on the channel ends the thread. The receive wakes up at the
//! earliest flush or idle deadline of any window.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::caps::ClientCapabilities;
use crate::codecs::CodecRegistry;
use crate::error::PixwireError;
use crate::packet::{DrawPacket, Packet};
use crate::policy::PipelinePolicy;
use crate::session::OutputQueue;
use crate::video::cancel::SequenceGate;
use crate::video::pipeline::WindowVideoEncoder;
use crate::video::source::EncodeQueueItem;

/// Work for the encode thread.
#[derive(Debug)]
pub enum WorkItem {
    Encode(EncodeQueueItem),
    /// The window is gone; release its pipeline.
    CloseWindow(u32),
    /// Release the pipeline until the next frame arrives.
    Suspend(u32),
}

/// Handle to a running encode thread.
pub struct EncodeWorker {
    tx: Sender<Option<WorkItem>>,
    handle: Option<JoinHandle<()>>,
}

impl EncodeWorker {
    /// Start the thread. `registry` must be the client's view.
    pub fn spawn(
        policy: Arc<PipelinePolicy>,
        registry: CodecRegistry,
        caps: Arc<ClientCapabilities>,
        output: OutputQueue,
    ) -> Result<Self, PixwireError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut state = WorkerState {
            policy,
            registry,
            caps,
            output,
            encoders: HashMap::new(),
            gates: HashMap::new(),
            packet_sequence: 0,
        };
        let handle = std::thread::Builder::new()
            .name("pixwire-encode".into())
            .spawn(move || state.run(rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queue work. Fails once the thread has exited.
    pub fn submit(&self, item: WorkItem) -> Result<(), PixwireError> {
        self.tx.send(Some(item)).map_err(|_| PixwireError::ChannelClosed)
    }

    /// Items waiting in the FIFO.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Stop the thread and wait for it to clean up.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(None);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("encode thread panicked");
            }
        }
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Thread state ─────────────────────────────────────────────────

struct WorkerState {
    policy: Arc<PipelinePolicy>,
    registry: CodecRegistry,
    caps: Arc<ClientCapabilities>,
    output: OutputQueue,
    encoders: HashMap<u32, WindowVideoEncoder>,
    gates: HashMap<u32, Arc<SequenceGate>>,
    packet_sequence: u64,
}

impl WorkerState {
    fn run(&mut self, rx: Receiver<Option<WorkItem>>) {
        tracing::debug!("encode thread started");
        loop {
            let msg = match self.next_deadline() {
                Some(deadline) => rx.recv_deadline(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match msg {
                Ok(Some(item)) => self.handle(item),
                Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.fire_timers(Instant::now());
        }
        for (wid, mut encoder) in self.encoders.drain() {
            tracing::trace!(wid, "cleaning pipeline at shutdown");
            encoder.clean();
        }
        tracing::debug!(packets = self.packet_sequence, "encode thread stopped");
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.encoders.values_mut().filter_map(|e| e.next_deadline()).min()
    }

    fn handle(&mut self, item: WorkItem) {
        match item {
            WorkItem::Encode(item) => {
                let wid = item.wid;
                let gate = Arc::clone(&item.gate);
                self.gates.insert(wid, Arc::clone(&gate));
                if item.is_cancelled() {
                    tracing::trace!(wid, sequence = item.sequence, "skipping cancelled item");
                    return;
                }
                let encoder = self.encoders.entry(wid).or_insert_with(|| {
                    WindowVideoEncoder::new(
                        wid,
                        Arc::clone(&self.policy),
                        self.registry.clone(),
                        Arc::clone(&self.caps),
                    )
                });
                let packets = encoder.encode(item, Instant::now());
                self.emit(&gate, packets);
            }
            WorkItem::CloseWindow(wid) => {
                if let Some(mut encoder) = self.encoders.remove(&wid) {
                    encoder.clean();
                }
                self.gates.remove(&wid);
                tracing::debug!(wid, "window closed");
            }
            WorkItem::Suspend(wid) => {
                if let Some(encoder) = self.encoders.get_mut(&wid) {
                    encoder.suspend();
                }
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        let mut ready = Vec::new();
        for (wid, encoder) in self.encoders.iter_mut() {
            let packets = encoder.poll_timers(now);
            if !packets.is_empty() {
                ready.push((*wid, packets));
            }
        }
        for (wid, packets) in ready {
            if let Some(gate) = self.gates.get(&wid).cloned() {
                self.emit(&gate, packets);
            }
        }
    }

    /// Number and enqueue packets whose sequence is still live.
    fn emit(&mut self, gate: &SequenceGate, packets: Vec<DrawPacket>) {
        for mut packet in packets {
            let sequence = packet.damage_sequence().unwrap_or(u64::MAX);
            let output = &self.output;
            let counter = &mut self.packet_sequence;
            let sent = gate.admit(sequence, || {
                *counter += 1;
                packet.packet_sequence = *counter;
                tracing::trace!(%packet, "queued");
                output.push(Packet::Draw(packet))
            });
            match sent {
                None => tracing::trace!(sequence, "packet of cancelled sequence dropped"),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "output queue closed");
                    return;
                }
                Some(Ok(())) => {}
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Frame, PixelFormat};
    use crate::session::output_queue;
    use crate::video::source::EncodeOptions;

    fn item(wid: u32, sequence: u64, gate: &Arc<SequenceGate>) -> EncodeQueueItem {
        let now = Instant::now();
        let frame = Frame::packed(0, 0, 16, 16, PixelFormat::Bgrx, 64, vec![7u8; 16 * 64]);
        EncodeQueueItem {
            wid,
            width: 16,
            height: 16,
            damage_time: now,
            enqueue_time: now,
            frame,
            encoding: "rgb".into(),
            sequence,
            options: EncodeOptions {
                quality: 100,
                speed: 50,
                ..Default::default()
            },
            flush: 0,
            gate: Arc::clone(gate),
            av_due: None,
        }
    }

    fn worker() -> (EncodeWorker, crate::session::OutputReceiver) {
        let (tx, rx) = output_queue();
        let w = EncodeWorker::spawn(
            Arc::new(PipelinePolicy::default()),
            CodecRegistry::with_defaults(),
            Arc::new(ClientCapabilities::default()),
            tx,
        )
        .unwrap();
        (w, rx)
    }

    #[test]
    fn packets_are_numbered_in_order() {
        let (w, mut rx) = worker();
        let gate = Arc::new(SequenceGate::new());
        for seq in 1..=3 {
            w.submit(WorkItem::Encode(item(1, seq, &gate))).unwrap();
        }
        w.shutdown();
        let mut seqs = Vec::new();
        while let Some(p) = rx.try_recv() {
            seqs.push(p.as_draw().unwrap().packet_sequence);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_sequences_never_reach_the_queue() {
        let (w, mut rx) = worker();
        let gate = Arc::new(SequenceGate::new());
        gate.cancel(2);
        for seq in 1..=4 {
            w.submit(WorkItem::Encode(item(7, seq, &gate))).unwrap();
        }
        w.submit(WorkItem::CloseWindow(7)).unwrap();
        w.shutdown();
        let mut damage = Vec::new();
        while let Some(p) = rx.try_recv() {
            damage.push(p.as_draw().unwrap().damage_sequence().unwrap());
        }
        assert_eq!(damage, vec![3, 4]);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let (tx, _rx) = output_queue();
        let w = EncodeWorker::spawn(
            Arc::new(PipelinePolicy::default()),
            CodecRegistry::with_defaults(),
            Arc::new(ClientCapabilities::default()),
            tx,
        )
        .unwrap();
        let sender = w.tx.clone();
        w.shutdown();
        assert!(sender.send(Some(WorkItem::Suspend(1))).is_err());
    }
}
