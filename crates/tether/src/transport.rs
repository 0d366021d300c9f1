//! # Transport Pump
//!
//! Owns one duplex byte stream and moves whole frames across it.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: the pump knows frame boundaries and nothing else.
//!   What a frame means is the session's business.
//! - **Non-Blocking Sends**: [`Pump::send`] never awaits. It can be called from
//!   `Drop` impls and from any thread, which the reference lifecycle relies on.
//!
//! ## Invariants
//!
//! - Frames are written in the order `send` accepted them.
//! - The capacity check and the enqueue happen under one lock, and the writer
//!   is woken through a permit-storing `Notify`, so no wake-up is lost.
//! - The pump flips to closed exactly once; `close` is idempotent.
//! - A partially read frame is discarded on shutdown, never delivered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use tether_wire::Frame;
use tether_wire::WireError;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::error::Result;

/// A running reader/writer pair over one connection.
pub struct Pump {
    name: String,
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    max_frame_len: usize,
    wake: Notify,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl Pump {
    /// Splits `stream` and spawns the reader and writer tasks.
    ///
    /// Decoded inbound frames arrive on the returned receiver, which yields
    /// `None` once the reader has stopped.
    pub fn start<S>(stream: S, config: &SessionConfig) -> (Arc<Pump>, mpsc::UnboundedReceiver<Frame>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let pump = Arc::new(Pump {
            name: config.name.clone(),
            queue: Mutex::new(VecDeque::new()),
            capacity: config.outbound_capacity,
            max_frame_len: config.max_frame_len,
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            closed_tx,
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        });

        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::read_loop(pump.clone(), reader, inbound_tx));
        tokio::spawn(Self::write_loop(pump.clone(), writer));

        (pump, inbound_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a frame for the writer.
    ///
    /// Fails without blocking when the pump is closed or the queue is full.
    /// A full queue is treated as a transport fault and closes the pump.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }

        let bytes = frame.encode()?;
        let body_len = bytes.len() - tether_wire::frame::LENGTH_PREFIX;
        if body_len > self.max_frame_len {
            return Err(Error::Wire(WireError::FrameTooLarge(body_len)));
        }

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                drop(queue);
                warn!(session = %self.name, capacity = self.capacity, "outbound queue full, disconnecting");
                self.close();
                return Err(Error::QueueOverflow { capacity: self.capacity });
            }
            queue.push_back(bytes);
        }
        self.wake.notify_one();

        trace!(session = %self.name, kind = %frame.kind, call = %frame.call_id, "queued frame");
        Ok(())
    }

    /// Flips the pump to closed. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.name, "pump closed");
        self.closed_tx.send_replace(true);
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the pump has closed (immediately if it already has).
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Frames handed to the stream so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames decoded from the stream so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Frames accepted by `send` but not yet written.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    async fn read_loop<R>(pump: Arc<Pump>, mut reader: R, inbound: mpsc::UnboundedSender<Frame>)
    where
        R: AsyncRead + Unpin,
    {
        let mut closed_rx = pump.closed_tx.subscribe();
        loop {
            let next = tokio::select! {
                res = read_frame(&mut reader, pump.max_frame_len) => res,
                _ = closed_rx.wait_for(|closed| *closed) => break,
            };

            match next {
                Ok(frame) => {
                    pump.frames_received.fetch_add(1, Ordering::Relaxed);
                    trace!(session = %pump.name, kind = %frame.kind, call = %frame.call_id, "received frame");
                    if inbound.send(frame).is_err() {
                        break;
                    }
                }
                Err(Error::Io(msg)) => {
                    debug!(session = %pump.name, error = %msg, "read side ended");
                    break;
                }
                Err(e) => {
                    warn!(session = %pump.name, error = %e, "malformed inbound frame");
                    break;
                }
            }
        }
        pump.close();
    }

    async fn write_loop<W>(pump: Arc<Pump>, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        let mut closed_rx = pump.closed_tx.subscribe();
        loop {
            if pump.is_closed() {
                break;
            }

            let batch: Vec<Bytes> = pump.queue.lock().drain(..).collect();
            if batch.is_empty() {
                pump.wake.notified().await;
                continue;
            }

            // A peer that stopped reading must not keep a closed pump's stream open.
            let written = tokio::select! {
                res = write_batch(&mut writer, &batch) => res,
                _ = closed_rx.wait_for(|closed| *closed) => break,
            };
            if let Err(e) = written {
                debug!(session = %pump.name, error = %e, "write side failed");
                break;
            }
            pump.frames_sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        pump.close();
        let _ = writer.shutdown().await;
    }
}

async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > max_frame_len {
        return Err(Error::Wire(WireError::FrameTooLarge(len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame::decode_body(Bytes::from(body))?)
}

async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for bytes in batch {
        writer.write_all(bytes).await?;
    }
    writer.flush().await
}
