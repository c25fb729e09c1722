//! Multiplexed node connection
//!
//! One full-duplex connection per (node, service) carries many in-flight
//! operations at once, distinguished by opaque. A writer task drains a queue
//! of encoded frames; a reader task reassembles response frames and resolves
//! the correlation table. All I/O lives on the runtime's reactor; nothing
//! here blocks a caller thread.

use super::correlation::{spawn_sweeper, CorrelationTable};
use crate::operation::{Operation, Outcome};
use crate::protocol::codec::{decode_response, encode_request, outcome_into_result};
use crate::protocol::{ChannelContext, WireFrame, HEADER_SIZE};
use crate::{CancellationReason, Error, Result};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Upper bound on a single response body; larger means the peer is broken.
const MAX_RESPONSE_BODY: usize = 64 * 1024 * 1024;

/// One dispatched attempt, resolvable through the correlation table.
#[derive(Debug)]
pub struct AttemptHandle {
    rx: oneshot::Receiver<Result<Outcome>>,
    opaque: u32,
    table: Arc<CorrelationTable>,
}

/// Clonable cancel hook for one attempt, detached from the handle itself.
#[derive(Clone)]
pub struct AttemptCanceller {
    opaque: u32,
    table: Arc<CorrelationTable>,
}

impl AttemptCanceller {
    pub fn cancel(&self, reason: CancellationReason) {
        self.table.cancel(self.opaque, reason);
    }
}

impl AttemptHandle {
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn canceller(&self) -> AttemptCanceller {
        AttemptCanceller {
            opaque: self.opaque,
            table: self.table.clone(),
        }
    }

    /// Cancel this attempt; its receiver resolves `Cancelled(reason)`.
    pub fn cancel(&self, reason: CancellationReason) {
        self.table.cancel(self.opaque, reason);
    }

    pub async fn wait(self) -> Result<Outcome> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

/// A live connection to one node's key-value service.
pub struct NodeConnection {
    addr: String,
    ctx: ChannelContext,
    table: Arc<CorrelationTable>,
    write_tx: mpsc::UnboundedSender<(u32, Bytes)>,
    closed: Arc<AtomicBool>,
    max_request_size: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeConnection {
    /// Dial `addr` and spin up the reader/writer/sweeper tasks. The dial is
    /// bounded by `connect_timeout`; a blackholed node must not hold the
    /// caller past its own budget.
    pub async fn connect(
        addr: &str,
        ctx: ChannelContext,
        sweep_interval: Duration,
        max_request_size: usize,
        connect_timeout: Duration,
    ) -> Result<Arc<NodeConnection>> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::ConnectionFailed(format!("{addr}: connect timed out"))
            })?
            .map_err(|e| Error::ConnectionFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::ConnectionFailed(format!("{addr}: {e}")))?;
        tracing::info!("connected to {}", addr);
        Ok(Self::spawn(
            addr.to_string(),
            stream,
            ctx,
            sweep_interval,
            max_request_size,
        ))
    }

    /// Drive an already-established duplex stream. Tests use this with
    /// `tokio::io::duplex`.
    pub fn spawn<S>(
        addr: String,
        stream: S,
        ctx: ChannelContext,
        sweep_interval: Duration,
        max_request_size: usize,
    ) -> Arc<NodeConnection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let table = Arc::new(CorrelationTable::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = tokio::io::split(stream);

        let writer = tokio::spawn(write_loop(
            write_half,
            write_rx,
            table.clone(),
            closed.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            read_half,
            table.clone(),
            ctx.clone(),
            closed.clone(),
            addr.clone(),
        ));
        let sweeper = spawn_sweeper(&table, sweep_interval);

        Arc::new(NodeConnection {
            addr,
            ctx,
            table,
            write_tx,
            closed,
            max_request_size,
            tasks: vec![writer, reader, sweeper],
        })
    }

    /// Encode and queue one operation. Registration happens before the
    /// frame reaches the write queue, so a response can never race its own
    /// pending entry.
    pub fn dispatch(&self, op: &Operation, shard: u16) -> Result<AttemptHandle> {
        if self.is_closed() {
            return Err(Error::ConnectionFailed(format!(
                "{}: connection closed",
                self.addr
            )));
        }
        let opcode = op
            .opcode()
            .ok_or_else(|| Error::InvalidArgument("operation is resolved locally".into()))?;

        let (opaque, rx) = self
            .table
            .register(opcode, shard, op.context().timeout);

        let bytes = match encode_request(op, opaque, shard, &self.ctx) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.table.discard(opaque);
                return Err(e);
            }
        };
        if bytes.len() > self.max_request_size {
            self.table.discard(opaque);
            return Err(Error::RequestTooBig);
        }

        if self.write_tx.send((opaque, bytes)).is_err() {
            self.table.discard(opaque);
            return Err(Error::ConnectionFailed(format!(
                "{}: writer gone",
                self.addr
            )));
        }

        Ok(AttemptHandle {
            rx,
            opaque,
            table: self.table.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }

    /// Cancel everything pending, e.g. when the node left the topology.
    pub fn cancel_all(&self, reason: CancellationReason) {
        self.table.cancel_all(reason);
    }

    /// Mark closed and stop the I/O tasks. Dispatched entries resolve as
    /// `ConnectionClosed`, queued-but-unwritten ones as a retryable failed
    /// dispatch.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for task in &self.tasks {
            task.abort();
        }
        self.table.fail_all_closed();
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<(u32, Bytes)>,
    table: Arc<CorrelationTable>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some((opaque, bytes)) = rx.recv().await {
        // Entry already cancelled: the frame never hits the wire.
        if !table.mark_dispatched(opaque) {
            continue;
        }
        if let Err(e) = writer.write_all(&bytes).await {
            tracing::warn!("write failed: {}", e);
            break;
        }
    }
    closed.store(true, Ordering::Release);
    table.fail_all_closed();
}

async fn read_loop<R>(
    mut reader: R,
    table: Arc<CorrelationTable>,
    ctx: ChannelContext,
    closed: Arc<AtomicBool>,
    addr: String,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if reader.read_exact(&mut header).await.is_err() {
            tracing::debug!("{}: read side closed", addr);
            break;
        }

        let body_len =
            u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if body_len > MAX_RESPONSE_BODY {
            tracing::error!("{}: insane body length {}, tearing down", addr, body_len);
            break;
        }

        let mut frame_bytes = BytesMut::with_capacity(HEADER_SIZE + body_len);
        frame_bytes.extend_from_slice(&header);
        frame_bytes.resize(HEADER_SIZE + body_len, 0);
        if reader
            .read_exact(&mut frame_bytes[HEADER_SIZE..])
            .await
            .is_err()
        {
            tracing::debug!("{}: read side closed mid-frame", addr);
            break;
        }

        let frame = match WireFrame::decode(frame_bytes.freeze()) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frame: connection-fatal, not per-operation.
                tracing::error!("{}: {}", addr, e);
                break;
            }
        };

        let (opcode, shard) = match table.request_meta(frame.opaque) {
            Some(meta) => meta,
            None => {
                tracing::debug!(
                    "{}: discarding late response for opaque {}",
                    addr,
                    frame.opaque
                );
                continue;
            }
        };

        match decode_response(&frame, opcode, shard, &ctx) {
            Ok(outcome) => {
                table.resolve(frame.opaque, outcome_into_result(outcome, opcode, shard));
            }
            Err(e) => {
                tracing::error!("{}: {}", addr, e);
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    table.fail_all_closed();
}
