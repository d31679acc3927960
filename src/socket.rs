// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection async reader/writer with an out-queue of shared buffers,
//! overflow and write-stall timers, and cooperative disconnect semantics.
//!
//! The reader extracts `\n`-terminated lines and posts them to the core job
//! queue; the writer drains a queue of reference-counted [`Bytes`] so that a
//! broadcast enqueues the same allocation into every recipient. A partially
//! written head buffer is replaced by a narrower view, never mutated.

use std::{
    net::IpAddr,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    cfg::config::ServerInfo,
    core::CoreHandle,
    reason::Reason,
    wire::{command::AdcCommand, tag::Sid},
};

/// A write that makes no progress for this long stalls the connection out.
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Anything that can carry the byte stream of one accepted connection; the
/// TLS acceptor hands in its wrapped stream through the same seam.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type AsyncStream = Box<dyn Stream>;

/// Limits and timers shared by every connection of a hub instance.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Read chunk size hint. Small on purpose, for fair scheduling across
    /// many connections.
    pub buffer_size: usize,
    /// Longest accepted command line, terminator included.
    pub max_command_size: usize,
    /// Out-queue byte cap per connection; 0 disables the cap.
    pub max_buffer_size: usize,
    /// How long a queue may stay above the cap before the connection goes.
    pub overflow_timeout: Duration,
    /// Delay between a disconnect request and the hard close.
    pub disconnect_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            buffer_size: 64,
            max_command_size: 16 * 1024,
            max_buffer_size: 16 * 1024,
            overflow_timeout: Duration::from_millis(60_000),
            disconnect_timeout: Duration::from_millis(10_000),
        }
    }
}

enum WriterMsg {
    Buf(Bytes),
    /// Stop accepting writes once the queue drains, then shut the stream
    /// down.
    Graceful,
}

type PendingIo = (
    ReadHalf<AsyncStream>,
    WriteHalf<AsyncStream>,
    mpsc::UnboundedReceiver<WriterMsg>,
);

struct Inner {
    ip: IpAddr,
    server: Arc<ServerInfo>,
    opts: Arc<SocketOptions>,
    handle: CoreHandle,

    sid: AtomicU32,
    queued: AtomicUsize,
    overflow_since: StdMutex<Option<Instant>>,
    disconnecting: AtomicBool,
    failed: AtomicBool,
    data_remaining: AtomicUsize,
    hard_close: CancellationToken,

    out_tx: mpsc::UnboundedSender<WriterMsg>,
    io: StdMutex<Option<PendingIo>>,
}

impl Inner {
    fn sid(&self) -> Sid {
        Sid::from_value(self.sid.load(Ordering::Relaxed))
    }

    /// Reports the failure to the core exactly once and forces the stream
    /// closed. Used for I/O-level errors where draining is pointless.
    fn fail(&self, reason: Reason, info: &str) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            let sid = self.sid();
            let info = info.to_string();
            debug!(%sid, %reason, info, "socket failed");
            self.handle
                .post(move |cm| cm.on_failed(sid, reason, &info));
        }
        self.hard_close.cancel();
    }

    /// Cooperative disconnect: the failure is reported through the job queue
    /// (never reentrantly from inside a handler), queued data gets
    /// `disconnect_timeout` to drain, then the stream is closed regardless.
    fn disconnect(self: &Arc<Self>, reason: Reason, info: &str) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.failed.swap(true, Ordering::SeqCst) {
            let sid = self.sid();
            let info = info.to_string();
            debug!(%sid, %reason, info, "disconnecting");
            self.handle
                .post(move |cm| cm.on_failed(sid, reason, &info));
        }
        let _ = self.out_tx.send(WriterMsg::Graceful);

        let inner = Arc::clone(self);
        let timeout = self.opts.disconnect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.hard_close.cancelled() => {}
                _ = tokio::time::sleep(timeout) => inner.hard_close.cancel(),
            }
        });
    }

    fn after_write(&self, bytes: usize) {
        let left = self.queued.fetch_sub(bytes, Ordering::SeqCst) - bytes;
        let mut overflow = self.overflow_since.lock().expect("overflow lock");
        if overflow.is_some() && left < self.opts.max_buffer_size {
            *overflow = None;
        }
    }
}

/// An asynchronous socket owned by one entity; cheap to clone.
#[derive(Clone)]
pub struct ManagedSocket {
    inner: Arc<Inner>,
}

impl ManagedSocket {
    pub fn new(
        stream: AsyncStream,
        ip: IpAddr,
        server: Arc<ServerInfo>,
        opts: Arc<SocketOptions>,
        handle: CoreHandle,
    ) -> ManagedSocket {
        let (rd, wr) = split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        ManagedSocket {
            inner: Arc::new(Inner {
                ip,
                server,
                opts,
                handle,
                sid: AtomicU32::new(Sid::INVALID.value()),
                queued: AtomicUsize::new(0),
                overflow_since: StdMutex::new(None),
                disconnecting: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                data_remaining: AtomicUsize::new(0),
                hard_close: CancellationToken::new(),
                out_tx,
                io: StdMutex::new(Some((rd, wr, out_rx))),
            }),
        }
    }

    /// Binds the socket to its session id and spawns the reader and writer
    /// tasks. Called once, after the entity exists in the core.
    pub fn start(&self, sid: Sid) {
        self.inner.sid.store(sid.value(), Ordering::Relaxed);
        let Some((rd, wr, out_rx)) = self.inner.io.lock().expect("io lock").take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(read_loop(inner, rd));
        let inner = Arc::clone(&self.inner);
        tokio::spawn(write_loop(inner, wr, out_rx));
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.ip
    }

    pub fn server(&self) -> &Arc<ServerInfo> {
        &self.inner.server
    }

    /// Local connection family: v6 unless the peer is v4 or a v4-mapped v6
    /// address.
    pub fn is_v6(&self) -> bool {
        match self.inner.ip {
            IpAddr::V4(_) => false,
            IpAddr::V6(a) => a.to_ipv4_mapped().is_none(),
        }
    }

    /// Bytes currently waiting in the out-queue.
    pub fn queued_bytes(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// When the out-queue first exceeded the cap, if it still does.
    pub fn overflow(&self) -> Option<Instant> {
        *self.inner.overflow_since.lock().expect("overflow lock")
    }

    pub fn is_disconnecting(&self) -> bool {
        self.inner.disconnecting.load(Ordering::SeqCst)
    }

    /// Queues a buffer for writing. Above the byte cap, low-priority buffers
    /// are silently dropped; others start (or ride out) the overflow timer
    /// and are appended anyway until the timer expires.
    pub fn enqueue(&self, buf: Bytes, low_prio: bool) {
        if buf.is_empty() || self.is_disconnecting() {
            return;
        }
        let opts = &self.inner.opts;
        let queued = self.inner.queued.load(Ordering::SeqCst);
        if opts.max_buffer_size > 0 && queued + buf.len() > opts.max_buffer_size {
            if low_prio {
                return;
            }
            let now = Instant::now();
            let expired = {
                let mut overflow =
                    self.inner.overflow_since.lock().expect("overflow lock");
                match *overflow {
                    Some(since) => now.duration_since(since) > opts.overflow_timeout,
                    None => {
                        *overflow = Some(now);
                        false
                    }
                }
            };
            if expired {
                self.disconnect(Reason::WriteOverflow, "Write buffer overflow");
                return;
            }
        }
        self.inner.queued.fetch_add(buf.len(), Ordering::SeqCst);
        let _ = self.inner.out_tx.send(WriterMsg::Buf(buf));
    }

    /// Requests a graceful shutdown; see [`Inner::disconnect`]. Subsequent
    /// `enqueue` calls become no-ops.
    pub fn disconnect(&self, reason: Reason, info: &str) {
        self.inner.disconnect(reason, info);
    }

    /// Switches the reader into DATA mode: the next `bytes` input bytes are
    /// forwarded verbatim to the core instead of being split into lines.
    pub fn set_data_mode(&self, bytes: usize) {
        self.inner.data_remaining.store(bytes, Ordering::SeqCst);
    }

    /// Adds the hub address parameters for the family opposite to this
    /// connection, for an HBRI validation request. Fails when the hub has no
    /// published address on that family.
    pub fn hbri_params(&self, cmd: &mut AdcCommand) -> bool {
        let server = &self.inner.server;
        let port = server.port.to_string();
        if self.is_v6() {
            match &server.address4 {
                Some(a4) if !a4.is_empty() => {
                    cmd.push_param("I4", a4);
                    cmd.push_param("P4", &port);
                    true
                }
                _ => false,
            }
        } else {
            match &server.address6 {
                Some(a6) if !a6.is_empty() => {
                    cmd.push_param("I6", a6);
                    cmd.push_param("P6", &port);
                    true
                }
                _ => false,
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut rd: ReadHalf<AsyncStream>) {
    let mut chunk = vec![0u8; inner.opts.buffer_size.max(16)];
    let mut acc = BytesMut::new();
    loop {
        // A disconnect request stops further reads.
        if inner.disconnecting.load(Ordering::SeqCst) {
            break;
        }
        let n = tokio::select! {
            _ = inner.hard_close.cancelled() => break,
            r = rd.read(&mut chunk) => match r {
                Ok(0) => {
                    inner.fail(Reason::SocketError, "connection closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    inner.fail(Reason::SocketError, &e.to_string());
                    break;
                }
            },
        };
        trace!(sid = %inner.sid(), bytes = n, "read");
        acc.extend_from_slice(&chunk[..n]);
        if !drain_input(&inner, &mut acc) {
            break;
        }
    }
}

/// Splits accumulated input into lines (or raw DATA-mode chunks) and posts
/// them to the core. Returns false when the connection was cut for an
/// over-long line.
fn drain_input(inner: &Arc<Inner>, acc: &mut BytesMut) -> bool {
    loop {
        let data_remaining = inner.data_remaining.load(Ordering::SeqCst);
        if data_remaining > 0 {
            if acc.is_empty() {
                return true;
            }
            let take = data_remaining.min(acc.len());
            let data = acc.split_to(take).freeze();
            inner.data_remaining.fetch_sub(take, Ordering::SeqCst);
            let sid = inner.sid();
            inner.handle.post(move |cm| cm.on_data(sid, data));
            continue;
        }
        match acc.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos + 1 > inner.opts.max_command_size {
                    reject_line(inner, acc);
                    return false;
                }
                let mut line = acc.split_to(pos + 1);
                line.truncate(pos);
                // An empty line is a keep-alive.
                if !line.is_empty() {
                    let line = line.freeze();
                    let sid = inner.sid();
                    inner.handle.post(move |cm| cm.on_line(sid, line));
                }
            }
            None => {
                if acc.len() > inner.opts.max_command_size {
                    reject_line(inner, acc);
                    return false;
                }
                return true;
            }
        }
    }
}

/// Reports an over-long line. The core answers with the fatal STA/QUI pair
/// and disconnects; this side only stops reading.
fn reject_line(inner: &Arc<Inner>, acc: &mut BytesMut) {
    let line = acc.split().freeze();
    let sid = inner.sid();
    inner
        .handle
        .post(move |cm| cm.on_bad_line(sid, &line));
}

async fn write_loop(
    inner: Arc<Inner>,
    mut wr: WriteHalf<AsyncStream>,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) {
    let mut queue: std::collections::VecDeque<Bytes> = std::collections::VecDeque::new();
    let mut draining = false;
    // Set while the head of the queue has made no progress; hitting it means
    // the peer stopped consuming.
    let mut write_deadline: Option<tokio::time::Instant> = None;

    loop {
        if queue.is_empty() {
            write_deadline = None;
            if draining {
                let _ = wr.shutdown().await;
                break;
            }
            tokio::select! {
                _ = inner.hard_close.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(WriterMsg::Buf(b)) => queue.push_back(b),
                    Some(WriterMsg::Graceful) => draining = true,
                    None => break,
                },
            }
        } else {
            let deadline = *write_deadline
                .get_or_insert_with(|| tokio::time::Instant::now() + WRITE_TIMEOUT);
            let head = queue.front().cloned().unwrap_or_default();
            tokio::select! {
                _ = inner.hard_close.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(WriterMsg::Buf(b)) => queue.push_back(b),
                    Some(WriterMsg::Graceful) => draining = true,
                    None => draining = true,
                },
                res = tokio::time::timeout_at(deadline, wr.write(&head)) => match res {
                    Err(_) => {
                        inner.fail(Reason::WriteTimeout, "write timed out");
                        break;
                    }
                    Ok(Err(e)) => {
                        inner.fail(Reason::SocketError, &e.to_string());
                        break;
                    }
                    Ok(Ok(0)) => {
                        inner.fail(Reason::SocketError, "connection closed");
                        break;
                    }
                    Ok(Ok(n)) => {
                        consume(&mut queue, n);
                        inner.after_write(n);
                        write_deadline = Some(tokio::time::Instant::now() + WRITE_TIMEOUT);
                    }
                },
            }
        }
    }
}

/// Trims `bytes` written bytes off the head of the queue. A partially
/// written buffer is replaced with a narrower view of the same allocation.
fn consume(queue: &mut std::collections::VecDeque<Bytes>, mut bytes: usize) {
    while bytes > 0 {
        let Some(head) = queue.pop_front() else {
            return;
        };
        if head.len() <= bytes {
            bytes -= head.len();
        } else {
            queue.push_front(head.slice(bytes..));
            return;
        }
    }
}
