//! Connection manager and reply dispatcher
//!
//! One TCP connection to the backend is shared by every call. The write half
//! and the table of calls awaiting a reply live behind a single lock, so a
//! call is either registered against a live connection or sees that there is
//! none. The read half belongs to the manager task, which reads one reply
//! frame at a time and hands it to the call that owns its xid.
//!
//! When the connection drops, every registered call is failed with
//! `Reconnecting` before a new connection is attempted. Each successful
//! connect bumps the connection generation; callers use it to wait for a
//! connection newer than the one that failed them.

use crate::config::ProxyClientConfig;
use crate::error::{ProxyError, Result};
use crate::framer::{self, XidGenerator, FRAME_HEADER_SIZE};
use crate::pool::CallContext;
use async_trait::async_trait;
use bytes::BytesMut;
use nfs4proto::{CompoundArgs, OpaqueAuth};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Unmatched frames are discarded through a buffer of this size
const DRAIN_CHUNK: usize = 256;

/// Lowest local port tried for a privileged bind
const PRIVILEGED_PORT_LOW: u16 = 512;
const PRIVILEGED_PORT_HIGH: u16 = 1023;

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected { generation: u64 },
    ShuttingDown,
}

/// How a registered call finished. The receive buffer always travels back
/// to the caller, filled with the reply (xid onward) on success.
#[derive(Debug)]
pub struct Completion {
    pub buf: BytesMut,
    pub result: Result<()>,
}

struct PendingCall {
    tx: oneshot::Sender<Completion>,
    buf: BytesMut,
    capacity: usize,
    generation: u64,
}

impl PendingCall {
    fn complete(self, result: Result<()>) {
        let _ = self.tx.send(Completion {
            buf: self.buf,
            result,
        });
    }
}

struct Shared {
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    pending: HashMap<u32, PendingCall>,
    generation: u64,
    local_addr: Option<SocketAddr>,
}

/// A call written to the connection, waiting for its reply
#[derive(Debug)]
pub struct SentCall {
    pub xid: u32,
    pub generation: u64,
    pub rx: oneshot::Receiver<Completion>,
}

/// Why `send_call` did not put the call on the wire
#[derive(Debug)]
pub enum SendFailure {
    /// No connection; wait for one newer than `generation`
    NotConnected { generation: u64 },
    /// The write failed and a reconnect was requested
    WriteFailed { generation: u64 },
    /// Not a transport problem; retrying will not help
    Fatal(ProxyError),
}

/// Opens TCP connections to the backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<TcpStream>;

    /// Peer description for logs
    fn describe(&self) -> String;
}

/// Connects from an ephemeral or a reserved (below 1024) local port
pub struct TcpConnector {
    host: String,
    port: u16,
    privileged: bool,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, privileged: bool) -> Self {
        Self {
            host: host.into(),
            port,
            privileged,
        }
    }

    pub fn from_config(config: &ProxyClientConfig) -> Self {
        Self::new(
            config.server_addr.clone(),
            config.port,
            config.use_privileged_port,
        )
    }

    /// Walk the reserved range downward until a local port is free
    async fn connect_privileged(addr: SocketAddr) -> io::Result<TcpStream> {
        let unspecified = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        for port in (PRIVILEGED_PORT_LOW..=PRIVILEGED_PORT_HIGH).rev() {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            match socket.bind(SocketAddr::new(unspecified, port)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                // Same local port already connected to this peer.
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free reserved port",
        ))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((self.host.as_str(), self.port)).await? {
            let attempt = if self.privileged {
                Self::connect_privileged(addr).await
            } else {
                TcpStream::connect(addr).await
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.host),
            )
        }))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The shared backend connection
pub struct Connection {
    program: u32,
    version: u32,
    retry_sleep: Duration,
    poll_timeout: Duration,
    write_timeout: Duration,
    connector: Box<dyn Connector>,
    xids: XidGenerator,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    // Generation whose connection a sender found broken
    reset_tx: watch::Sender<u64>,
}

impl Connection {
    pub fn new(config: &ProxyClientConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            program: config.program,
            version: config.version,
            retry_sleep: config.retry_sleep,
            poll_timeout: config.poll_timeout,
            write_timeout: config.rpc_timeout,
            connector,
            xids: XidGenerator::from_process(),
            shared: Mutex::new(Shared {
                writer: None,
                pending: HashMap::new(),
                generation: 0,
                local_addr: None,
            }),
            state_tx: watch::Sender::new(LinkState::Disconnected),
            shutdown_tx: watch::Sender::new(false),
            reset_tx: watch::Sender::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Local address of the current (or last) connection
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().await.local_addr
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.lock().await.pending.len()
    }

    fn publish(&self, state: LinkState) {
        self.state_tx.send_if_modified(|current| {
            if *current == LinkState::ShuttingDown || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Wait for a connection newer than `after`; returns its generation.
    ///
    /// Fails with `ShuttingDown` once shutdown starts.
    pub async fn wait_for_socket(&self, after: u64) -> Result<u64> {
        let mut rx = self.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| match s {
                LinkState::Connected { generation } => *generation > after,
                LinkState::ShuttingDown => true,
                _ => false,
            })
            .await
            .map_err(|_| ProxyError::ShuttingDown)?;
        match state {
            LinkState::Connected { generation } => Ok(generation),
            _ => Err(ProxyError::ShuttingDown),
        }
    }

    /// Wait for any live connection
    pub async fn wait_connected(&self) -> Result<u64> {
        self.wait_for_socket(0).await
    }

    /// Ask the manager to drop connection `generation`. Stale requests, for
    /// a connection already replaced, are ignored.
    pub fn request_reset(&self, generation: u64) {
        self.reset_tx.send_if_modified(|current| {
            if generation > *current {
                *current = generation;
                true
            } else {
                false
            }
        });
    }

    /// Encode the call, register it for its reply and write it out.
    ///
    /// On success the context's receive buffer is on loan to the dispatcher
    /// and comes back through `SentCall::rx`. Every failure leaves it in
    /// place.
    pub async fn send_call(
        &self,
        ctx: &mut CallContext,
        cred: &OpaqueAuth,
        args: &CompoundArgs,
    ) -> std::result::Result<SentCall, SendFailure> {
        let (writer, xid, generation, mut rx) = {
            let mut shared = self.shared.lock().await;
            if self.is_shutting_down() {
                return Err(SendFailure::Fatal(ProxyError::ShuttingDown));
            }
            let writer = match &shared.writer {
                Some(writer) => Arc::clone(writer),
                None => {
                    return Err(SendFailure::NotConnected {
                        generation: shared.generation,
                    })
                }
            };

            let mut xid = self.xids.next_xid();
            // Only possible after the counter wrapped around.
            while shared.pending.contains_key(&xid) {
                xid = self.xids.next_xid();
            }
            framer::encode_call(ctx, xid, self.program, self.version, cred, args)
                .map_err(SendFailure::Fatal)?;

            let (tx, rx) = oneshot::channel();
            let generation = shared.generation;
            shared.pending.insert(
                xid,
                PendingCall {
                    tx,
                    buf: std::mem::take(&mut ctx.recv_buf),
                    capacity: ctx.recv_capacity(),
                    generation,
                },
            );
            (writer, xid, generation, rx)
        };

        trace!(
            "xid {:#x}: writing {} bytes on connection {}",
            xid,
            ctx.send_buf.len(),
            generation
        );

        // A write abandoned halfway leaves a partial record on the stream.
        let mut guard = ResetOnDrop {
            conn: self,
            generation,
            armed: true,
        };
        let written = tokio::time::timeout(self.write_timeout, async {
            let mut writer = writer.lock().await;
            writer.write_all(&ctx.send_buf).await
        })
        .await;
        guard.armed = false;

        let err = match written {
            Ok(Ok(())) => {
                return Ok(SentCall {
                    xid,
                    generation,
                    rx,
                })
            }
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
        };

        warn!("xid {:#x}: write failed: {}", xid, err);
        match self.deregister(xid).await {
            Some(buf) => ctx.recv_buf = buf,
            // Already drained by a disconnect
            None => {
                if let Ok(done) = rx.try_recv() {
                    ctx.recv_buf = done.buf;
                }
            }
        }
        self.request_reset(generation);
        Err(SendFailure::WriteFailed { generation })
    }

    /// Forget a registered call; a late reply for it is drained as unmatched
    pub async fn deregister(&self, xid: u32) -> Option<BytesMut> {
        let call = self.shared.lock().await.pending.remove(&xid)?;
        Some(call.buf)
    }

    /// Stop the manager and fail every registered call with `ShuttingDown`
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.state_tx.send_replace(LinkState::ShuttingDown);
        self.teardown(true).await;
    }

    /// Connection manager loop; returns after `shutdown`
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let peer = self.connector.describe();

        while !*shutdown.borrow() {
            self.publish(LinkState::Connecting);
            let attempt = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                attempt = self.connector.connect() => attempt,
            };

            let stream = match attempt {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "Cannot connect to {}: {}, retrying in {:?}",
                        peer, e, self.retry_sleep
                    );
                    self.publish(LinkState::Disconnected);
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(self.retry_sleep) => continue,
                    }
                }
            };

            let (reader, generation) = match self.install(stream).await {
                Ok(installed) => installed,
                Err(e) => {
                    warn!(
                        "Failed to set up connection to {}: {}, retrying in {:?}",
                        peer, e, self.retry_sleep
                    );
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(self.retry_sleep) => continue,
                    }
                }
            };
            info!("Connected to {} (generation {})", peer, generation);
            self.publish(LinkState::Connected { generation });

            self.dispatch(reader, generation, &mut shutdown).await;

            let stopping = *shutdown.borrow();
            self.teardown(stopping).await;
            if !stopping {
                info!("Connection {} to {} lost, reconnecting", generation, peer);
                self.publish(LinkState::Disconnected);
            }
        }

        self.teardown(true).await;
        debug!("Connection manager for {} stopped", peer);
    }

    async fn install(&self, stream: TcpStream) -> io::Result<(OwnedReadHalf, u64)> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();

        let mut shared = self.shared.lock().await;
        shared.generation += 1;
        shared.writer = Some(Arc::new(Mutex::new(writer)));
        shared.local_addr = local_addr;
        Ok((reader, shared.generation))
    }

    /// Close the socket and fail every registered call. With `stopping`
    /// the calls get `ShuttingDown`, otherwise the retryable `Reconnecting`.
    async fn teardown(&self, stopping: bool) {
        let (writer, drained) = {
            let mut shared = self.shared.lock().await;
            let drained: Vec<_> = shared.pending.drain().collect();
            (shared.writer.take(), drained)
        };

        if !drained.is_empty() {
            debug!("Failing {} pending calls", drained.len());
        }
        for (_, call) in drained {
            let outcome = if stopping {
                ProxyError::ShuttingDown
            } else {
                ProxyError::Reconnecting
            };
            call.complete(Err(outcome));
        }

        if let Some(writer) = writer {
            // Waits for a write in progress; bounded in case the peer stalls.
            let _ = tokio::time::timeout(self.poll_timeout, async {
                let _ = writer.lock().await.shutdown().await;
            })
            .await;
        }
    }

    /// Reply dispatcher; returns when the connection must be dropped
    async fn dispatch(
        &self,
        mut reader: OwnedReadHalf,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut reset = self.reset_tx.subscribe();
        let mut scratch = [0u8; DRAIN_CHUNK];

        loop {
            let outcome = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return,
                _ = reset.wait_for(|g| *g >= generation) => {
                    info!("Reset requested for connection {}", generation);
                    return;
                }
                outcome = self.poll_and_read(&mut reader, generation, &mut scratch) => outcome,
            };
            match outcome {
                Ok(true) => {}
                Ok(false) => trace!("No reply within {:?}", self.poll_timeout),
                Err(e) => {
                    warn!("Connection {} failed: {}", generation, e);
                    return;
                }
            }
        }
    }

    /// Wait for readability, then read exactly one frame. `Ok(false)` when
    /// the poll timed out with nothing to read.
    async fn poll_and_read(
        &self,
        reader: &mut OwnedReadHalf,
        generation: u64,
        scratch: &mut [u8],
    ) -> Result<bool> {
        match tokio::time::timeout(self.poll_timeout, reader.readable()).await {
            Err(_) => return Ok(false),
            Ok(ready) => ready?,
        }
        self.read_frame(reader, generation, scratch).await?;
        Ok(true)
    }

    async fn read_frame(
        &self,
        reader: &mut OwnedReadHalf,
        generation: u64,
        scratch: &mut [u8],
    ) -> Result<()> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let (len, xid) = framer::parse_frame_header(&header)?;
        let remaining = len - 4;

        let call = {
            let mut shared = self.shared.lock().await;
            match shared.pending.get(&xid) {
                Some(call) if call.generation == generation => shared.pending.remove(&xid),
                _ => None,
            }
        };

        let Some(mut call) = call else {
            debug!("Discarding {} byte reply for unknown xid {:#x}", len, xid);
            return drain(reader, remaining, scratch).await;
        };

        if len > call.capacity {
            warn!(
                "xid {:#x}: reply of {} bytes exceeds receive buffer of {}",
                xid, len, call.capacity
            );
            let capacity = call.capacity;
            let drained = drain(reader, remaining, scratch).await;
            call.complete(Err(ProxyError::ResponseTooLarge { len, capacity }));
            return drained;
        }

        call.buf.clear();
        call.buf.extend_from_slice(&xid.to_be_bytes());
        call.buf.resize(len, 0);
        if let Err(e) = reader.read_exact(&mut call.buf[4..]).await {
            call.complete(Err(ProxyError::Reconnecting));
            return Err(e.into());
        }
        trace!("xid {:#x}: {} byte reply", xid, len);
        call.complete(Ok(()));
        Ok(())
    }
}

/// Read and discard `len` bytes
async fn drain(reader: &mut OwnedReadHalf, mut len: usize, scratch: &mut [u8]) -> Result<()> {
    while len > 0 {
        let chunk = len.min(scratch.len());
        reader.read_exact(&mut scratch[..chunk]).await?;
        len -= chunk;
    }
    Ok(())
}

struct ResetOnDrop<'a> {
    conn: &'a Connection,
    generation: u64,
    armed: bool,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.request_reset(self.generation);
        }
    }
}
