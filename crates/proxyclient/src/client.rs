//! Proxy client and call executor

use crate::config::ProxyClientConfig;
use crate::connection::{Connection, Connector, LinkState, SendFailure, SentCall, TcpConnector};
use crate::error::{ProxyError, Result};
use crate::framer;
use crate::pool::{CallContext, CallPool, PooledContext};
use crate::session::{SessionManager, SessionState, SessionStatus, SessionTracker};
use nfs4proto::{
    ArgOp, AuthSysParams, CompoundArgs, CompoundRes, OpaqueAuth, SessionId, Verifier,
    MAX_MACHINE_NAME,
};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Seconds since the epoch when this process first asked; stands in for
/// the server boot time in verifiers and credentials
pub fn boot_time() -> u64 {
    static BOOT: OnceLock<u64> = OnceLock::new();
    *BOOT.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    })
}

/// AUTH_SYS credentials of the running process
pub fn process_credentials(machine_name: Option<&str>) -> AuthSysParams {
    let mut machine_name = machine_name
        .map(str::to_string)
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "localhost".to_string());
    if machine_name.len() > MAX_MACHINE_NAME {
        let mut end = MAX_MACHINE_NAME;
        while !machine_name.is_char_boundary(end) {
            end -= 1;
        }
        machine_name.truncate(end);
    }

    // SAFETY: geteuid and getegid always succeed and touch no memory.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };

    AuthSysParams {
        stamp: boot_time() as u32,
        machine_name,
        uid,
        gid,
        gids: Vec::new(),
    }
}

pub(crate) struct ClientInner {
    pub(crate) config: ProxyClientConfig,
    pub(crate) pool: CallPool,
    pub(crate) conn: Arc<Connection>,
    pub(crate) session: SessionTracker,
    pub(crate) cred: OpaqueAuth,
    pub(crate) boot_verifier: Verifier,
}

impl ClientInner {
    /// Run one COMPOUND to completion.
    ///
    /// A compound starting with SEQUENCE waits for the session and is
    /// stamped with it and the context's slot exactly once, so a resend
    /// after a reconnect reuses the same slot and sequence id.
    pub(crate) async fn call(&self, cred: &OpaqueAuth, mut args: CompoundArgs) -> Result<CompoundRes> {
        let (mut ctx, session) = self.admit(args.starts_with_sequence()).await?;

        if let (Some((session_id, generation)), Some(seq)) = (session, args.sequence_mut()) {
            seq.session_id = session_id;
            seq.slot_id = ctx.slot_id();
            seq.sequence_id = ctx.next_sequence(generation);
            seq.highest_slot_id = self.config.highest_slot_id();
        }

        loop {
            let after = match self.conn.send_call(&mut ctx, cred, &args).await {
                Ok(sent) => {
                    let generation = sent.generation;
                    match self.wait_reply(&mut ctx, sent).await? {
                        Some(res) => return Ok(res),
                        None => generation,
                    }
                }
                Err(SendFailure::NotConnected { generation })
                | Err(SendFailure::WriteFailed { generation }) => generation,
                Err(SendFailure::Fatal(e)) => return Err(e),
            };
            debug!(
                "slot {}: waiting for a connection newer than {}",
                ctx.slot_id(),
                after
            );
            self.conn.wait_for_socket(after).await?;
        }
    }

    /// Take a context. SEQUENCE-bound calls wait for the session first, so
    /// a missing session never ties up contexts the session manager needs.
    async fn admit(&self, sequenced: bool) -> Result<(PooledContext<'_>, Option<(SessionId, u64)>)> {
        if !sequenced {
            return Ok((self.pool.acquire().await?, None));
        }
        loop {
            self.session.wait_ready().await?;
            let ctx = self.pool.acquire().await?;
            match self.session.ready() {
                Some(session) => return Ok((ctx, Some(session))),
                None => debug!("Session lost while waiting for a call slot"),
            }
        }
    }

    /// Wait for the reply to a sent call. `Ok(None)` means the connection
    /// went away first and the call should be sent again.
    async fn wait_reply(&self, ctx: &mut CallContext, sent: SentCall) -> Result<Option<CompoundRes>> {
        let SentCall { xid, mut rx, .. } = sent;
        let timeout = self.config.rpc_timeout;

        let done = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(done)) => done,
            // Dispatcher stopped in the middle of our frame
            Ok(Err(_)) => return Ok(None),
            // The slot is released now rather than when a reply or reconnect
            // clears it, so its next call may reach the server while this one
            // is still running there and come back NFS4ERR_DELAY.
            Err(_) => match self.conn.deregister(xid).await {
                Some(buf) => {
                    ctx.recv_buf = buf;
                    warn!("xid {:#x}: no reply after {:?}", xid, timeout);
                    return Err(ProxyError::Timeout(timeout));
                }
                // Completed while we were deregistering
                None => match rx.await {
                    Ok(done) => done,
                    Err(_) => return Ok(None),
                },
            },
        };

        ctx.recv_buf = done.buf;
        match done.result {
            Ok(()) => framer::decode_reply(xid, &ctx.recv_buf).map(Some),
            Err(ProxyError::Reconnecting) => {
                debug!("xid {:#x}: connection lost, resending", xid);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Client for one backend NFSv4.1 server
///
/// # Example
///
/// ```rust,ignore
/// let client = ProxyClient::start(ProxyClientConfig::default())?;
/// client.wait_for_session(Duration::from_secs(10)).await?;
/// let res = client
///     .execute(vec![ArgOp::Sequence(Default::default()), ArgOp::PutRootFh])
///     .await?;
/// ```
pub struct ProxyClient {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyClient {
    /// Build a client without starting its background tasks
    pub fn new(config: ProxyClientConfig) -> Result<Self> {
        let connector = Box::new(TcpConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ProxyClientConfig, connector: Box<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let params = process_credentials(config.machine_name.as_deref());
        let cred = OpaqueAuth::sys(&params).map_err(ProxyError::Encode)?;

        let inner = ClientInner {
            pool: CallPool::new(config.slots, config.send_size, config.recv_size),
            conn: Arc::new(Connection::new(&config, connector)),
            session: SessionTracker::new(),
            cred,
            boot_verifier: boot_time().to_be_bytes(),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build a client and start the connection and session tasks
    pub fn start(config: ProxyClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.spawn_connection();
        client.spawn_session_manager();
        Ok(client)
    }

    /// Start the connection manager task
    pub fn spawn_connection(&self) {
        info!(
            "Starting proxy client for {}:{} ({} slots)",
            self.inner.config.server_addr, self.inner.config.port, self.inner.config.slots
        );
        let task = tokio::spawn(Arc::clone(&self.inner.conn).run());
        self.track(task);
    }

    /// Start the session manager task
    pub fn spawn_session_manager(&self) {
        let task = tokio::spawn(self.session_manager().run());
        self.track(task);
    }

    /// A session manager for this client, for driving it by hand
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(Arc::clone(&self.inner))
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Run a COMPOUND of `ops` with the process credentials.
    ///
    /// If the first op is SEQUENCE its session, slot and sequence fields are
    /// filled in. The result carries the server's NFS status verbatim.
    pub async fn execute(&self, ops: Vec<ArgOp>) -> Result<CompoundRes> {
        self.execute_compound(CompoundArgs::new(ops)).await
    }

    pub async fn execute_compound(&self, args: CompoundArgs) -> Result<CompoundRes> {
        self.inner.call(&self.inner.cred, args).await
    }

    /// Run a COMPOUND on behalf of another user
    pub async fn execute_as(&self, cred: &AuthSysParams, args: CompoundArgs) -> Result<CompoundRes> {
        let cred = OpaqueAuth::sys(cred).map_err(ProxyError::Encode)?;
        self.inner.call(&cred, args).await
    }

    /// Wait until a session is established
    pub async fn wait_for_session(&self, timeout: Duration) -> Result<SessionId> {
        match tokio::time::timeout(timeout, self.inner.session.wait_ready()).await {
            Ok(ready) => ready.map(|(id, _)| id),
            Err(_) => Err(ProxyError::Timeout(timeout)),
        }
    }

    pub async fn session_state(&self) -> SessionState {
        self.inner.session.snapshot().await
    }

    pub fn session_status(&self) -> SessionStatus {
        self.inner.session.status()
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.conn.state()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.conn
    }

    pub fn pool(&self) -> &CallPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &ProxyClientConfig {
        &self.inner.config
    }

    /// Destroy the session if one is up, then stop everything. Calls still
    /// in progress fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        info!("Shutting down proxy client");

        if let (Some((id, _)), LinkState::Connected { .. }) =
            (self.inner.session.ready(), self.inner.conn.state())
        {
            let destroy = self.execute(vec![ArgOp::DestroySession(id)]);
            match tokio::time::timeout(self.inner.config.poll_timeout, destroy).await {
                Ok(Ok(res)) if res.is_ok() => debug!("Session {} destroyed", id),
                Ok(Ok(res)) => debug!("DESTROY_SESSION: {}", res.status_name()),
                Ok(Err(e)) => debug!("DESTROY_SESSION: {}", e),
                Err(_) => debug!("DESTROY_SESSION timed out"),
            }
        }

        self.inner.session.close();
        self.inner.conn.shutdown().await;
        self.inner.pool.close();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}
