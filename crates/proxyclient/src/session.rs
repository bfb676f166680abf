//! Session and client identity maintenance
//!
//! A background task keeps a client id (EXCHANGE_ID) and a session
//! (CREATE_SESSION) alive on the backend. Two needs drive it, both set at
//! startup:
//!
//! - `client_identity`: no usable client id; EXCHANGE_ID comes next
//! - `session`: no usable session; CREATE_SESSION comes next
//!
//! With neither need set, the task sleeps until shortly before the lease
//! runs out (or until the connection is re-established) and renews the
//! session with a bare SEQUENCE. A failed renewal, or one whose reply
//! carries status flags, marks the session missing again. Calls that start
//! with SEQUENCE wait while the session is missing.

use crate::client::ClientInner;
use crate::connection::LinkState;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use nfs4proto::{
    is_client_identity_error, ArgOp, CallbackSecParms, ChannelAttrs, ClientOwner, CompoundArgs,
    CreateSessionArgs, CreateSessionFlags, ExchangeIdArgs, ExchangeIdFlags, Fattr4, NfsOpcode,
    ResOp, SequenceArgs, SessionId, FATTR4_LEASE_TIME,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lease assumed until the server tells us otherwise
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Renew this long before the lease runs out
pub const RENEW_MARGIN: Duration = Duration::from_secs(5);

/// Shortest wait between renewals, whatever lease the server reports
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Operations per compound offered on the fore channel
pub const MAX_OPERATIONS: u32 = 10;

/// Callback program number offered in CREATE_SESSION. The proxy never
/// serves a back channel, but the field is mandatory.
pub const CALLBACK_PROGRAM: u32 = 0x4000_0000;

/// What the manager still has to (re-)establish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionNeeds {
    pub client_identity: bool,
    pub session: bool,
}

impl SessionNeeds {
    pub fn all() -> Self {
        Self {
            client_identity: true,
            session: true,
        }
    }

    pub fn any(&self) -> bool {
        self.client_identity || self.session
    }
}

/// Session availability as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Missing,
    Ready { id: SessionId, generation: u64 },
    Closed,
}

/// Snapshot of the client's identity and session
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub client_id: Option<u64>,
    /// Sequence id for the next CREATE_SESSION
    pub client_sequence: u32,
    #[serde(serialize_with = "serialize_session_id")]
    pub session_id: Option<SessionId>,
    /// Bumped every time a new session id is installed
    pub generation: u64,
    pub lease: Duration,
    pub needs: SessionNeeds,
    /// Connection generation the session was last confirmed on
    pub confirmed_link: u64,
    #[serde(skip)]
    pub renew_at: Option<Instant>,
}

fn serialize_session_id<S: serde::Serializer>(
    id: &Option<SessionId>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match id {
        Some(id) => serializer.serialize_some(&id.to_string()),
        None => serializer.serialize_none(),
    }
}

impl SessionState {
    fn new() -> Self {
        Self {
            client_id: None,
            client_sequence: 0,
            session_id: None,
            generation: 0,
            lease: DEFAULT_LEASE,
            needs: SessionNeeds::all(),
            confirmed_link: 0,
            renew_at: None,
        }
    }

    /// Whether the session is unusable for SEQUENCE-bearing calls
    pub fn session_missing(&self) -> bool {
        self.session_id.is_none()
    }
}

/// Session state shared by the manager and the call executor
pub(crate) struct SessionTracker {
    state: RwLock<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::new()),
            status_tx: watch::Sender::new(SessionStatus::Missing),
        }
    }

    pub(crate) async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Current session id and generation, if one is installed
    pub(crate) fn ready(&self) -> Option<(SessionId, u64)> {
        match self.status() {
            SessionStatus::Ready { id, generation } => Some((id, generation)),
            _ => None,
        }
    }

    /// Wait until a session is installed
    pub(crate) async fn wait_ready(&self) -> Result<(SessionId, u64)> {
        let mut rx = self.status_tx.subscribe();
        let status = *rx
            .wait_for(|s| *s != SessionStatus::Missing)
            .await
            .map_err(|_| ProxyError::ShuttingDown)?;
        match status {
            SessionStatus::Ready { id, generation } => Ok((id, generation)),
            _ => Err(ProxyError::ShuttingDown),
        }
    }

    fn publish(&self, status: SessionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == SessionStatus::Closed || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Drop the session; with `identity` the client id goes too
    pub(crate) async fn invalidate(&self, identity: bool) {
        let mut state = self.state.write().await;
        state.needs.session = true;
        if identity {
            state.needs.client_identity = true;
        }
        state.session_id = None;
        state.renew_at = None;
        self.publish(SessionStatus::Missing);
    }

    /// Fail every current and future session wait
    pub(crate) fn close(&self) {
        self.status_tx.send_replace(SessionStatus::Closed);
    }
}

/// Drives EXCHANGE_ID, CREATE_SESSION and lease renewal
pub struct SessionManager {
    inner: Arc<ClientInner>,
}

impl SessionManager {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Run until shutdown
    pub async fn run(self) {
        debug!("Session manager started");
        loop {
            match self.step().await {
                Ok(()) => {}
                Err(ProxyError::ShuttingDown) => break,
                Err(e) => warn!("Session maintenance: {}", e),
            }
        }
        debug!("Session manager stopped");
    }

    /// One pass of the maintenance loop
    pub async fn step(&self) -> Result<()> {
        let needs = self.inner.session.snapshot().await.needs;

        if !needs.any() {
            self.wait_for_renewal().await?;
            match self.renew().await {
                Ok(()) => return Ok(()),
                Err(ProxyError::ShuttingDown) => return Err(ProxyError::ShuttingDown),
                Err(e) => {
                    warn!("Session renewal failed: {}", e);
                    self.inner.session.invalidate(false).await;
                }
            }
        }

        self.inner.conn.wait_connected().await?;

        let needs = self.inner.session.snapshot().await.needs;
        if needs.client_identity {
            self.exchange_id().await
        } else if needs.session {
            self.create_session().await
        } else {
            Ok(())
        }
    }

    /// Sleep until the renewal deadline, or until a connection newer than
    /// the one the session was last confirmed on comes up
    async fn wait_for_renewal(&self) -> Result<()> {
        let (deadline, confirmed) = {
            let state = self.inner.session.state.read().await;
            let deadline = state
                .renew_at
                .unwrap_or_else(|| Instant::now() + renewal_interval(state.lease));
            (deadline, state.confirmed_link)
        };

        let mut link = self.inner.conn.subscribe();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Ok(()),
            changed = link.wait_for(|s| match s {
                LinkState::Connected { generation } => *generation > confirmed,
                LinkState::ShuttingDown => true,
                _ => false,
            }) => {
                match changed.map(|s| *s) {
                    Ok(LinkState::Connected { generation }) => {
                        debug!("Connection {} is new, confirming session", generation);
                        Ok(())
                    }
                    _ => Err(ProxyError::ShuttingDown),
                }
            }
        }
    }

    /// SEQUENCE-only compound on the current session
    async fn renew(&self) -> Result<()> {
        let args = CompoundArgs::new(vec![ArgOp::Sequence(SequenceArgs::default())]);
        let res = self.inner.call(&self.inner.cred, args).await?;

        let seq = match res.sequence() {
            Some(Ok(seq)) => seq,
            Some(Err(status)) => {
                return Err(ProxyError::Nfs {
                    op: "SEQUENCE",
                    status: *status,
                })
            }
            None => {
                return Err(ProxyError::Nfs {
                    op: "SEQUENCE",
                    status: res.status,
                })
            }
        };
        if !seq.status_flags.is_empty() {
            return Err(ProxyError::protocol_error(format!(
                "server raised session status flags {:?}",
                seq.status_flags
            )));
        }

        let link = match self.inner.conn.state() {
            LinkState::Connected { generation } => generation,
            _ => 0,
        };
        let mut state = self.inner.session.state.write().await;
        state.confirmed_link = state.confirmed_link.max(link);
        state.renew_at = Some(Instant::now() + renewal_interval(state.lease));
        debug!("Session {} renewed", seq.session_id);
        Ok(())
    }

    /// Obtain a fresh client id
    async fn exchange_id(&self) -> Result<()> {
        let local_ip = self
            .inner
            .conn
            .local_addr()
            .await
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let owner = format!(
            "{}({}, {}) - nfs4 proxy",
            local_ip,
            std::process::id(),
            self.inner.config.export_id
        );
        debug!("EXCHANGE_ID as {:?}", owner);

        let args = CompoundArgs::new(vec![ArgOp::ExchangeId(ExchangeIdArgs {
            client_owner: ClientOwner {
                verifier: self.inner.boot_verifier,
                owner_id: Bytes::from(owner),
            },
            flags: ExchangeIdFlags::empty(),
            impl_id: None,
        })]);
        let res = self.inner.call(&self.inner.cred, args).await?;

        let ok = match res.find(NfsOpcode::ExchangeId) {
            Some(ResOp::ExchangeId(Ok(ok))) => ok,
            Some(op) => {
                return Err(ProxyError::Nfs {
                    op: "EXCHANGE_ID",
                    status: op.status(),
                })
            }
            None => {
                return Err(ProxyError::Nfs {
                    op: "EXCHANGE_ID",
                    status: res.status,
                })
            }
        };

        let mut state = self.inner.session.state.write().await;
        state.client_id = Some(ok.client_id);
        state.client_sequence = ok.sequence_id;
        state.needs.client_identity = false;
        info!(
            "Got client id {:#x} (sequence {})",
            ok.client_id, ok.sequence_id
        );
        Ok(())
    }

    /// Create a session for the current client id and fetch the lease
    async fn create_session(&self) -> Result<()> {
        let (client_id, sequence_id) = {
            let state = self.inner.session.state.read().await;
            (state.client_id, state.client_sequence)
        };
        let Some(client_id) = client_id else {
            self.inner.session.invalidate(true).await;
            return Err(ProxyError::protocol_error("no client id to create a session for"));
        };

        let config = &self.inner.config;
        let fore_channel = ChannelAttrs {
            header_pad_size: 0,
            max_request_size: config.send_size as u32,
            max_response_size: config.recv_size as u32,
            max_response_size_cached: config.recv_size as u32,
            max_operations: MAX_OPERATIONS,
            max_requests: config.slots as u32,
            rdma_ird: None,
        };
        let back_channel = ChannelAttrs {
            max_requests: 1,
            ..fore_channel
        };
        let args = CompoundArgs::new(vec![ArgOp::CreateSession(CreateSessionArgs {
            client_id,
            sequence_id,
            flags: CreateSessionFlags::empty(),
            fore_channel,
            back_channel,
            cb_program: CALLBACK_PROGRAM,
            sec_parms: vec![CallbackSecParms::AuthNone],
        })]);
        debug!(
            "CREATE_SESSION for client {:#x} sequence {}",
            client_id, sequence_id
        );

        let res = self.inner.call(&self.inner.cred, args).await?;
        let status = match res.find(NfsOpcode::CreateSession) {
            Some(ResOp::CreateSession(Ok(ok))) => {
                self.install(ok.session_id).await;
                self.fetch_lease().await;
                return Ok(());
            }
            Some(op) => op.status(),
            None => res.status,
        };

        if is_client_identity_error(status) {
            info!("Client id {:#x} is no longer valid", client_id);
            self.inner.session.invalidate(true).await;
        }
        Err(ProxyError::Nfs {
            op: "CREATE_SESSION",
            status,
        })
    }

    async fn install(&self, session_id: SessionId) {
        let link = match self.inner.conn.state() {
            LinkState::Connected { generation } => generation,
            _ => 0,
        };
        let mut state = self.inner.session.state.write().await;
        state.session_id = Some(session_id);
        state.generation += 1;
        state.client_sequence = state.client_sequence.wrapping_add(1);
        state.needs.session = false;
        state.confirmed_link = link;
        state.renew_at = Some(Instant::now() + renewal_interval(state.lease));
        self.inner.session.publish(SessionStatus::Ready {
            id: session_id,
            generation: state.generation,
        });
        info!(
            "Session {} established (generation {})",
            session_id, state.generation
        );
    }

    /// Ask for the server's lease time; falls back to the default
    async fn fetch_lease(&self) {
        let args = CompoundArgs::new(vec![
            ArgOp::Sequence(SequenceArgs::default()),
            ArgOp::ReclaimComplete { one_fs: false },
            ArgOp::PutRootFh,
            ArgOp::GetAttr(Fattr4::bitmap(&[FATTR4_LEASE_TIME])),
        ]);
        let lease = match self.inner.call(&self.inner.cred, args).await {
            Ok(res) if res.is_ok() => match res.find(NfsOpcode::GetAttr) {
                Some(ResOp::GetAttr(Ok(attrs))) => attrs.lease_time(),
                _ => None,
            },
            Ok(res) => {
                debug!("Lease query failed: {}", res.status_name());
                None
            }
            Err(e) => {
                debug!("Lease query failed: {}", e);
                None
            }
        };

        let lease = lease
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or(DEFAULT_LEASE);
        let mut state = self.inner.session.state.write().await;
        state.lease = lease;
        state.renew_at = Some(Instant::now() + renewal_interval(lease));
        info!("Lease time is {:?}", lease);
    }
}

/// Time from a successful renewal to the next one
pub fn renewal_interval(lease: Duration) -> Duration {
    lease
        .checked_sub(RENEW_MARGIN)
        .filter(|d| !d.is_zero())
        .unwrap_or(lease / 2)
        .max(MIN_RENEW_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_interval() {
        assert_eq!(renewal_interval(Duration::from_secs(60)), Duration::from_secs(55));
        assert_eq!(renewal_interval(Duration::from_secs(5)), Duration::from_millis(2500));
        assert_eq!(renewal_interval(Duration::from_secs(2)), Duration::from_secs(1));
    }

    #[test]
    fn test_renewal_interval_has_floor() {
        assert_eq!(renewal_interval(Duration::ZERO), MIN_RENEW_INTERVAL);
        assert_eq!(renewal_interval(Duration::from_secs(1)), MIN_RENEW_INTERVAL);
        assert_eq!(renewal_interval(Duration::from_millis(1)), MIN_RENEW_INTERVAL);
    }

    #[tokio::test]
    async fn test_tracker_transitions() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.status(), SessionStatus::Missing);
        assert!(tracker.ready().is_none());
        assert!(tracker.snapshot().await.session_missing());

        let id = SessionId([1; 16]);
        tracker.publish(SessionStatus::Ready { id, generation: 1 });
        assert_eq!(tracker.wait_ready().await.unwrap(), (id, 1));

        tracker.invalidate(false).await;
        let state = tracker.snapshot().await;
        assert!(state.needs.session);
        // Set at startup and never cleared here
        assert!(state.needs.client_identity);
        assert!(tracker.ready().is_none());

        tracker.close();
        assert!(matches!(
            tracker.wait_ready().await,
            Err(ProxyError::ShuttingDown)
        ));
        tracker.publish(SessionStatus::Ready { id, generation: 2 });
        assert_eq!(tracker.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_install() {
        let tracker = Arc::new(SessionTracker::new());
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let id = SessionId([9; 16]);
        tracker.publish(SessionStatus::Ready { id, generation: 3 });
        assert_eq!(waiter.await.unwrap().unwrap(), (id, 3));
    }

    #[test]
    fn test_state_serializes_session_as_hex() {
        let mut state = SessionState::new();
        state.session_id = Some(SessionId([0xab; 16]));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["session_id"], "ab".repeat(16));
        assert_eq!(json["needs"]["session"], true);
    }
}
