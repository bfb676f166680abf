//! Scripted NFSv4.1 server for integration tests
//!
//! Answers EXCHANGE_ID, CREATE_SESSION, SEQUENCE, RECLAIM_COMPLETE,
//! PUTROOTFH, GETATTR(lease_time) and DESTROY_SESSION the way a real server
//! would. Tests override individual calls with a handler.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use nfs4proto::{
    ArgOp, CallHeader, ChannelAttrs, CompoundArgs, CompoundRes, CreateSessionFlags,
    CreateSessionResOk, ExchangeIdFlags, ExchangeIdResOk, Fattr4, ReplyBody, ReplyHeader, ResOp,
    SeqStatusFlags, SequenceResOk, ServerOwner, SessionId, Xdr, FATTR4_LEASE_TIME,
    NFS4ERR_BADSESSION, NFS4ERR_STALE_CLIENTID, NFS4_OK,
};
use proxyclient::ProxyClientConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const CLIENT_ID: u64 = 0x00c1_1e47;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// One call as the server decoded it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Index of the connection it arrived on, from 0
    pub conn: usize,
    pub header: CallHeader,
    pub args: CompoundArgs,
}

impl RecordedCall {
    pub fn xid(&self) -> u32 {
        self.header.xid
    }

    pub fn first_op(&self) -> Option<&ArgOp> {
        self.args.ops.first()
    }

    pub fn is_exchange_id(&self) -> bool {
        matches!(self.first_op(), Some(ArgOp::ExchangeId(_)))
    }

    pub fn is_create_session(&self) -> bool {
        matches!(self.first_op(), Some(ArgOp::CreateSession(_)))
    }

    /// (slot, sequence id) of a leading SEQUENCE
    pub fn slot_and_sequence(&self) -> Option<(u32, u32)> {
        match self.first_op() {
            Some(ArgOp::Sequence(seq)) => Some((seq.slot_id, seq.sequence_id)),
            _ => None,
        }
    }
}

/// What the server does with one call
pub enum Action {
    Reply(CompoundRes),
    ReplyAfter(Duration, CompoundRes),
    Reject(ReplyBody),
    /// Never answer
    Ignore,
    /// Drop the connection without answering
    Close,
    /// Write these raw records (each already record-marked), then reply
    Prefixed(Vec<Bytes>, CompoundRes),
    /// Reply, then write these raw records
    Followed(CompoundRes, Vec<Bytes>),
}

type Handler = Box<dyn Fn(&RecordedCall) -> Option<Action> + Send + Sync>;

pub struct MockState {
    calls: Mutex<Vec<RecordedCall>>,
    handler: Mutex<Option<Handler>>,
    session: Mutex<Option<SessionId>>,
    sessions_created: AtomicU32,
    connections: AtomicUsize,
    /// Lease reported through GETATTR, in seconds
    pub lease: AtomicU32,
    /// `sr_status_flags` put in every SEQUENCE reply
    pub sequence_flags: AtomicU32,
    /// Status CREATE_SESSION fails with; NFS4_OK lets it succeed
    pub create_session_status: AtomicU32,
    kick: watch::Sender<u64>,
}

impl MockState {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> u32 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<SessionId> {
        *self.session.lock().unwrap()
    }

    /// Forget the session, as a restarted server would
    pub fn forget_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&RecordedCall) -> Option<Action> + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn clear_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Close every open connection
    pub fn kick(&self) {
        self.kick.send_modify(|n| *n += 1);
    }

    fn respond(&self, call: &RecordedCall) -> Action {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            if let Some(action) = handler(call) {
                return action;
            }
        }
        Action::Reply(self.process(call))
    }

    /// Run the compound the way the server normally would
    pub fn process(&self, call: &RecordedCall) -> CompoundRes {
        let mut results = Vec::new();
        let mut status = NFS4_OK;
        for op in &call.args.ops {
            let res = self.process_op(op);
            status = res.status();
            results.push(res);
            if status != NFS4_OK {
                break;
            }
        }
        CompoundRes {
            status,
            tag: call.args.tag.clone(),
            results,
        }
    }

    fn process_op(&self, op: &ArgOp) -> ResOp {
        match op {
            ArgOp::Sequence(args) => {
                if self.current_session() != Some(args.session_id) {
                    return ResOp::Sequence(Err(NFS4ERR_BADSESSION));
                }
                ResOp::Sequence(Ok(SequenceResOk {
                    session_id: args.session_id,
                    sequence_id: args.sequence_id,
                    slot_id: args.slot_id,
                    highest_slot_id: args.highest_slot_id,
                    target_highest_slot_id: args.highest_slot_id,
                    status_flags: SeqStatusFlags::from_bits_retain(
                        self.sequence_flags.load(Ordering::SeqCst),
                    ),
                }))
            }
            ArgOp::ExchangeId(_) => ResOp::ExchangeId(Ok(ExchangeIdResOk {
                client_id: CLIENT_ID,
                sequence_id: 1,
                flags: ExchangeIdFlags::CONFIRMED_R,
                server_owner: ServerOwner {
                    minor_id: 0,
                    major_id: Bytes::from_static(b"mock"),
                },
                server_scope: Bytes::from_static(b"mock"),
                impl_id: None,
            })),
            ArgOp::CreateSession(args) => {
                let failure = self.create_session_status.load(Ordering::SeqCst);
                if failure != NFS4_OK {
                    return ResOp::CreateSession(Err(failure));
                }
                if args.client_id != CLIENT_ID {
                    return ResOp::CreateSession(Err(NFS4ERR_STALE_CLIENTID));
                }
                let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
                let id = SessionId([n as u8; 16]);
                *self.session.lock().unwrap() = Some(id);
                ResOp::CreateSession(Ok(CreateSessionResOk {
                    session_id: id,
                    sequence_id: args.sequence_id,
                    flags: CreateSessionFlags::empty(),
                    fore_channel: args.fore_channel,
                    back_channel: ChannelAttrs {
                        max_requests: 1,
                        ..args.back_channel
                    },
                }))
            }
            ArgOp::DestroySession(id) => {
                let mut session = self.session.lock().unwrap();
                if *session == Some(*id) {
                    *session = None;
                    ResOp::DestroySession(NFS4_OK)
                } else {
                    ResOp::DestroySession(NFS4ERR_BADSESSION)
                }
            }
            ArgOp::ReclaimComplete { .. } => ResOp::ReclaimComplete(NFS4_OK),
            ArgOp::PutRootFh => ResOp::PutRootFh(NFS4_OK),
            ArgOp::GetAttr(_) => ResOp::GetAttr(Ok(Fattr4 {
                mask: Fattr4::bitmap(&[FATTR4_LEASE_TIME]),
                values: Bytes::copy_from_slice(&self.lease.load(Ordering::SeqCst).to_be_bytes()),
            })),
            ArgOp::Opaque { opcode, .. } => ResOp::Opaque {
                opcode: *opcode,
                status: NFS4_OK,
                body: Bytes::new(),
            },
        }
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Listen on a given local port; 0 picks a free one
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            calls: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            session: Mutex::new(None),
            sessions_created: AtomicU32::new(0),
            connections: AtomicUsize::new(0),
            lease: AtomicU32::new(60),
            sequence_flags: AtomicU32::new(0),
            create_session_status: AtomicU32::new(NFS4_OK),
            kick: watch::Sender::new(0),
        });

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let conn = state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(Arc::clone(&state), stream, conn));
                }
            })
        };

        Self { addr, state, task }
    }

    /// Client configuration pointing at this server, with short timers
    pub fn config(&self) -> ProxyClientConfig {
        ProxyClientConfig {
            server_addr: self.addr.ip().to_string(),
            port: self.addr.port(),
            retry_sleep: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(100),
            slots: 4,
            ..Default::default()
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
        self.state.kick();
    }
}

async fn serve(state: Arc<MockState>, stream: TcpStream, conn: usize) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut kicked = state.kick.subscribe();

    loop {
        let call = tokio::select! {
            _ = kicked.changed() => break,
            call = read_call(&mut reader, conn) => match call {
                Some(call) => call,
                None => break,
            },
        };
        state.calls.lock().unwrap().push(call.clone());

        let xid = call.xid();
        match state.respond(&call) {
            Action::Reply(res) => write_record(&writer, &reply_record(xid, &res)).await,
            Action::ReplyAfter(delay, res) => {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_record(&writer, &reply_record(xid, &res)).await;
                });
            }
            Action::Reject(body) => {
                let mut buf = BytesMut::new();
                ReplyHeader { xid, body }.encode(&mut buf).unwrap();
                write_record(&writer, &mark(buf)).await;
            }
            Action::Ignore => {}
            Action::Close => break,
            Action::Prefixed(records, res) => {
                for record in records {
                    write_record(&writer, &record).await;
                }
                write_record(&writer, &reply_record(xid, &res)).await;
            }
            Action::Followed(res, records) => {
                write_record(&writer, &reply_record(xid, &res)).await;
                for record in records {
                    write_record(&writer, &record).await;
                }
            }
        }
    }

    let _ = writer.lock().await.shutdown().await;
}

async fn read_call(reader: &mut tokio::net::tcp::OwnedReadHalf, conn: usize) -> Option<RecordedCall> {
    let mark = reader.read_u32().await.ok()?;
    let mut body = vec![0u8; (mark & 0x7fff_ffff) as usize];
    reader.read_exact(&mut body).await.ok()?;

    let mut buf = &body[..];
    let header = CallHeader::decode(&mut buf).unwrap();
    let args = CompoundArgs::decode(&mut buf).unwrap();
    Some(RecordedCall { conn, header, args })
}

async fn write_record(writer: &tokio::sync::Mutex<OwnedWriteHalf>, record: &[u8]) {
    let _ = writer.lock().await.write_all(record).await;
}

fn mark(body: BytesMut) -> Bytes {
    let mut record = BytesMut::with_capacity(body.len() + 4);
    record.put_u32(0x8000_0000 | body.len() as u32);
    record.extend_from_slice(&body);
    record.freeze()
}

/// A record-marked successful reply carrying `res`
pub fn reply_record(xid: u32, res: &CompoundRes) -> Bytes {
    let mut buf = BytesMut::new();
    ReplyHeader::success(xid).encode(&mut buf).unwrap();
    res.encode(&mut buf).unwrap();
    mark(buf)
}

/// A record-marked frame of `len` bytes after the mark, for an xid nobody
/// is waiting on
pub fn junk_record(xid: u32, len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32(xid);
    buf.resize(len, 0xee);
    mark(buf)
}

/// OK result for a lone PUTROOTFH
pub fn putrootfh_ok() -> CompoundRes {
    CompoundRes {
        status: NFS4_OK,
        tag: String::new(),
        results: vec![ResOp::PutRootFh(NFS4_OK)],
    }
}
