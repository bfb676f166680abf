//! ONC RPC over TCP framing
//!
//! Every message is prefixed by a 4-byte big-endian record mark: the top bit
//! flags the last fragment, the low 31 bits give the fragment length. The
//! engine only sends and accepts single-fragment records.
//!
//! ```text
//! +-------------+-----+----------------------------------------+
//! | record mark | xid | rest of RPC message                    |
//! +-------------+-----+----------------------------------------+
//!    4 bytes      4      len - 4 bytes
//!                 |<------------- len ------------------------>|
//! ```

use crate::error::{ProxyError, Result};
use crate::pool::CallContext;
use bytes::{Buf, BufMut};
use nfs4proto::{
    AcceptStat, CallHeader, CompoundArgs, CompoundRes, OpaqueAuth, RejectStat, ReplyBody,
    ReplyHeader, Xdr, NFSPROC4_COMPOUND,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const RECORD_MARK_SIZE: usize = 4;
pub const RECORD_MARK_LAST: u32 = 0x8000_0000;

/// Record mark plus xid: what the dispatcher reads before it knows the owner
pub const FRAME_HEADER_SIZE: usize = 8;

/// Record mark for a single-fragment record of `len` bytes
pub fn record_mark(len: usize) -> u32 {
    RECORD_MARK_LAST | (len as u32 & !RECORD_MARK_LAST)
}

/// Length of the record following `mark`.
///
/// Multi-fragment records and records too short to hold an xid mean the
/// stream is out of step with the peer.
pub fn parse_record_mark(mark: u32) -> Result<usize> {
    if mark & RECORD_MARK_LAST == 0 {
        return Err(ProxyError::protocol_error(format!(
            "record mark {:#010x} is not a last fragment",
            mark
        )));
    }
    let len = (mark & !RECORD_MARK_LAST) as usize;
    if len < 4 {
        return Err(ProxyError::protocol_error(format!(
            "record of {} bytes cannot hold an xid",
            len
        )));
    }
    Ok(len)
}

/// Split the 8-byte frame header into (record length, xid)
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<(usize, u32)> {
    let mut buf = &header[..];
    let len = parse_record_mark(buf.get_u32())?;
    Ok((len, buf.get_u32()))
}

/// Transaction id source.
///
/// Ids increase by one per call and wrap at 2^32; a wrapped id colliding
/// with a call still outstanding is skipped by the sender.
#[derive(Debug)]
pub struct XidGenerator {
    next: AtomicU32,
}

impl XidGenerator {
    pub fn new(seed: u32) -> Self {
        Self {
            next: AtomicU32::new(seed),
        }
    }

    /// Seeded from the current time and the process id, so a restarted
    /// proxy does not reuse the ids of its previous life
    pub fn from_process() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::new(secs as u32 ^ std::process::id())
    }

    pub fn next_xid(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Encode a COMPOUND call into the context's send buffer.
///
/// Returns the full frame length, record mark included. Fails with an
/// encode error if the call does not fit the buffer's capacity.
pub fn encode_call(
    ctx: &mut CallContext,
    xid: u32,
    program: u32,
    version: u32,
    cred: &OpaqueAuth,
    args: &CompoundArgs,
) -> Result<usize> {
    let capacity = ctx.send_capacity();
    ctx.send_buf.clear();

    let header = CallHeader {
        xid,
        program,
        version,
        procedure: NFSPROC4_COMPOUND,
        cred: cred.clone(),
        verf: OpaqueAuth::none(),
    };

    {
        let mut out = (&mut ctx.send_buf).limit(capacity);
        0u32.encode(&mut out).map_err(ProxyError::Encode)?;
        header.encode(&mut out).map_err(ProxyError::Encode)?;
        args.encode(&mut out).map_err(ProxyError::Encode)?;
    }

    let len = ctx.send_buf.len();
    let mark = record_mark(len - RECORD_MARK_SIZE);
    ctx.send_buf[..RECORD_MARK_SIZE].copy_from_slice(&mark.to_be_bytes());
    Ok(len)
}

/// Decode a reply record (everything after the record mark).
///
/// RPC-level rejections map to their own error variants; a COMPOUND that
/// the server processed comes back as `Ok` whatever its NFS status.
pub fn decode_reply(expected_xid: u32, frame: &[u8]) -> Result<CompoundRes> {
    let mut buf = frame;
    let header = ReplyHeader::decode(&mut buf).map_err(ProxyError::Decode)?;
    if header.xid != expected_xid {
        return Err(ProxyError::protocol_error(format!(
            "reply xid {:#x} delivered to call {:#x}",
            header.xid, expected_xid
        )));
    }

    match header.body {
        ReplyBody::Accepted { stat, .. } => match stat {
            AcceptStat::Success => CompoundRes::decode(&mut buf).map_err(ProxyError::Decode),
            AcceptStat::ProgUnavail => Err(ProxyError::ProgUnavail),
            AcceptStat::ProgMismatch { low, high } => Err(ProxyError::ProgMismatch { low, high }),
            AcceptStat::ProcUnavail => Err(ProxyError::ProcUnavail),
            AcceptStat::GarbageArgs => Err(ProxyError::GarbageArgs),
            AcceptStat::SystemErr => Err(ProxyError::SystemErr),
        },
        ReplyBody::Denied(RejectStat::RpcMismatch { low, high }) => {
            Err(ProxyError::RpcMismatch { low, high })
        }
        ReplyBody::Denied(RejectStat::AuthError(stat)) => Err(ProxyError::AuthError(stat)),
    }
}
