//! COMPOUND procedure arguments and results
//!
//! Operations the proxy issues itself are fully typed. Everything else is
//! carried as an opaque body the caller already encoded, so filesystem
//! operations can travel through the engine without it knowing their shape.

use crate::nfs4::{nfsstat_name, NfsOpcode, NfsStat4, NFS4_OK, NFS_V4_MINOR};
use crate::session_ops::{
    CreateSessionArgs, CreateSessionResOk, ExchangeIdArgs, ExchangeIdResOk, Fattr4, SequenceArgs,
    SequenceResOk, SessionId,
};
use bytes::{Buf, BufMut, Bytes};
use xdr::{Result, Xdr, XdrError, XDR_UNIT};

/// Per-operation outcome: the `resok` body or the failing status
pub type OpResult<T> = std::result::Result<T, NfsStat4>;

/// One entry of `argarray`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgOp {
    Sequence(SequenceArgs),
    ExchangeId(ExchangeIdArgs),
    CreateSession(CreateSessionArgs),
    DestroySession(SessionId),
    ReclaimComplete { one_fs: bool },
    PutRootFh,
    GetAttr(Vec<u32>),
    /// Operation encoded by the caller; `body` must be XDR-aligned
    Opaque { opcode: u32, body: Bytes },
}

impl ArgOp {
    pub fn opcode(&self) -> u32 {
        match self {
            ArgOp::Sequence(_) => NfsOpcode::Sequence.as_u32(),
            ArgOp::ExchangeId(_) => NfsOpcode::ExchangeId.as_u32(),
            ArgOp::CreateSession(_) => NfsOpcode::CreateSession.as_u32(),
            ArgOp::DestroySession(_) => NfsOpcode::DestroySession.as_u32(),
            ArgOp::ReclaimComplete { .. } => NfsOpcode::ReclaimComplete.as_u32(),
            ArgOp::PutRootFh => NfsOpcode::PutRootFh.as_u32(),
            ArgOp::GetAttr(_) => NfsOpcode::GetAttr.as_u32(),
            ArgOp::Opaque { opcode, .. } => *opcode,
        }
    }
}

impl Xdr for ArgOp {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.opcode().encode(buf)?;
        match self {
            ArgOp::Sequence(args) => args.encode(buf),
            ArgOp::ExchangeId(args) => args.encode(buf),
            ArgOp::CreateSession(args) => args.encode(buf),
            ArgOp::DestroySession(id) => id.encode(buf),
            ArgOp::ReclaimComplete { one_fs } => one_fs.encode(buf),
            ArgOp::PutRootFh => Ok(()),
            ArgOp::GetAttr(mask) => mask.encode(buf),
            ArgOp::Opaque { opcode, body } => {
                if body.len() % XDR_UNIT != 0 {
                    return Err(XdrError::invalid_data(format!(
                        "opaque body of op {} is {} bytes, not word aligned",
                        opcode,
                        body.len()
                    )));
                }
                if buf.remaining_mut() < body.len() {
                    return Err(XdrError::BufferFull {
                        what: "opaque op",
                        need: body.len(),
                        have: buf.remaining_mut(),
                    });
                }
                buf.put_slice(body);
                Ok(())
            }
        }
    }

    /// Decodes one operation. An operation without a typed body swallows the
    /// rest of the buffer, since its length is unknown here.
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let opcode = u32::decode(buf)?;
        let op = match NfsOpcode::try_from(opcode) {
            Ok(NfsOpcode::Sequence) => ArgOp::Sequence(SequenceArgs::decode(buf)?),
            Ok(NfsOpcode::ExchangeId) => ArgOp::ExchangeId(ExchangeIdArgs::decode(buf)?),
            Ok(NfsOpcode::CreateSession) => ArgOp::CreateSession(CreateSessionArgs::decode(buf)?),
            Ok(NfsOpcode::DestroySession) => ArgOp::DestroySession(SessionId::decode(buf)?),
            Ok(NfsOpcode::ReclaimComplete) => ArgOp::ReclaimComplete {
                one_fs: bool::decode(buf)?,
            },
            Ok(NfsOpcode::PutRootFh) => ArgOp::PutRootFh,
            Ok(NfsOpcode::GetAttr) => ArgOp::GetAttr(Vec::decode(buf)?),
            _ => ArgOp::Opaque {
                opcode,
                body: buf.copy_to_bytes(buf.remaining()),
            },
        };
        Ok(op)
    }

    fn encoded_size(&self) -> usize {
        4 + match self {
            ArgOp::Sequence(args) => args.encoded_size(),
            ArgOp::ExchangeId(args) => args.encoded_size(),
            ArgOp::CreateSession(args) => args.encoded_size(),
            ArgOp::DestroySession(id) => id.encoded_size(),
            ArgOp::ReclaimComplete { .. } => 4,
            ArgOp::PutRootFh => 0,
            ArgOp::GetAttr(mask) => mask.encoded_size(),
            ArgOp::Opaque { body, .. } => body.len(),
        }
    }
}

/// One entry of `resarray`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResOp {
    Sequence(OpResult<SequenceResOk>),
    ExchangeId(OpResult<ExchangeIdResOk>),
    CreateSession(OpResult<CreateSessionResOk>),
    DestroySession(NfsStat4),
    ReclaimComplete(NfsStat4),
    PutRootFh(NfsStat4),
    GetAttr(OpResult<Fattr4>),
    /// Result of an operation the engine does not decode. `body` is every
    /// byte after the status, so it is always the last entry.
    Opaque {
        opcode: u32,
        status: NfsStat4,
        body: Bytes,
    },
}

fn status_of<T>(res: &OpResult<T>) -> NfsStat4 {
    match res {
        Ok(_) => NFS4_OK,
        Err(status) => *status,
    }
}

fn encode_op_result<T: Xdr, B: BufMut>(res: &OpResult<T>, buf: &mut B) -> Result<()> {
    match res {
        Ok(body) => {
            NFS4_OK.encode(buf)?;
            body.encode(buf)
        }
        Err(status) => status.encode(buf),
    }
}

fn decode_op_result<T: Xdr, B: Buf>(buf: &mut B) -> Result<OpResult<T>> {
    match u32::decode(buf)? {
        NFS4_OK => Ok(Ok(T::decode(buf)?)),
        status => Ok(Err(status)),
    }
}

impl ResOp {
    pub fn opcode(&self) -> u32 {
        match self {
            ResOp::Sequence(_) => NfsOpcode::Sequence.as_u32(),
            ResOp::ExchangeId(_) => NfsOpcode::ExchangeId.as_u32(),
            ResOp::CreateSession(_) => NfsOpcode::CreateSession.as_u32(),
            ResOp::DestroySession(_) => NfsOpcode::DestroySession.as_u32(),
            ResOp::ReclaimComplete(_) => NfsOpcode::ReclaimComplete.as_u32(),
            ResOp::PutRootFh(_) => NfsOpcode::PutRootFh.as_u32(),
            ResOp::GetAttr(_) => NfsOpcode::GetAttr.as_u32(),
            ResOp::Opaque { opcode, .. } => *opcode,
        }
    }

    pub fn status(&self) -> NfsStat4 {
        match self {
            ResOp::Sequence(res) => status_of(res),
            ResOp::ExchangeId(res) => status_of(res),
            ResOp::CreateSession(res) => status_of(res),
            ResOp::GetAttr(res) => status_of(res),
            ResOp::DestroySession(status)
            | ResOp::ReclaimComplete(status)
            | ResOp::PutRootFh(status)
            | ResOp::Opaque { status, .. } => *status,
        }
    }
}

impl Xdr for ResOp {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.opcode().encode(buf)?;
        match self {
            ResOp::Sequence(res) => encode_op_result(res, buf),
            ResOp::ExchangeId(res) => encode_op_result(res, buf),
            ResOp::CreateSession(res) => encode_op_result(res, buf),
            ResOp::GetAttr(res) => encode_op_result(res, buf),
            ResOp::DestroySession(status)
            | ResOp::ReclaimComplete(status)
            | ResOp::PutRootFh(status) => status.encode(buf),
            ResOp::Opaque { status, body, .. } => {
                status.encode(buf)?;
                if buf.remaining_mut() < body.len() {
                    return Err(XdrError::BufferFull {
                        what: "opaque result",
                        need: body.len(),
                        have: buf.remaining_mut(),
                    });
                }
                buf.put_slice(body);
                Ok(())
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let opcode = u32::decode(buf)?;
        let op = match NfsOpcode::try_from(opcode) {
            Ok(NfsOpcode::Sequence) => ResOp::Sequence(decode_op_result(buf)?),
            Ok(NfsOpcode::ExchangeId) => ResOp::ExchangeId(decode_op_result(buf)?),
            Ok(NfsOpcode::CreateSession) => ResOp::CreateSession(decode_op_result(buf)?),
            Ok(NfsOpcode::GetAttr) => ResOp::GetAttr(decode_op_result(buf)?),
            Ok(NfsOpcode::DestroySession) => ResOp::DestroySession(u32::decode(buf)?),
            Ok(NfsOpcode::ReclaimComplete) => ResOp::ReclaimComplete(u32::decode(buf)?),
            Ok(NfsOpcode::PutRootFh) => ResOp::PutRootFh(u32::decode(buf)?),
            _ => ResOp::Opaque {
                opcode,
                status: u32::decode(buf)?,
                body: buf.copy_to_bytes(buf.remaining()),
            },
        };
        Ok(op)
    }

    fn encoded_size(&self) -> usize {
        fn sized<T: Xdr>(res: &OpResult<T>) -> usize {
            4 + res.as_ref().map_or(0, Xdr::encoded_size)
        }
        4 + match self {
            ResOp::Sequence(res) => sized(res),
            ResOp::ExchangeId(res) => sized(res),
            ResOp::CreateSession(res) => sized(res),
            ResOp::GetAttr(res) => sized(res),
            ResOp::DestroySession(_) | ResOp::ReclaimComplete(_) | ResOp::PutRootFh(_) => 4,
            ResOp::Opaque { body, .. } => 4 + body.len(),
        }
    }
}

/// COMPOUND4args
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundArgs {
    pub tag: String,
    pub minor_version: u32,
    pub ops: Vec<ArgOp>,
}

impl CompoundArgs {
    pub fn new(ops: Vec<ArgOp>) -> Self {
        Self {
            tag: String::new(),
            minor_version: NFS_V4_MINOR,
            ops,
        }
    }

    /// The leading SEQUENCE, if the compound is session-bound
    pub fn sequence_mut(&mut self) -> Option<&mut SequenceArgs> {
        match self.ops.first_mut() {
            Some(ArgOp::Sequence(args)) => Some(args),
            _ => None,
        }
    }

    pub fn starts_with_sequence(&self) -> bool {
        matches!(self.ops.first(), Some(ArgOp::Sequence(_)))
    }
}

impl Xdr for CompoundArgs {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.tag.encode(buf)?;
        self.minor_version.encode(buf)?;
        self.ops.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let tag = String::decode(buf)?;
        let minor_version = u32::decode(buf)?;
        let count = u32::decode(buf)? as usize;
        let mut ops = Vec::new();
        for _ in 0..count {
            if !buf.has_remaining() {
                return Err(XdrError::Truncated {
                    what: "argarray",
                    need: XDR_UNIT,
                    have: 0,
                });
            }
            let op = ArgOp::decode(buf)?;
            let opaque = matches!(op, ArgOp::Opaque { .. });
            ops.push(op);
            if opaque {
                break;
            }
        }
        Ok(Self {
            tag,
            minor_version,
            ops,
        })
    }

    fn encoded_size(&self) -> usize {
        self.tag.encoded_size() + 4 + self.ops.encoded_size()
    }
}

/// COMPOUND4res
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundRes {
    pub status: NfsStat4,
    pub tag: String,
    pub results: Vec<ResOp>,
}

impl CompoundRes {
    pub fn is_ok(&self) -> bool {
        self.status == NFS4_OK
    }

    pub fn status_name(&self) -> &'static str {
        nfsstat_name(self.status)
    }

    /// The leading SEQUENCE result, if any
    pub fn sequence(&self) -> Option<&OpResult<SequenceResOk>> {
        match self.results.first() {
            Some(ResOp::Sequence(res)) => Some(res),
            _ => None,
        }
    }

    /// First result carrying the given opcode
    pub fn find(&self, opcode: NfsOpcode) -> Option<&ResOp> {
        let opcode = opcode.as_u32();
        self.results.iter().find(|r| r.opcode() == opcode)
    }
}

impl Xdr for CompoundRes {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.status.encode(buf)?;
        self.tag.encode(buf)?;
        self.results.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let status = u32::decode(buf)?;
        let tag = String::decode(buf)?;
        let count = u32::decode(buf)? as usize;
        // opcode + status at minimum
        if count > buf.remaining() / (2 * XDR_UNIT) {
            return Err(XdrError::Truncated {
                what: "resarray",
                need: count * 2 * XDR_UNIT,
                have: buf.remaining(),
            });
        }
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            let res = ResOp::decode(buf)?;
            let opaque = matches!(res, ResOp::Opaque { .. });
            results.push(res);
            if opaque {
                break;
            }
        }
        Ok(Self {
            status,
            tag,
            results,
        })
    }

    fn encoded_size(&self) -> usize {
        4 + self.tag.encoded_size() + self.results.encoded_size()
    }
}
