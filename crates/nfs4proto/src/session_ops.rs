//! NFSv4.1 session and identity operations
//!
//! Argument and result bodies for the operations the proxy issues on its own
//! behalf: SEQUENCE, EXCHANGE_ID, CREATE_SESSION, DESTROY_SESSION,
//! RECLAIM_COMPLETE, plus GETATTR with the attribute values kept opaque.

use crate::nfs4::{NFS4_OPAQUE_LIMIT, NFS4_SESSIONID_SIZE, NFS4_VERIFIER_SIZE};
use crate::rpc::AuthSysParams;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use std::fmt;
use xdr::{decode_opaque_bounded, encode_opaque, opaque_size, Result, Xdr, XdrError};

/// Server-assigned session identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub [u8; NFS4_SESSIONID_SIZE]);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Xdr for SessionId {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.0.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self(<[u8; NFS4_SESSIONID_SIZE]>::decode(buf)?))
    }

    fn encoded_size(&self) -> usize {
        NFS4_SESSIONID_SIZE
    }
}

pub type Verifier = [u8; NFS4_VERIFIER_SIZE];

bitflags! {
    /// `sr_status_flags` of a SEQUENCE reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SeqStatusFlags: u32 {
        const CB_PATH_DOWN = 0x0000_0001;
        const CB_GSS_CONTEXTS_EXPIRING = 0x0000_0002;
        const CB_GSS_CONTEXTS_EXPIRED = 0x0000_0004;
        const EXPIRED_ALL_STATE_REVOKED = 0x0000_0008;
        const EXPIRED_SOME_STATE_REVOKED = 0x0000_0010;
        const ADMIN_STATE_REVOKED = 0x0000_0020;
        const RECALLABLE_STATE_REVOKED = 0x0000_0040;
        const LEASE_MOVED = 0x0000_0080;
        const RESTART_RECLAIM_NEEDED = 0x0000_0100;
        const CB_PATH_DOWN_SESSION = 0x0000_0200;
        const BACKCHANNEL_FAULT = 0x0000_0400;
        const DEVID_CHANGED = 0x0000_0800;
        const DEVID_DELETED = 0x0000_1000;
    }
}

bitflags! {
    /// `eia_flags` / `eir_flags` of EXCHANGE_ID
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExchangeIdFlags: u32 {
        const SUPP_MOVED_REFER = 0x0000_0001;
        const SUPP_MOVED_MIGR = 0x0000_0002;
        const BIND_PRINC_STATEID = 0x0000_0100;
        const USE_NON_PNFS = 0x0001_0000;
        const USE_PNFS_MDS = 0x0002_0000;
        const USE_PNFS_DS = 0x0004_0000;
        const UPD_CONFIRMED_REC_A = 0x4000_0000;
        const CONFIRMED_R = 0x8000_0000;
    }
}

bitflags! {
    /// `csa_flags` / `csr_flags` of CREATE_SESSION
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CreateSessionFlags: u32 {
        const PERSIST = 0x0000_0001;
        const CONN_BACK_CHAN = 0x0000_0002;
        const CONN_RDMA = 0x0000_0004;
    }
}

/// SEQUENCE4args
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceArgs {
    pub session_id: SessionId,
    pub sequence_id: u32,
    pub slot_id: u32,
    pub highest_slot_id: u32,
    pub cache_this: bool,
}

impl Xdr for SequenceArgs {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.session_id.encode(buf)?;
        self.sequence_id.encode(buf)?;
        self.slot_id.encode(buf)?;
        self.highest_slot_id.encode(buf)?;
        self.cache_this.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            session_id: SessionId::decode(buf)?,
            sequence_id: u32::decode(buf)?,
            slot_id: u32::decode(buf)?,
            highest_slot_id: u32::decode(buf)?,
            cache_this: bool::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        NFS4_SESSIONID_SIZE + 16
    }
}

/// SEQUENCE4resok
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceResOk {
    pub session_id: SessionId,
    pub sequence_id: u32,
    pub slot_id: u32,
    pub highest_slot_id: u32,
    pub target_highest_slot_id: u32,
    pub status_flags: SeqStatusFlags,
}

impl Xdr for SequenceResOk {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.session_id.encode(buf)?;
        self.sequence_id.encode(buf)?;
        self.slot_id.encode(buf)?;
        self.highest_slot_id.encode(buf)?;
        self.target_highest_slot_id.encode(buf)?;
        self.status_flags.bits().encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            session_id: SessionId::decode(buf)?,
            sequence_id: u32::decode(buf)?,
            slot_id: u32::decode(buf)?,
            highest_slot_id: u32::decode(buf)?,
            target_highest_slot_id: u32::decode(buf)?,
            // Unknown bits are kept so callers can still see "something is set".
            status_flags: SeqStatusFlags::from_bits_retain(u32::decode(buf)?),
        })
    }

    fn encoded_size(&self) -> usize {
        NFS4_SESSIONID_SIZE + 20
    }
}

/// `nfstime4`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NfsTime {
    pub seconds: i64,
    pub nseconds: u32,
}

impl Xdr for NfsTime {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.seconds.encode(buf)?;
        self.nseconds.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            seconds: i64::decode(buf)?,
            nseconds: u32::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        12
    }
}

/// `nfs_impl_id4`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsImplId {
    pub domain: String,
    pub name: String,
    pub date: NfsTime,
}

impl Xdr for NfsImplId {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.domain.encode(buf)?;
        self.name.encode(buf)?;
        self.date.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            domain: String::decode(buf)?,
            name: String::decode(buf)?,
            date: NfsTime::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        self.domain.encoded_size() + self.name.encoded_size() + 12
    }
}

// `nfs_impl_id4 eia_client_impl_id<1>` is a counted array of at most one.
fn encode_impl_id<B: BufMut>(buf: &mut B, id: &Option<NfsImplId>) -> Result<()> {
    match id {
        Some(id) => {
            1u32.encode(buf)?;
            id.encode(buf)
        }
        None => 0u32.encode(buf),
    }
}

fn decode_impl_id<B: Buf>(buf: &mut B) -> Result<Option<NfsImplId>> {
    match u32::decode(buf)? {
        0 => Ok(None),
        1 => Ok(Some(NfsImplId::decode(buf)?)),
        n => Err(XdrError::TooLong {
            what: "impl_id",
            len: n as usize,
            max: 1,
        }),
    }
}

fn impl_id_size(id: &Option<NfsImplId>) -> usize {
    4 + id.as_ref().map_or(0, Xdr::encoded_size)
}

/// `client_owner4`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOwner {
    pub verifier: Verifier,
    pub owner_id: Bytes,
}

impl Xdr for ClientOwner {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.owner_id.len() > NFS4_OPAQUE_LIMIT {
            return Err(XdrError::TooLong {
                what: "client owner",
                len: self.owner_id.len(),
                max: NFS4_OPAQUE_LIMIT,
            });
        }
        self.verifier.encode(buf)?;
        encode_opaque(buf, &self.owner_id)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            verifier: Verifier::decode(buf)?,
            owner_id: decode_opaque_bounded(buf, NFS4_OPAQUE_LIMIT)?,
        })
    }

    fn encoded_size(&self) -> usize {
        NFS4_VERIFIER_SIZE + opaque_size(self.owner_id.len())
    }
}

/// `state_protect_how4`; only SP4_NONE is spoken
pub const SP4_NONE: u32 = 0;

/// EXCHANGE_ID4args with `spa_how = SP4_NONE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeIdArgs {
    pub client_owner: ClientOwner,
    pub flags: ExchangeIdFlags,
    pub impl_id: Option<NfsImplId>,
}

impl Xdr for ExchangeIdArgs {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.client_owner.encode(buf)?;
        self.flags.bits().encode(buf)?;
        SP4_NONE.encode(buf)?;
        encode_impl_id(buf, &self.impl_id)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let client_owner = ClientOwner::decode(buf)?;
        let flags = ExchangeIdFlags::from_bits_retain(u32::decode(buf)?);
        let how = u32::decode(buf)?;
        if how != SP4_NONE {
            return Err(XdrError::invalid_data(format!(
                "unsupported state protection {}",
                how
            )));
        }
        Ok(Self {
            client_owner,
            flags,
            impl_id: decode_impl_id(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        self.client_owner.encoded_size() + 8 + impl_id_size(&self.impl_id)
    }
}

/// `server_owner4`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerOwner {
    pub minor_id: u64,
    pub major_id: Bytes,
}

impl Xdr for ServerOwner {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.minor_id.encode(buf)?;
        encode_opaque(buf, &self.major_id)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            minor_id: u64::decode(buf)?,
            major_id: decode_opaque_bounded(buf, NFS4_OPAQUE_LIMIT)?,
        })
    }

    fn encoded_size(&self) -> usize {
        8 + opaque_size(self.major_id.len())
    }
}

/// EXCHANGE_ID4resok
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeIdResOk {
    pub client_id: u64,
    pub sequence_id: u32,
    pub flags: ExchangeIdFlags,
    pub server_owner: ServerOwner,
    pub server_scope: Bytes,
    pub impl_id: Option<NfsImplId>,
}

impl Xdr for ExchangeIdResOk {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.client_id.encode(buf)?;
        self.sequence_id.encode(buf)?;
        self.flags.bits().encode(buf)?;
        SP4_NONE.encode(buf)?;
        self.server_owner.encode(buf)?;
        encode_opaque(buf, &self.server_scope)?;
        encode_impl_id(buf, &self.impl_id)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let client_id = u64::decode(buf)?;
        let sequence_id = u32::decode(buf)?;
        let flags = ExchangeIdFlags::from_bits_retain(u32::decode(buf)?);
        let how = u32::decode(buf)?;
        if how != SP4_NONE {
            return Err(XdrError::invalid_data(format!(
                "server chose state protection {}",
                how
            )));
        }
        Ok(Self {
            client_id,
            sequence_id,
            flags,
            server_owner: ServerOwner::decode(buf)?,
            server_scope: decode_opaque_bounded(buf, NFS4_OPAQUE_LIMIT)?,
            impl_id: decode_impl_id(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        8 + 4
            + 4
            + 4
            + self.server_owner.encoded_size()
            + opaque_size(self.server_scope.len())
            + impl_id_size(&self.impl_id)
    }
}

/// `channel_attrs4`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelAttrs {
    pub header_pad_size: u32,
    pub max_request_size: u32,
    pub max_response_size: u32,
    pub max_response_size_cached: u32,
    pub max_operations: u32,
    pub max_requests: u32,
    pub rdma_ird: Option<u32>,
}

impl Xdr for ChannelAttrs {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.header_pad_size.encode(buf)?;
        self.max_request_size.encode(buf)?;
        self.max_response_size.encode(buf)?;
        self.max_response_size_cached.encode(buf)?;
        self.max_operations.encode(buf)?;
        self.max_requests.encode(buf)?;
        // `ca_rdma_ird<1>`
        match self.rdma_ird {
            Some(ird) => {
                1u32.encode(buf)?;
                ird.encode(buf)
            }
            None => 0u32.encode(buf),
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let mut attrs = Self {
            header_pad_size: u32::decode(buf)?,
            max_request_size: u32::decode(buf)?,
            max_response_size: u32::decode(buf)?,
            max_response_size_cached: u32::decode(buf)?,
            max_operations: u32::decode(buf)?,
            max_requests: u32::decode(buf)?,
            rdma_ird: None,
        };
        attrs.rdma_ird = match u32::decode(buf)? {
            0 => None,
            1 => Some(u32::decode(buf)?),
            n => {
                return Err(XdrError::TooLong {
                    what: "rdma_ird",
                    len: n as usize,
                    max: 1,
                })
            }
        };
        Ok(attrs)
    }

    fn encoded_size(&self) -> usize {
        7 * 4 + if self.rdma_ird.is_some() { 4 } else { 0 }
    }
}

/// `callback_sec_parms4`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackSecParms {
    AuthNone,
    AuthSys(AuthSysParams),
}

impl Xdr for CallbackSecParms {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            CallbackSecParms::AuthNone => 0u32.encode(buf),
            CallbackSecParms::AuthSys(params) => {
                1u32.encode(buf)?;
                params.encode(buf)
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        match u32::decode(buf)? {
            0 => Ok(CallbackSecParms::AuthNone),
            1 => Ok(CallbackSecParms::AuthSys(AuthSysParams::decode(buf)?)),
            flavor => Err(XdrError::invalid_data(format!(
                "unsupported callback security flavor {}",
                flavor
            ))),
        }
    }

    fn encoded_size(&self) -> usize {
        match self {
            CallbackSecParms::AuthNone => 4,
            CallbackSecParms::AuthSys(params) => 4 + params.encoded_size(),
        }
    }
}

/// CREATE_SESSION4args
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionArgs {
    pub client_id: u64,
    pub sequence_id: u32,
    pub flags: CreateSessionFlags,
    pub fore_channel: ChannelAttrs,
    pub back_channel: ChannelAttrs,
    pub cb_program: u32,
    pub sec_parms: Vec<CallbackSecParms>,
}

impl Xdr for CreateSessionArgs {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.client_id.encode(buf)?;
        self.sequence_id.encode(buf)?;
        self.flags.bits().encode(buf)?;
        self.fore_channel.encode(buf)?;
        self.back_channel.encode(buf)?;
        self.cb_program.encode(buf)?;
        self.sec_parms.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            client_id: u64::decode(buf)?,
            sequence_id: u32::decode(buf)?,
            flags: CreateSessionFlags::from_bits_retain(u32::decode(buf)?),
            fore_channel: ChannelAttrs::decode(buf)?,
            back_channel: ChannelAttrs::decode(buf)?,
            cb_program: u32::decode(buf)?,
            sec_parms: Vec::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        8 + 4
            + 4
            + self.fore_channel.encoded_size()
            + self.back_channel.encoded_size()
            + 4
            + self.sec_parms.encoded_size()
    }
}

/// CREATE_SESSION4resok
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionResOk {
    pub session_id: SessionId,
    pub sequence_id: u32,
    pub flags: CreateSessionFlags,
    pub fore_channel: ChannelAttrs,
    pub back_channel: ChannelAttrs,
}

impl Xdr for CreateSessionResOk {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.session_id.encode(buf)?;
        self.sequence_id.encode(buf)?;
        self.flags.bits().encode(buf)?;
        self.fore_channel.encode(buf)?;
        self.back_channel.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            session_id: SessionId::decode(buf)?,
            sequence_id: u32::decode(buf)?,
            flags: CreateSessionFlags::from_bits_retain(u32::decode(buf)?),
            fore_channel: ChannelAttrs::decode(buf)?,
            back_channel: ChannelAttrs::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        NFS4_SESSIONID_SIZE
            + 8
            + self.fore_channel.encoded_size()
            + self.back_channel.encoded_size()
    }
}

/// `fattr4`: attribute mask plus the packed attribute values
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fattr4 {
    pub mask: Vec<u32>,
    pub values: Bytes,
}

impl Fattr4 {
    /// Build a GETATTR request bitmap from attribute numbers
    pub fn bitmap(attrs: &[u32]) -> Vec<u32> {
        let words = attrs.iter().map(|a| *a as usize / 32 + 1).max().unwrap_or(0);
        let mut mask = vec![0u32; words];
        for attr in attrs {
            mask[*attr as usize / 32] |= 1 << (attr % 32);
        }
        mask
    }

    pub fn has(&self, attr: u32) -> bool {
        self.mask
            .get(attr as usize / 32)
            .is_some_and(|word| word & (1 << (attr % 32)) != 0)
    }

    /// `lease_time` in seconds, when it is the only attribute present.
    ///
    /// Values are packed in attribute-number order and the lower-numbered
    /// attributes are not all fixed width, so anything else is left to the
    /// caller.
    pub fn lease_time(&self) -> Option<u32> {
        use crate::nfs4::FATTR4_LEASE_TIME;

        let only_lease = !self.mask.is_empty()
            && self.mask.iter().enumerate().all(|(i, word)| match i {
                0 => *word == 1 << FATTR4_LEASE_TIME,
                _ => *word == 0,
            });
        if !only_lease {
            return None;
        }
        u32::decode(&mut self.values.clone()).ok()
    }
}

impl Xdr for Fattr4 {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.mask.encode(buf)?;
        encode_opaque(buf, &self.values)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            mask: Vec::decode(buf)?,
            values: Bytes::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        self.mask.encoded_size() + opaque_size(self.values.len())
    }
}
