//! NFSv4.1 protocol constants (RFC 5661 / RFC 5662)

pub const NFS_PROGRAM: u32 = 100003;
pub const NFS_V4: u32 = 4;
pub const NFS_V4_MINOR: u32 = 1;

pub const NFSPROC4_NULL: u32 = 0;
pub const NFSPROC4_COMPOUND: u32 = 1;

pub const NFS4_SESSIONID_SIZE: usize = 16;
pub const NFS4_VERIFIER_SIZE: usize = 8;
pub const NFS4_OPAQUE_LIMIT: usize = 1024;

/// Attribute number of `lease_time` in the GETATTR bitmap
pub const FATTR4_LEASE_TIME: u32 = 10;

/// Operation numbers (`nfs_opnum4`)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u32)]
pub enum NfsOpcode {
    Access = 3,
    Close = 4,
    Commit = 5,
    Create = 6,
    GetAttr = 9,
    GetFh = 10,
    Link = 11,
    Lookup = 15,
    Open = 18,
    PutFh = 22,
    PutRootFh = 24,
    Read = 25,
    ReadDir = 26,
    ReadLink = 27,
    Remove = 28,
    Rename = 29,
    SetAttr = 34,
    Write = 38,
    ExchangeId = 42,
    CreateSession = 43,
    DestroySession = 44,
    Sequence = 53,
    DestroyClientId = 57,
    ReclaimComplete = 58,
}

impl NfsOpcode {
    pub fn as_u32(self) -> u32 {
        self.into()
    }
}

/// `nfsstat4` values the session engine needs to recognise. Any other value
/// is passed through to the caller unchanged.
pub type NfsStat4 = u32;

pub const NFS4_OK: NfsStat4 = 0;
pub const NFS4ERR_PERM: NfsStat4 = 1;
pub const NFS4ERR_NOENT: NfsStat4 = 2;
pub const NFS4ERR_IO: NfsStat4 = 5;
pub const NFS4ERR_ACCESS: NfsStat4 = 13;
pub const NFS4ERR_INVAL: NfsStat4 = 22;
pub const NFS4ERR_DELAY: NfsStat4 = 10008;
pub const NFS4ERR_RESOURCE: NfsStat4 = 10018;
pub const NFS4ERR_SERVERFAULT: NfsStat4 = 10006;
pub const NFS4ERR_STALE_CLIENTID: NfsStat4 = 10022;
pub const NFS4ERR_EXPIRED: NfsStat4 = 10011;
pub const NFS4ERR_BADSESSION: NfsStat4 = 10052;
pub const NFS4ERR_BADSLOT: NfsStat4 = 10053;
pub const NFS4ERR_SEQ_MISORDERED: NfsStat4 = 10063;
pub const NFS4ERR_SEQUENCE_POS: NfsStat4 = 10064;
pub const NFS4ERR_OP_NOT_IN_SESSION: NfsStat4 = 10071;
pub const NFS4ERR_COMPLETE_ALREADY: NfsStat4 = 10054;
pub const NFS4ERR_DEADSESSION: NfsStat4 = 10078;
pub const NFS4ERR_CLID_INUSE: NfsStat4 = 10017;

/// Short symbolic name of a status, for logs
pub fn nfsstat_name(status: NfsStat4) -> &'static str {
    match status {
        NFS4_OK => "NFS4_OK",
        NFS4ERR_PERM => "NFS4ERR_PERM",
        NFS4ERR_NOENT => "NFS4ERR_NOENT",
        NFS4ERR_IO => "NFS4ERR_IO",
        NFS4ERR_ACCESS => "NFS4ERR_ACCESS",
        NFS4ERR_INVAL => "NFS4ERR_INVAL",
        NFS4ERR_DELAY => "NFS4ERR_DELAY",
        NFS4ERR_RESOURCE => "NFS4ERR_RESOURCE",
        NFS4ERR_SERVERFAULT => "NFS4ERR_SERVERFAULT",
        NFS4ERR_STALE_CLIENTID => "NFS4ERR_STALE_CLIENTID",
        NFS4ERR_EXPIRED => "NFS4ERR_EXPIRED",
        NFS4ERR_BADSESSION => "NFS4ERR_BADSESSION",
        NFS4ERR_BADSLOT => "NFS4ERR_BADSLOT",
        NFS4ERR_SEQ_MISORDERED => "NFS4ERR_SEQ_MISORDERED",
        NFS4ERR_SEQUENCE_POS => "NFS4ERR_SEQUENCE_POS",
        NFS4ERR_OP_NOT_IN_SESSION => "NFS4ERR_OP_NOT_IN_SESSION",
        NFS4ERR_COMPLETE_ALREADY => "NFS4ERR_COMPLETE_ALREADY",
        NFS4ERR_DEADSESSION => "NFS4ERR_DEADSESSION",
        NFS4ERR_CLID_INUSE => "NFS4ERR_CLID_INUSE",
        _ => "NFS4ERR_UNKNOWN",
    }
}

/// Statuses that mean the client identity itself is gone, not just the session
pub fn is_client_identity_error(status: NfsStat4) -> bool {
    matches!(status, NFS4ERR_STALE_CLIENTID | NFS4ERR_EXPIRED)
}
