//! ONC RPC v2 message envelope (RFC 5531)
//!
//! Only what a TCP client needs: the call header it sends and the reply
//! header it receives. Procedure arguments and results are encoded by the
//! caller after the header.

use bytes::{Buf, BufMut, Bytes};
use xdr::{decode_opaque_bounded, encode_opaque, opaque_size, Result, Xdr, XdrError};

pub const RPC_VERSION: u32 = 2;

/// Maximum size of an opaque_auth body
pub const MAX_AUTH_BYTES: usize = 400;

/// Maximum length of the AUTH_SYS machine name
pub const MAX_MACHINE_NAME: usize = 255;

/// Maximum number of supplementary groups carried by AUTH_SYS
pub const MAX_AUTH_SYS_GIDS: usize = 16;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u32)]
pub enum MsgType {
    Call = 0,
    Reply = 1,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u32)]
pub enum AuthFlavor {
    None = 0,
    Sys = 1,
    Short = 2,
    Dh = 3,
    RpcSecGss = 6,
}

/// `opaque_auth`: a flavor plus up to 400 bytes of flavor-specific body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Bytes,
}

impl OpaqueAuth {
    pub fn none() -> Self {
        Self {
            flavor: AuthFlavor::None.into(),
            body: Bytes::new(),
        }
    }

    pub fn sys(params: &AuthSysParams) -> Result<Self> {
        let mut body = bytes::BytesMut::with_capacity(params.encoded_size());
        params.encode(&mut body)?;
        if body.len() > MAX_AUTH_BYTES {
            return Err(XdrError::TooLong {
                what: "auth body",
                len: body.len(),
                max: MAX_AUTH_BYTES,
            });
        }
        Ok(Self {
            flavor: AuthFlavor::Sys.into(),
            body: body.freeze(),
        })
    }
}

impl Xdr for OpaqueAuth {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.flavor.encode(buf)?;
        encode_opaque(buf, &self.body)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let flavor = u32::decode(buf)?;
        let body = decode_opaque_bounded(buf, MAX_AUTH_BYTES)?;
        Ok(Self { flavor, body })
    }

    fn encoded_size(&self) -> usize {
        4 + opaque_size(self.body.len())
    }
}

/// `authsys_parms`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSysParams {
    pub stamp: u32,
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl Xdr for AuthSysParams {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.machine_name.len() > MAX_MACHINE_NAME {
            return Err(XdrError::TooLong {
                what: "machine name",
                len: self.machine_name.len(),
                max: MAX_MACHINE_NAME,
            });
        }
        if self.gids.len() > MAX_AUTH_SYS_GIDS {
            return Err(XdrError::TooLong {
                what: "auth_sys gids",
                len: self.gids.len(),
                max: MAX_AUTH_SYS_GIDS,
            });
        }
        self.stamp.encode(buf)?;
        self.machine_name.encode(buf)?;
        self.uid.encode(buf)?;
        self.gid.encode(buf)?;
        self.gids.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let stamp = u32::decode(buf)?;
        let raw = decode_opaque_bounded(buf, MAX_MACHINE_NAME)?;
        let machine_name = String::from_utf8(raw.to_vec())
            .map_err(|e| XdrError::invalid_data(format!("machine name: {}", e)))?;
        let uid = u32::decode(buf)?;
        let gid = u32::decode(buf)?;
        let gids = Vec::<u32>::decode(buf)?;
        if gids.len() > MAX_AUTH_SYS_GIDS {
            return Err(XdrError::TooLong {
                what: "auth_sys gids",
                len: gids.len(),
                max: MAX_AUTH_SYS_GIDS,
            });
        }
        Ok(Self {
            stamp,
            machine_name,
            uid,
            gid,
            gids,
        })
    }

    fn encoded_size(&self) -> usize {
        4 + self.machine_name.encoded_size() + 4 + 4 + self.gids.encoded_size()
    }
}

/// Header of an RPC call: everything between the record mark and the
/// procedure arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

impl Xdr for CallHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.xid.encode(buf)?;
        u32::from(MsgType::Call).encode(buf)?;
        RPC_VERSION.encode(buf)?;
        self.program.encode(buf)?;
        self.version.encode(buf)?;
        self.procedure.encode(buf)?;
        self.cred.encode(buf)?;
        self.verf.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let xid = u32::decode(buf)?;
        let mtype = u32::decode(buf)?;
        if mtype != u32::from(MsgType::Call) {
            return Err(XdrError::invalid_data(format!(
                "expected CALL message, got type {}",
                mtype
            )));
        }
        let rpcvers = u32::decode(buf)?;
        if rpcvers != RPC_VERSION {
            return Err(XdrError::invalid_data(format!(
                "unsupported RPC version {}",
                rpcvers
            )));
        }
        Ok(Self {
            xid,
            program: u32::decode(buf)?,
            version: u32::decode(buf)?,
            procedure: u32::decode(buf)?,
            cred: OpaqueAuth::decode(buf)?,
            verf: OpaqueAuth::decode(buf)?,
        })
    }

    fn encoded_size(&self) -> usize {
        6 * 4 + self.cred.encoded_size() + self.verf.encoded_size()
    }
}

/// `accept_stat` together with its arm data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

/// `reject_stat` together with its arm data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStat {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted { verf: OpaqueAuth, stat: AcceptStat },
    Denied(RejectStat),
}

/// Header of an RPC reply. When the body is `Accepted` with `Success`, the
/// procedure results follow immediately in the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub body: ReplyBody,
}

impl ReplyHeader {
    pub fn success(xid: u32) -> Self {
        Self {
            xid,
            body: ReplyBody::Accepted {
                verf: OpaqueAuth::none(),
                stat: AcceptStat::Success,
            },
        }
    }
}

impl Xdr for ReplyHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.xid.encode(buf)?;
        u32::from(MsgType::Reply).encode(buf)?;
        match &self.body {
            ReplyBody::Accepted { verf, stat } => {
                0u32.encode(buf)?;
                verf.encode(buf)?;
                match *stat {
                    AcceptStat::Success => 0u32.encode(buf),
                    AcceptStat::ProgUnavail => 1u32.encode(buf),
                    AcceptStat::ProgMismatch { low, high } => {
                        2u32.encode(buf)?;
                        low.encode(buf)?;
                        high.encode(buf)
                    }
                    AcceptStat::ProcUnavail => 3u32.encode(buf),
                    AcceptStat::GarbageArgs => 4u32.encode(buf),
                    AcceptStat::SystemErr => 5u32.encode(buf),
                }
            }
            ReplyBody::Denied(reject) => {
                1u32.encode(buf)?;
                match *reject {
                    RejectStat::RpcMismatch { low, high } => {
                        0u32.encode(buf)?;
                        low.encode(buf)?;
                        high.encode(buf)
                    }
                    RejectStat::AuthError(stat) => {
                        1u32.encode(buf)?;
                        stat.encode(buf)
                    }
                }
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let xid = u32::decode(buf)?;
        let mtype = u32::decode(buf)?;
        if mtype != u32::from(MsgType::Reply) {
            return Err(XdrError::invalid_data(format!(
                "expected REPLY message, got type {}",
                mtype
            )));
        }
        let body = match u32::decode(buf)? {
            0 => {
                let verf = OpaqueAuth::decode(buf)?;
                let stat = match u32::decode(buf)? {
                    0 => AcceptStat::Success,
                    1 => AcceptStat::ProgUnavail,
                    2 => AcceptStat::ProgMismatch {
                        low: u32::decode(buf)?,
                        high: u32::decode(buf)?,
                    },
                    3 => AcceptStat::ProcUnavail,
                    4 => AcceptStat::GarbageArgs,
                    5 => AcceptStat::SystemErr,
                    other => {
                        return Err(XdrError::invalid_data(format!(
                            "unknown accept_stat {}",
                            other
                        )))
                    }
                };
                ReplyBody::Accepted { verf, stat }
            }
            1 => match u32::decode(buf)? {
                0 => ReplyBody::Denied(RejectStat::RpcMismatch {
                    low: u32::decode(buf)?,
                    high: u32::decode(buf)?,
                }),
                1 => ReplyBody::Denied(RejectStat::AuthError(u32::decode(buf)?)),
                other => {
                    return Err(XdrError::invalid_data(format!(
                        "unknown reject_stat {}",
                        other
                    )))
                }
            },
            other => {
                return Err(XdrError::invalid_data(format!(
                    "unknown reply_stat {}",
                    other
                )))
            }
        };
        Ok(Self { xid, body })
    }

    fn encoded_size(&self) -> usize {
        let body = match &self.body {
            ReplyBody::Accepted { verf, stat } => {
                let arm = match stat {
                    AcceptStat::ProgMismatch { .. } => 8,
                    _ => 0,
                };
                4 + verf.encoded_size() + 4 + arm
            }
            ReplyBody::Denied(RejectStat::RpcMismatch { .. }) => 4 + 4 + 8,
            ReplyBody::Denied(RejectStat::AuthError(_)) => 4 + 4 + 4,
        };
        8 + body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sys_cred() -> AuthSysParams {
        AuthSysParams {
            stamp: 0,
            machine_name: "proxy-host".to_string(),
            uid: 1000,
            gid: 100,
            gids: vec![100, 4, 24],
        }
    }

    #[test]
    fn test_call_header_layout() {
        let header = CallHeader {
            xid: 0xdead_beef,
            program: 100003,
            version: 4,
            procedure: 1,
            cred: OpaqueAuth::none(),
            verf: OpaqueAuth::none(),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), header.encoded_size());
        assert_eq!(&buf[..4], &[0xde, 0xad, 0xbe, 0xef]);
        // msg_type CALL, rpcvers 2
        assert_eq!(&buf[4..12], &[0, 0, 0, 0, 0, 0, 0, 2]);

        let decoded = CallHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_auth_sys_body() {
        let cred = OpaqueAuth::sys(&sys_cred()).unwrap();
        assert_eq!(cred.flavor, 1);
        let params = AuthSysParams::decode(&mut cred.body.clone()).unwrap();
        assert_eq!(params, sys_cred());
    }

    #[test]
    fn test_auth_sys_too_many_groups() {
        let mut params = sys_cred();
        params.gids = (0..17).collect();
        assert!(OpaqueAuth::sys(&params).is_err());
    }

    #[test]
    fn test_reply_variants() {
        let cases = vec![
            ReplyHeader::success(1),
            ReplyHeader {
                xid: 2,
                body: ReplyBody::Accepted {
                    verf: OpaqueAuth::none(),
                    stat: AcceptStat::ProgMismatch { low: 2, high: 3 },
                },
            },
            ReplyHeader {
                xid: 3,
                body: ReplyBody::Denied(RejectStat::AuthError(5)),
            },
            ReplyHeader {
                xid: 4,
                body: ReplyBody::Denied(RejectStat::RpcMismatch { low: 2, high: 2 }),
            },
        ];
        for reply in cases {
            let mut buf = BytesMut::new();
            reply.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), reply.encoded_size());
            assert_eq!(ReplyHeader::decode(&mut buf.freeze()).unwrap(), reply);
        }
    }

    #[test]
    fn test_reply_rejects_call() {
        let mut buf = BytesMut::new();
        7u32.encode(&mut buf).unwrap();
        0u32.encode(&mut buf).unwrap();
        assert!(ReplyHeader::decode(&mut buf.freeze()).is_err());
    }
}
