//! ONC RPC and NFSv4.1 wire definitions
//!
//! The RPC call/reply envelope, AUTH_SYS credentials, and the COMPOUND
//! operations an NFSv4.1 client needs to establish and keep a session.
//! Other operations are carried opaquely.

pub mod compound;
pub mod nfs4;
pub mod rpc;
pub mod session_ops;

pub use compound::{ArgOp, CompoundArgs, CompoundRes, OpResult, ResOp};
pub use nfs4::*;
pub use rpc::{
    AcceptStat, AuthFlavor, AuthSysParams, CallHeader, MsgType, OpaqueAuth, RejectStat,
    ReplyBody, ReplyHeader, MAX_MACHINE_NAME, RPC_VERSION,
};
pub use session_ops::*;
pub use xdr::{Xdr, XdrError};
