//! External Data Representation codec
//!
//! A small `Xdr` trait with implementations for the XDR primitive types,
//! used by the ONC RPC and NFSv4.1 message definitions.

pub mod codec;
pub mod error;

pub use codec::*;
pub use error::*;
