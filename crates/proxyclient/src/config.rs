//! Client configuration
//!
//! `ProxyClientConfig` can be filled in directly or loaded from the
//! `PROXY_V4 { Remote_Server { ... } }` block of a Ganesha config file.

use crate::error::{ProxyError, Result};
use nfs4proto::{NFS_PROGRAM, NFS_V4};
use proxyconfig::{define_options, BlockConfig, Count, Duration as CfgDuration, Size};
use serde::Serialize;
use std::time::Duration;

/// Smallest buffer that still fits an RPC header and a session compound
pub const MIN_BUFFER_SIZE: usize = 512;

/// Record mark length field is 31 bits
pub const MAX_BUFFER_SIZE: usize = 0x7fff_ffff;

define_options! {
    /// Parameters of the `Remote_Server` block
    pub struct RemoteServerOptions {
        srv_addr: String = String::from("127.0.0.1"),
        nfs_port: Count = Count(2049),
        nfs_service: Count = Count(NFS_PROGRAM as u64),
        nfs_sendsize: Size = Size(32768),
        nfs_recvsize: Size = Size(32768),
        rpc_slots: Count = Count(16),
        retry_sleeptime: CfgDuration = CfgDuration(Duration::from_secs(10)),
        rpc_client_timeout: CfgDuration = CfgDuration(Duration::from_secs(60)),
        srv_timeout: CfgDuration = CfgDuration(Duration::from_secs(2)),
        use_privileged_client_port: bool = false,
        machine_name: String = String::new(),
    }
}

/// Proxy client configuration
#[derive(Debug, Clone, Serialize)]
pub struct ProxyClientConfig {
    /// Backend host name or address
    pub server_addr: String,

    /// Backend port
    pub port: u16,

    /// RPC program number (NFS is 100003)
    pub program: u32,

    /// RPC program version; the engine speaks v4 minor 1
    pub version: u32,

    /// Capacity of each call context's send buffer
    pub send_size: usize,

    /// Capacity of each call context's receive buffer; larger replies fail
    /// with `ResponseTooLarge`
    pub recv_size: usize,

    /// Number of call contexts, which is also the number of session slots
    pub slots: usize,

    /// Pause between connection attempts. Fixed, no growth.
    pub retry_sleep: Duration,

    /// Bind the local end to a port below 1024
    pub use_privileged_port: bool,

    /// How long a sent call waits for its reply
    pub rpc_timeout: Duration,

    /// Readiness wait on the connected socket
    pub poll_timeout: Duration,

    /// Export id, part of the client owner string
    pub export_id: u16,

    /// AUTH_SYS machine name; the host name when unset
    pub machine_name: Option<String>,
}

impl Default for ProxyClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            port: 2049,
            program: NFS_PROGRAM,
            version: NFS_V4,
            send_size: 32768,
            recv_size: 32768,
            slots: 16,
            retry_sleep: Duration::from_secs(10),
            use_privileged_port: false,
            rpc_timeout: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(2),
            export_id: 0,
            machine_name: None,
        }
    }
}

impl ProxyClientConfig {
    /// Build from a parsed config file.
    ///
    /// Remote server parameters come from the first `Remote_Server` block,
    /// the export id from the first `EXPORT` block. Both are optional.
    pub fn from_block_config(config: &BlockConfig) -> Result<Self> {
        let opts = match config.find_anywhere("Remote_Server") {
            Some(block) => RemoteServerOptions::from_block(block)
                .map_err(|e| ProxyError::config_error(e.to_string()))?,
            None => RemoteServerOptions::default(),
        };

        let export_id = match config.find(&["EXPORT"]).and_then(|b| b.get("export_id")) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ProxyError::config_error(format!("invalid Export_Id {}", raw)))?,
            None => 0,
        };

        let port = u16::try_from(opts.nfs_port.0)
            .map_err(|_| ProxyError::config_error(format!("NFS_Port {} out of range", opts.nfs_port.0)))?;
        let program = u32::try_from(opts.nfs_service.0).map_err(|_| {
            ProxyError::config_error(format!("NFS_Service {} out of range", opts.nfs_service.0))
        })?;

        let config = Self {
            server_addr: opts.srv_addr,
            port,
            program,
            version: NFS_V4,
            send_size: opts.nfs_sendsize.0 as usize,
            recv_size: opts.nfs_recvsize.0 as usize,
            slots: opts.rpc_slots.0 as usize,
            retry_sleep: opts.retry_sleeptime.0,
            use_privileged_port: opts.use_privileged_client_port,
            rpc_timeout: opts.rpc_client_timeout.0,
            poll_timeout: opts.srv_timeout.0,
            export_id,
            machine_name: Some(opts.machine_name).filter(|n| !n.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(ProxyError::config_error("server address is empty"));
        }
        if self.slots == 0 || self.slots > u32::MAX as usize {
            return Err(ProxyError::config_error(format!(
                "slot count {} out of range",
                self.slots
            )));
        }
        for (what, size) in [("send", self.send_size), ("receive", self.recv_size)] {
            if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
                return Err(ProxyError::config_error(format!(
                    "{} buffer size {} outside {}..={}",
                    what, size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
                )));
            }
        }
        if self.rpc_timeout.is_zero() || self.poll_timeout.is_zero() {
            return Err(ProxyError::config_error("timeouts must be non-zero"));
        }
        Ok(())
    }

    /// Highest slot id announced in SEQUENCE
    pub fn highest_slot_id(&self) -> u32 {
        (self.slots - 1) as u32
    }
}
