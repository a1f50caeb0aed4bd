use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rdma::ibv::{Mtu, QpCapability};
use rdma::rdmacm::ConnParam;

/// Which construction shapes the queue-pair cascade tries, and in what order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CascadeConfig {
    /// Leave out every shape that passes a protection domain.
    pub skip_pd: bool,
    /// Try the attribute-only shape before the domain-and-attribute one.
    pub attr_first: bool,
    /// Build the initial attribute set without capacity hints.
    pub skip_cap: bool,
    /// Build the initial attribute set without completion-queue bindings.
    pub skip_cq: bool,
    /// Append the extended-attribute shape at the end.
    pub use_init_attr_ex: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct RtrConfig {
    pub path_mtu: u32,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub hop_limit: u8,
    pub sl: u8,
}

impl Default for RtrConfig {
    fn default() -> Self {
        RtrConfig {
            path_mtu: 1024,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            hop_limit: 1,
            sl: 0,
        }
    }
}

impl RtrConfig {
    pub fn mtu(&self) -> Mtu {
        match self.path_mtu {
            256 => Mtu::Mtu256,
            512 => Mtu::Mtu512,
            1024 => Mtu::Mtu1024,
            2048 => Mtu::Mtu2048,
            4096 => Mtu::Mtu4096,
            other => {
                tracing::warn!("unsupported path_mtu {}, using 1024", other);
                Mtu::Mtu1024
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct RtsConfig {
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

impl Default for RtsConfig {
    fn default() -> Self {
        RtsConfig {
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
        }
    }
}

/// Credits and retry counts passed to connect/accept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ConnParamConfig {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParamConfig {
    fn default() -> Self {
        ConnParamConfig {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RdmaTransportConfig {
    /// Device to open when a CM id carries no context, or for the rendezvous path. The first
    /// device is used when unset.
    pub device_name: Option<String>,
    pub port_num: u8,
    pub gid_index: u8,
    pub buf_size: usize,
    pub cq_depth: u32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
    pub resolve_timeout_ms: i32,
    pub resolve_route: bool,
    pub src_addr: Option<SocketAddr>,
    pub backlog: i32,
    pub connect_request_backoff_ms: u64,
    pub rtr: RtrConfig,
    pub rts: RtsConfig,
    pub conn_param: ConnParamConfig,
    pub cascade: CascadeConfig,
}

impl Default for RdmaTransportConfig {
    fn default() -> Self {
        RdmaTransportConfig {
            device_name: None,
            port_num: 1,
            gid_index: 0,
            buf_size: 4096,
            cq_depth: 32,
            max_send_wr: 32,
            max_recv_wr: 32,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
            resolve_timeout_ms: 2000,
            resolve_route: true,
            src_addr: None,
            backlog: 1,
            connect_request_backoff_ms: 50,
            rtr: RtrConfig::default(),
            rts: RtsConfig::default(),
            conn_param: ConnParamConfig::default(),
            cascade: CascadeConfig::default(),
        }
    }
}

impl RdmaTransportConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn qp_cap(&self) -> QpCapability {
        QpCapability {
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            max_send_sge: self.max_send_sge,
            max_recv_sge: self.max_recv_sge,
            max_inline_data: self.max_inline_data,
        }
    }

    pub fn conn_param(&self, private_data: Vec<u8>) -> ConnParam {
        ConnParam {
            private_data,
            responder_resources: self.conn_param.responder_resources,
            initiator_depth: self.conn_param.initiator_depth,
            retry_count: self.conn_param.retry_count,
            rnr_retry_count: self.conn_param.rnr_retry_count,
            ..Default::default()
        }
    }

    #[inline]
    pub fn connect_request_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_request_backoff_ms)
    }
}

impl FromStr for RdmaTransportConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}
