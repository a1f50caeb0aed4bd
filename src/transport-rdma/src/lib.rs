//! Reliable-connection RDMA sessions: resource construction, queue-pair bring-up, the two
//! connection handshakes and a blocking one-request-at-a-time data plane.
use std::io;

use thiserror::Error;

use rdma::ibv::{QpState, WcStatus};
use rdma::VerbsError;

pub mod cascade;
pub mod cm;
pub mod config;
pub mod device;
pub mod mr_cache;
pub mod ops;
pub mod peer;
pub mod qp;
pub mod rendezvous;

pub use cascade::ConstructionAttempt;
pub use config::RdmaTransportConfig;
pub use peer::{PeerDescriptor, RemoteBufInfo};
pub use qp::QpStateMachine;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No RDMA device matches {0:?}")]
    DeviceNotFound(String),
    #[error("Failed to provision {resource}: {source}")]
    Provisioning {
        resource: &'static str,
        #[source]
        source: VerbsError,
    },
    #[error(
        "No construction path for {resource}, tried: {}",
        cascade::display_attempts(.attempts)
    )]
    NoConstructionPath {
        resource: &'static str,
        attempts: Vec<ConstructionAttempt>,
    },
    #[error("Protocol violation: expected {expected}, observed {observed}")]
    ProtocolViolation { expected: String, observed: String },
    #[error("Failed to move QP from {from} to {to}: {source}")]
    StateTransition {
        from: QpState,
        to: QpState,
        #[source]
        source: VerbsError,
    },
    #[error("Short read: expected {expected} bytes, received {received}")]
    TransportShortRead { expected: usize, received: usize },
    #[error("Work completion error: {0}")]
    Completion(WcStatus),
    #[error("A signaled request is already outstanding")]
    Busy,
    #[error("No request is outstanding")]
    Idle,
    #[error("rdmacm internal error: {0}")]
    Cm(VerbsError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn violation(expected: impl ToString, observed: impl ToString) -> Self {
        Error::ProtocolViolation {
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
