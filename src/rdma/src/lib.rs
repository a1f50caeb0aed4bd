//! Typed RDMA resources over a pluggable verbs and connection-manager provider.
pub mod ibv;
pub mod mr;
pub mod rdmacm;
pub mod soft;

pub use ibv::{Handle, VerbsError};
