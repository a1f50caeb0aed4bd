//! Queue-pair bring-up: RESET → INIT → RTR → RTS, and the forced move to ERROR.
//!
//! Every transition is exactly one provider call carrying the attribute groups the target state
//! needs. The provider decides legality; a rejected transition surfaces as
//! [`Error::StateTransition`] and is never retried here.
use std::fmt;

use rand::Rng;

use rdma::ibv::{
    AccessFlags, AhAttr, Gid, GlobalRoute, Mtu, QpAttr, QpAttrMask, QpState, QueuePair,
};

use crate::config::RdmaTransportConfig;
use crate::{Error, Result};

const PSN_MASK: u32 = 0x00ff_ffff;

/// The packet sequence number this side advertises and starts sending with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPsn(u32);

/// The packet sequence number the peer advertised; our receive side expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPsn(u32);

impl LocalPsn {
    #[inline]
    pub fn new(psn: u32) -> Self {
        LocalPsn(psn & PSN_MASK)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl PeerPsn {
    #[inline]
    pub fn new(psn: u32) -> Self {
        PeerPsn(psn & PSN_MASK)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

/// A random 24-bit starting sequence number.
pub fn random_psn() -> LocalPsn {
    LocalPsn(rand::thread_rng().gen_range(0..=PSN_MASK))
}

/// How the receive side addresses the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPath {
    /// Same subnet, addressed by link id.
    Local { dlid: u16 },
    /// Routed, addressed by global id. Mandatory on Ethernet links.
    Global {
        dgid: Gid,
        sgid_index: u8,
        hop_limit: u8,
    },
}

impl fmt::Display for AddressPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPath::Local { dlid } => write!(f, "lid {}", dlid),
            AddressPath::Global { dgid, .. } => write!(f, "gid {}", dgid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitParams {
    pub port_num: u8,
    pub pkey_index: u16,
    pub access: AccessFlags,
}

impl Default for InitParams {
    fn default() -> Self {
        InitParams {
            port_num: 1,
            pkey_index: 0,
            access: AccessFlags::remote_rw(),
        }
    }
}

impl InitParams {
    pub fn from_config(config: &RdmaTransportConfig) -> Self {
        InitParams {
            port_num: config.port_num,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrParams {
    pub path_mtu: Mtu,
    pub dest_qp_num: u32,
    pub rq_psn: PeerPsn,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub path: AddressPath,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
}

impl RtrParams {
    pub fn new(dest_qp_num: u32, rq_psn: PeerPsn, path: AddressPath) -> Self {
        RtrParams {
            path_mtu: Mtu::Mtu1024,
            dest_qp_num,
            rq_psn,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            path,
            sl: 0,
            src_path_bits: 0,
            port_num: 1,
        }
    }

    pub fn with_config(mut self, config: &RdmaTransportConfig) -> Self {
        self.path_mtu = config.rtr.mtu();
        self.max_dest_rd_atomic = config.rtr.max_dest_rd_atomic;
        self.min_rnr_timer = config.rtr.min_rnr_timer;
        self.sl = config.rtr.sl;
        self.port_num = config.port_num;
        self
    }

    fn ah_attr(&self) -> AhAttr {
        let (grh, dlid) = match self.path {
            AddressPath::Local { dlid } => (None, dlid),
            AddressPath::Global {
                dgid,
                sgid_index,
                hop_limit,
            } => (
                Some(GlobalRoute {
                    dgid,
                    flow_label: 0,
                    sgid_index,
                    hop_limit,
                    traffic_class: 0,
                }),
                0,
            ),
        };
        AhAttr {
            grh,
            dlid,
            sl: self.sl,
            src_path_bits: self.src_path_bits,
            port_num: self.port_num,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtsParams {
    pub sq_psn: LocalPsn,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

impl RtsParams {
    pub fn new(sq_psn: LocalPsn) -> Self {
        RtsParams {
            sq_psn,
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
        }
    }

    pub fn with_config(mut self, config: &RdmaTransportConfig) -> Self {
        self.timeout = config.rts.timeout;
        self.retry_cnt = config.rts.retry_cnt;
        self.rnr_retry = config.rts.rnr_retry;
        self.max_rd_atomic = config.rts.max_rd_atomic;
        self
    }
}

/// A queue pair plus the state it was last moved to.
#[derive(Debug)]
pub struct QpStateMachine<'res> {
    qp: QueuePair<'res>,
    state: QpState,
}

impl<'res> QpStateMachine<'res> {
    /// Wrap a freshly created queue pair, which starts in RESET.
    pub fn new(qp: QueuePair<'res>) -> Self {
        QpStateMachine {
            qp,
            state: QpState::Reset,
        }
    }

    /// Wrap a queue pair someone else may have moved already (e.g. the connection manager).
    pub fn adopt(qp: QueuePair<'res>) -> Result<Self> {
        let state = qp.query_state().map_err(|source| Error::Provisioning {
            resource: "queue pair state",
            source,
        })?;
        Ok(QpStateMachine { qp, state })
    }

    #[inline]
    pub fn state(&self) -> QpState {
        self.state
    }

    #[inline]
    pub fn qp(&self) -> &QueuePair<'res> {
        &self.qp
    }

    #[inline]
    pub fn into_inner(self) -> QueuePair<'res> {
        self.qp
    }

    pub fn to_init(&mut self, params: &InitParams) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Init,
            pkey_index: params.pkey_index,
            port_num: params.port_num,
            qp_access_flags: params.access,
            ..Default::default()
        };
        self.transition(attr, Self::mask_into(QpState::Init))
    }

    pub fn to_rtr(&mut self, params: &RtrParams) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Rtr,
            path_mtu: params.path_mtu,
            dest_qp_num: params.dest_qp_num,
            rq_psn: params.rq_psn.value(),
            max_dest_rd_atomic: params.max_dest_rd_atomic,
            min_rnr_timer: params.min_rnr_timer,
            ah_attr: params.ah_attr(),
            ..Default::default()
        };
        tracing::debug!(
            "qp {:#x} -> RTR, peer qp {:#x} via {}",
            self.qp.qp_num(),
            params.dest_qp_num,
            params.path
        );
        self.transition(attr, Self::mask_into(QpState::Rtr))
    }

    pub fn to_rts(&mut self, params: &RtsParams) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Rts,
            sq_psn: params.sq_psn.value(),
            timeout: params.timeout,
            retry_cnt: params.retry_cnt,
            rnr_retry: params.rnr_retry,
            max_rd_atomic: params.max_rd_atomic,
            ..Default::default()
        };
        self.transition(attr, Self::mask_into(QpState::Rts))
    }

    /// Force the queue pair into ERROR. Outstanding requests are flushed by the provider; this
    /// is how an in-progress session is cancelled.
    pub fn to_error(&mut self) -> Result<()> {
        let attr = QpAttr {
            qp_state: QpState::Error,
            ..Default::default()
        };
        self.transition(attr, QpAttrMask::STATE)
    }

    /// The attribute groups sent for a move into `to`, whatever the current state.
    fn mask_into(to: QpState) -> QpAttrMask {
        let from = match to {
            QpState::Init => QpState::Reset,
            QpState::Rtr => QpState::Init,
            QpState::Rts => QpState::Rtr,
            _ => QpState::Reset,
        };
        QpAttrMask::required_for(from, to).unwrap_or(QpAttrMask::STATE)
    }

    fn transition(&mut self, attr: QpAttr, mask: QpAttrMask) -> Result<()> {
        let (from, to) = (self.state, attr.qp_state);
        match self.qp.modify(&attr, mask) {
            Ok(()) => {
                tracing::debug!("qp {:#x}: {} -> {}", self.qp.qp_num(), from, to);
                self.state = to;
                Ok(())
            }
            Err(source) => {
                // A fault may have pushed the QP into ERROR; otherwise it stays where it was.
                match self.qp.query_state() {
                    Ok(actual) => self.state = actual,
                    Err(e) => tracing::warn!("query_qp_state after failed transition: {}", e),
                }
                tracing::warn!(
                    "qp {:#x}: {} -> {} failed: {}, now {}",
                    self.qp.qp_num(),
                    from,
                    to,
                    source,
                    self.state
                );
                Err(Error::StateTransition { from, to, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psn_is_24_bits() {
        for _ in 0..64 {
            assert!(random_psn().value() <= PSN_MASK);
        }
        assert_eq!(LocalPsn::new(0x1ff_ffff).value(), PSN_MASK);
        assert_eq!(PeerPsn::new(0x0100_0001).value(), 1);
    }

    #[test]
    fn test_ah_attr_local_and_global() {
        let local = RtrParams::new(0x20, PeerPsn::new(5), AddressPath::Local { dlid: 9 });
        let ah = local.ah_attr();
        assert_eq!(ah.dlid, 9);
        assert!(ah.grh.is_none());
        assert_eq!(ah.port_num, 1);

        let dgid: Gid = "fe80:0000:0000:0000:0002:005e:fffe:0001".parse().unwrap();
        let global = RtrParams::new(
            0x20,
            PeerPsn::new(5),
            AddressPath::Global {
                dgid,
                sgid_index: 0,
                hop_limit: 1,
            },
        );
        let grh = global.ah_attr().grh.unwrap();
        assert_eq!(grh.dgid, dgid);
        assert_eq!(grh.hop_limit, 1);
        assert_eq!(global.ah_attr().sl, 0);
    }

    #[test]
    fn test_transition_masks() {
        let init = QpStateMachine::mask_into(QpState::Init);
        assert!(init.contains(QpAttrMask::PORT | QpAttrMask::PKEY_INDEX | QpAttrMask::ACCESS_FLAGS));
        let rtr = QpStateMachine::mask_into(QpState::Rtr);
        assert!(rtr.contains(QpAttrMask::AV | QpAttrMask::DEST_QPN | QpAttrMask::RQ_PSN));
        let rts = QpStateMachine::mask_into(QpState::Rts);
        assert!(rts.contains(QpAttrMask::SQ_PSN | QpAttrMask::MAX_QP_RD_ATOMIC));
        assert!(!rts.contains(QpAttrMask::AV));
    }
}
