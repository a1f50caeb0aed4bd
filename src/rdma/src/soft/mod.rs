//! An in-process fabric that implements both [`Verbs`](crate::ibv::Verbs) and
//! [`ConnectionManager`](crate::rdmacm::ConnectionManager).
//!
//! Work requests complete synchronously at post time by copying between registered windows,
//! after the same checks a NIC performs (QP state, protection domain, keys, access, bounds). A
//! [`SoftProfile`] describes which call shapes the simulated binding accepts, so code that tries
//! provider surfaces can be driven against several of them.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::ibv::{
    AccessFlags, DeviceHandle, Gid, Handle, QpCapability, QpShape, QpState,
    VerbsError, WorkCompletion,
};
use crate::mr::AlignedBuffer;
use crate::rdmacm::{CmEvent, ConnParam};

mod cm;
mod verbs;

/// One simulated device with a single port.
#[derive(Debug, Clone)]
pub struct SoftDeviceSpec {
    pub name: String,
    /// 0 for an Ethernet (RoCE) link, where routed addressing is mandatory.
    pub lid: u16,
    pub gids: Vec<Gid>,
}

impl SoftDeviceSpec {
    /// A RoCE-style device: no link id, one link-local global id derived from `seed`.
    pub fn roce(name: &str, seed: u8) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[8..].copy_from_slice(&[0x02, 0x00, 0x5e, 0xff, 0xfe, 0x00, 0x00, seed]);
        SoftDeviceSpec {
            name: name.to_owned(),
            lid: 0,
            gids: vec![Gid::from_raw(raw)],
        }
    }

    /// An InfiniBand-style device addressed by link id.
    pub fn infiniband(name: &str, lid: u16) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[14..].copy_from_slice(&lid.to_be_bytes());
        SoftDeviceSpec {
            name: name.to_owned(),
            lid,
            gids: vec![Gid::from_raw(raw)],
        }
    }
}

/// The binding surface the fabric pretends to be.
#[derive(Debug, Clone)]
pub struct SoftProfile {
    /// Queue-pair creation shapes this build accepts.
    pub qp_shapes: Vec<QpShape>,
    /// CM-side creation returns nothing and only attaches the QP to the id.
    pub qp_via_side_channel: bool,
    /// Attribute objects carrying capacity hints are rejected as a shape error.
    pub rejects_cap: bool,
    /// Attribute objects carrying CQ bindings are rejected as a shape error.
    pub rejects_cq_binding: bool,
    pub supports_init_qp_attr: bool,
    /// Whether caller-buffer registration exists; when not, only provider allocation works.
    pub supports_reg_mr: bool,
    pub cm_exposes_context: bool,
    pub max_qp: usize,
    /// Transition target at which the provider reports a fatal fault.
    pub fault_on_transition: Option<QpState>,
}

impl Default for SoftProfile {
    fn default() -> Self {
        SoftProfile {
            qp_shapes: vec![
                QpShape::PdAndAttr,
                QpShape::Attr,
                QpShape::Pd,
                QpShape::Empty,
                QpShape::Extended,
            ],
            qp_via_side_channel: false,
            rejects_cap: false,
            rejects_cq_binding: false,
            supports_init_qp_attr: true,
            supports_reg_mr: true,
            cm_exposes_context: true,
            max_qp: 256,
            fault_on_transition: None,
        }
    }
}

struct CtxEntry {
    device: usize,
}

struct PdEntry {
    ctx: Handle,
}

struct CqEntry {
    ctx: Handle,
    depth: u32,
    entries: VecDeque<WorkCompletion>,
}

struct MrEntry {
    pd: Handle,
    addr: u64,
    len: usize,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
    _owned: Option<AlignedBuffer>,
}

impl MrEntry {
    fn covers(&self, addr: u64, len: u32) -> bool {
        match (
            addr.checked_add(len as u64),
            self.addr.checked_add(self.len as u64),
        ) {
            (Some(end), Some(limit)) => addr >= self.addr && end <= limit,
            _ => false,
        }
    }
}

struct QpEntry {
    ctx: Handle,
    pd: Handle,
    send_cq: Handle,
    recv_cq: Handle,
    qp_num: u32,
    state: QpState,
    cap: QpCapability,
    sq_sig_all: bool,
    access: AccessFlags,
    dest_qp_num: u32,
    recv_queue: VecDeque<crate::ibv::RecvWr>,
}

#[derive(Default)]
struct IdEntry {
    channel: Handle,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    ctx: Option<Handle>,
    qp: Option<Handle>,
    owned_cq: Option<Handle>,
    peer: Option<Handle>,
    listening: bool,
    addr_resolved: bool,
    route_resolved: bool,
    connect_param: Option<ConnParam>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_qpn: u32,
    next_key: u32,
    next_port: u16,
    contexts: FnvHashMap<Handle, CtxEntry>,
    pds: FnvHashMap<Handle, PdEntry>,
    cqs: FnvHashMap<Handle, CqEntry>,
    mrs: FnvHashMap<Handle, MrEntry>,
    qps: FnvHashMap<Handle, QpEntry>,
    channels: FnvHashMap<Handle, VecDeque<CmEvent>>,
    ids: FnvHashMap<Handle, IdEntry>,
    listeners: FnvHashMap<u16, Handle>,
    /// Contexts and domains the connection manager opened on its own, one per device.
    cm_contexts: FnvHashMap<usize, Handle>,
    cm_pds: FnvHashMap<Handle, Handle>,
    event_polls: usize,
}

impl State {
    fn alloc_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    fn alloc_key(&mut self) -> u32 {
        self.next_key = self.next_key.wrapping_add(0x101);
        self.next_key
    }

    fn alloc_qpn(&mut self) -> u32 {
        // QP numbers are 24 bits; 0 and 1 are reserved.
        self.next_qpn = (self.next_qpn + 1) & 0x00ff_ffff;
        if self.next_qpn < 0x11 {
            self.next_qpn = 0x11;
        }
        self.next_qpn
    }

    fn qp_by_num(&self, qp_num: u32) -> Option<Handle> {
        self.qps
            .iter()
            .find(|(_, qp)| qp.qp_num == qp_num)
            .map(|(h, _)| *h)
    }

    fn mr_by_lkey(&self, lkey: u32) -> Option<&MrEntry> {
        self.mrs.values().find(|mr| mr.lkey == lkey)
    }

    fn mr_by_rkey(&self, rkey: u32) -> Option<&MrEntry> {
        self.mrs.values().find(|mr| mr.rkey == rkey)
    }

    fn push_event(&mut self, channel: Handle, event: CmEvent) {
        match self.channels.get_mut(&channel) {
            Some(queue) => queue.push_back(event),
            None => log::debug!("dropping {} for closed channel {}", event, channel),
        }
    }
}

struct Shared {
    devices: Vec<SoftDeviceSpec>,
    profile: SoftProfile,
    state: spin::Mutex<State>,
}

/// A cheaply clonable handle to one simulated fabric. All clones see the same devices and
/// resources.
#[derive(Clone)]
pub struct SoftFabric {
    shared: Arc<Shared>,
}

impl Default for SoftFabric {
    fn default() -> Self {
        SoftFabric::new(vec![SoftDeviceSpec::roce("rxe0", 1)], SoftProfile::default())
    }
}

impl SoftFabric {
    pub fn new(devices: Vec<SoftDeviceSpec>, profile: SoftProfile) -> Self {
        SoftFabric {
            shared: Arc::new(Shared {
                devices,
                profile,
                state: spin::Mutex::new(State::default()),
            }),
        }
    }

    pub fn with_profile(profile: SoftProfile) -> Self {
        SoftFabric::new(vec![SoftDeviceSpec::roce("rxe0", 1)], profile)
    }

    #[inline]
    pub fn profile(&self) -> &SoftProfile {
        &self.shared.profile
    }

    /// Queue an arbitrary event on a channel, as a misbehaving peer or driver would.
    pub fn inject_cm_event(&self, channel: Handle, event: CmEvent) {
        self.shared.state.lock().push_event(channel, event);
    }

    /// Number of completions waiting on `cq`.
    pub fn pending_completions(&self, cq: Handle) -> usize {
        self.shared
            .state
            .lock()
            .cqs
            .get(&cq)
            .map_or(0, |cq| cq.entries.len())
    }

    /// How many times any event channel has been polled.
    pub fn cm_event_polls(&self) -> usize {
        self.shared.state.lock().event_polls
    }

    /// How many queue pairs currently exist.
    pub fn live_qps(&self) -> usize {
        self.shared.state.lock().qps.len()
    }

    /// How many memory registrations currently exist.
    pub fn live_mrs(&self) -> usize {
        self.shared.state.lock().mrs.len()
    }

    fn device_handle(&self, index: usize) -> DeviceHandle {
        DeviceHandle {
            id: Handle(index as u64 + 1),
            name: self.shared.devices[index].name.clone(),
        }
    }
}

fn einval() -> VerbsError {
    VerbsError::from_errno(libc::EINVAL)
}
