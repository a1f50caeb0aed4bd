use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::ibv::{
    AccessFlags, Handle, QpCapability, QpCreateArgs, QpDesc, QpInitAttr, QpState, QpType, Verbs,
    VerbsError,
};
use crate::rdmacm::{
    CmEvent, CmEventType, ConnParam, ConnectionManager, ContextLookup, PortSpace,
    MAX_ACCEPT_PRIVATE_DATA, MAX_CONNECT_PRIVATE_DATA,
};

use super::{einval, IdEntry, PdEntry, SoftFabric, State};

/// Status carried by a reject, matching the IB CM "consumer reject" reason.
const REJECT_STATUS: i32 = 28;
const CM_CQ_DEPTH: u32 = 64;

impl SoftFabric {
    /// The context the connection manager keeps for `device`, opened on first use.
    fn cm_context_locked(&self, state: &mut State, device: usize) -> Handle {
        if let Some(ctx) = state.cm_contexts.get(&device) {
            return *ctx;
        }
        let ctx = self.open_context_locked(state, device);
        state.cm_contexts.insert(device, ctx);
        ctx
    }

    fn cm_pd_locked(&self, state: &mut State, ctx: Handle) -> Handle {
        if let Some(pd) = state.cm_pds.get(&ctx) {
            return *pd;
        }
        let pd = state.alloc_handle();
        state.pds.insert(pd, PdEntry { ctx });
        state.cm_pds.insert(ctx, pd);
        pd
    }

    fn event_for(id: Handle, event: CmEventType) -> CmEvent {
        CmEvent {
            event,
            status: 0,
            id,
            listen_id: None,
            private_data: Vec::new(),
        }
    }

    fn ephemeral_port(state: &mut State) -> u16 {
        state.next_port = state.next_port.wrapping_add(1);
        49152 + state.next_port % 16384
    }
}

impl ConnectionManager for SoftFabric {
    fn verbs(&self) -> Arc<dyn Verbs> {
        Arc::new(self.clone())
    }

    fn create_event_channel(&self) -> Result<Handle, VerbsError> {
        let mut state = self.shared.state.lock();
        let handle = state.alloc_handle();
        state.channels.insert(handle, VecDeque::new());
        Ok(handle)
    }

    fn destroy_event_channel(&self, channel: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        if state.ids.values().any(|id| id.channel == channel) {
            return Err(VerbsError::from_errno(libc::EBUSY));
        }
        state.channels.remove(&channel).map(|_| ()).ok_or_else(einval)
    }

    fn get_cm_event(&self, channel: Handle) -> Result<Option<CmEvent>, VerbsError> {
        let mut state = self.shared.state.lock();
        state.event_polls += 1;
        let queue = state.channels.get_mut(&channel).ok_or_else(einval)?;
        Ok(queue.pop_front())
    }

    fn create_id(&self, channel: Handle, ps: PortSpace) -> Result<Handle, VerbsError> {
        if ps != PortSpace::Tcp {
            return Err(VerbsError::from_errno(libc::EPROTONOSUPPORT));
        }
        let mut state = self.shared.state.lock();
        if !state.channels.contains_key(&channel) {
            return Err(einval());
        }
        let handle = state.alloc_handle();
        state.ids.insert(
            handle,
            IdEntry {
                channel,
                ..Default::default()
            },
        );
        Ok(handle)
    }

    fn destroy_id(&self, id: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.ids.remove(&id).ok_or_else(einval)?;
        if entry.listening {
            if let Some(port) = entry.local.map(|a| a.port()) {
                state.listeners.remove(&port);
            }
        }
        if let Some(peer) = entry.peer {
            if let Some(peer) = state.ids.get_mut(&peer) {
                peer.peer = None;
            }
        }
        // A CQ the manager created stays until no queue pair is bound to it.
        if let Some(cq) = entry.owned_cq {
            if !state.qps.values().any(|qp| qp.send_cq == cq || qp.recv_cq == cq) {
                state.cqs.remove(&cq);
            }
        }
        Ok(())
    }

    fn bind_addr(&self, id: Handle, addr: &SocketAddr) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let mut addr = *addr;
        if addr.port() == 0 {
            addr.set_port(Self::ephemeral_port(&mut state));
        }
        if state.listeners.contains_key(&addr.port()) {
            return Err(VerbsError::from_errno(libc::EADDRINUSE));
        }
        // A specific address pins the id to the device; a wildcard does not.
        let ctx = if addr.ip().is_unspecified() {
            None
        } else {
            Some(self.cm_context_locked(&mut state, 0))
        };
        let entry = state.ids.get_mut(&id).ok_or_else(einval)?;
        entry.local = Some(addr);
        entry.ctx = ctx;
        Ok(())
    }

    fn listen(&self, id: Handle, backlog: i32) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.ids.get_mut(&id).ok_or_else(einval)?;
        let port = entry.local.ok_or_else(einval)?.port();
        if backlog < 0 {
            return Err(einval());
        }
        entry.listening = true;
        state.listeners.insert(port, id);
        log::debug!("soft: id {} listening on port {}", id, port);
        Ok(())
    }

    fn resolve_addr(
        &self,
        id: Handle,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        _timeout_ms: i32,
    ) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let channel = state.ids.get(&id).ok_or_else(einval)?.channel;
        if dst.ip().is_unspecified() {
            let mut ev = Self::event_for(id, CmEventType::AddrError);
            ev.status = -libc::EADDRNOTAVAIL;
            state.push_event(channel, ev);
            return Ok(());
        }
        let ctx = self.cm_context_locked(&mut state, 0);
        let port = Self::ephemeral_port(&mut state);
        let local = src
            .copied()
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        let entry = state.ids.get_mut(&id).ok_or_else(einval)?;
        entry.local = Some(local);
        entry.remote = Some(*dst);
        entry.ctx = Some(ctx);
        entry.addr_resolved = true;
        state.push_event(channel, Self::event_for(id, CmEventType::AddrResolved));
        Ok(())
    }

    fn resolve_route(&self, id: Handle, _timeout_ms: i32) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.ids.get_mut(&id).ok_or_else(einval)?;
        if !entry.addr_resolved {
            return Err(einval());
        }
        entry.route_resolved = true;
        let channel = entry.channel;
        state.push_event(channel, Self::event_for(id, CmEventType::RouteResolved));
        Ok(())
    }

    fn local_addr(&self, id: Handle) -> Option<SocketAddr> {
        self.shared.state.lock().ids.get(&id).and_then(|e| e.local)
    }

    fn context(&self, id: Handle) -> ContextLookup {
        if !self.shared.profile.cm_exposes_context {
            return ContextLookup::NoContext;
        }
        let state = self.shared.state.lock();
        let ctx = match state.ids.get(&id).and_then(|e| e.ctx) {
            Some(ctx) => ctx,
            None => return ContextLookup::NoContext,
        };
        match state.contexts.get(&ctx) {
            Some(entry) => ContextLookup::Found {
                ctx,
                device: self.device_handle(entry.device),
            },
            None => ContextLookup::NoContext,
        }
    }

    fn create_qp(&self, id: Handle, args: QpCreateArgs<'_>) -> Result<Option<QpDesc>, VerbsError> {
        self.check_qp_shape(&args)?;
        let mut state = self.shared.state.lock();
        let entry = state.ids.get(&id).ok_or_else(einval)?;
        if entry.qp.is_some() {
            return Err(einval());
        }
        let ctx = entry.ctx.ok_or_else(einval)?;
        let pd = match args.pd() {
            Some(pd) => {
                // The domain must live on the device this id is bound to.
                let pd_ctx = state.pds.get(&pd).ok_or_else(einval)?.ctx;
                if !self.same_device(&state, pd_ctx, ctx) {
                    return Err(einval());
                }
                pd
            }
            None => self.cm_pd_locked(&mut state, ctx),
        };
        let default_attr = QpInitAttr::default();
        let attr = args.attr().unwrap_or(&default_attr);
        let owned_cq = if attr.send_cq.is_none() {
            let depth = attr.cap.map_or(CM_CQ_DEPTH, |c| c.max_send_wr.max(CM_CQ_DEPTH));
            Some(self.create_cq_locked(&mut state, ctx, depth))
        } else {
            None
        };
        let desc = match self.create_qp_locked(&mut state, pd, attr, owned_cq) {
            Ok(desc) => desc,
            Err(e) => {
                if let Some(cq) = owned_cq {
                    state.cqs.remove(&cq);
                }
                return Err(e);
            }
        };
        let entry = state.ids.get_mut(&id).ok_or_else(einval)?;
        entry.qp = Some(desc.handle);
        entry.owned_cq = owned_cq;
        // The manager hands out queue pairs already in INIT, so receives can be posted before
        // the connection is accepted.
        if let Some(qp) = state.qps.get_mut(&desc.handle) {
            qp.state = QpState::Init;
            qp.access = AccessFlags::remote_rw();
        }
        if self.shared.profile.qp_via_side_channel {
            Ok(None)
        } else {
            Ok(Some(desc))
        }
    }

    fn qp(&self, id: Handle) -> Option<QpDesc> {
        let state = self.shared.state.lock();
        let qp = state.ids.get(&id)?.qp?;
        let entry = state.qps.get(&qp)?;
        Some(QpDesc {
            handle: qp,
            qp_num: entry.qp_num,
            pd: entry.pd,
            send_cq: entry.send_cq,
            recv_cq: entry.recv_cq,
            cap: entry.cap,
            sq_sig_all: entry.sq_sig_all,
        })
    }

    fn init_qp_attr(&self, id: Handle) -> Result<QpInitAttr, VerbsError> {
        if !self.shared.profile.supports_init_qp_attr {
            return Err(VerbsError::UnsupportedShape(
                "init_qp_attr is not available in this build".to_owned(),
            ));
        }
        let state = self.shared.state.lock();
        let entry = state.ids.get(&id).ok_or_else(einval)?;
        entry.ctx.ok_or_else(einval)?;
        Ok(QpInitAttr {
            qp_type: QpType::RC,
            send_cq: None,
            recv_cq: None,
            cap: Some(QpCapability::default()),
            sq_sig_all: Some(false),
        })
    }

    fn connect(&self, id: Handle, param: &ConnParam) -> Result<(), VerbsError> {
        if param.private_data.len() > MAX_CONNECT_PRIVATE_DATA {
            return Err(einval());
        }
        let mut state = self.shared.state.lock();
        let entry = state.ids.get(&id).ok_or_else(einval)?;
        if !entry.addr_resolved || entry.qp.is_none() {
            return Err(einval());
        }
        let (channel, local, ctx) = (entry.channel, entry.local, entry.ctx);
        let dst_port = entry.remote.ok_or_else(einval)?.port();

        let listener = match state.listeners.get(&dst_port) {
            Some(l) => *l,
            None => {
                let mut ev = Self::event_for(id, CmEventType::Rejected);
                ev.status = REJECT_STATUS;
                state.push_event(channel, ev);
                return Ok(());
            }
        };
        let listen_channel = state.ids.get(&listener).ok_or_else(einval)?.channel;
        let child = state.alloc_handle();
        let child_local = state.ids.get(&listener).and_then(|l| l.local);
        state.ids.insert(
            child,
            IdEntry {
                channel: listen_channel,
                local: child_local,
                remote: local,
                ctx,
                peer: Some(id),
                addr_resolved: true,
                route_resolved: true,
                ..Default::default()
            },
        );
        if let Some(entry) = state.ids.get_mut(&id) {
            entry.peer = Some(child);
            entry.connect_param = Some(param.clone());
        }
        state.push_event(
            listen_channel,
            CmEvent {
                event: CmEventType::ConnectRequest,
                status: 0,
                id: child,
                listen_id: Some(listener),
                private_data: param.private_data.clone(),
            },
        );
        Ok(())
    }

    fn accept(&self, id: Handle, param: &ConnParam) -> Result<(), VerbsError> {
        if param.private_data.len() > MAX_ACCEPT_PRIVATE_DATA {
            return Err(einval());
        }
        let mut state = self.shared.state.lock();
        let entry = state.ids.get(&id).ok_or_else(einval)?;
        let (channel, peer) = (entry.channel, entry.peer.ok_or_else(einval)?);
        let local_qp = entry.qp.ok_or_else(einval)?;
        let peer_entry = state.ids.get(&peer).ok_or_else(einval)?;
        let (peer_channel, peer_qp) = (peer_entry.channel, peer_entry.qp.ok_or_else(einval)?);

        let local_qpn = state.qps.get(&local_qp).ok_or_else(einval)?.qp_num;
        let peer_qpn = state.qps.get(&peer_qp).ok_or_else(einval)?.qp_num;
        self.connect_qp_locked(&mut state, local_qp, peer_qpn)?;
        self.connect_qp_locked(&mut state, peer_qp, local_qpn)?;

        let mut established = Self::event_for(peer, CmEventType::Established);
        established.private_data = param.private_data.clone();
        state.push_event(peer_channel, established);
        state.push_event(channel, Self::event_for(id, CmEventType::Established));
        log::debug!("soft: qp {:#x} <-> qp {:#x} established", local_qpn, peer_qpn);
        Ok(())
    }

    fn reject(&self, id: Handle, private_data: &[u8]) -> Result<(), VerbsError> {
        if private_data.len() > MAX_ACCEPT_PRIVATE_DATA {
            return Err(einval());
        }
        let mut state = self.shared.state.lock();
        let peer = state.ids.get(&id).ok_or_else(einval)?.peer.ok_or_else(einval)?;
        let peer_channel = state.ids.get(&peer).ok_or_else(einval)?.channel;
        let mut ev = Self::event_for(peer, CmEventType::Rejected);
        ev.status = REJECT_STATUS;
        ev.private_data = private_data.to_vec();
        state.push_event(peer_channel, ev);
        Ok(())
    }

    fn disconnect(&self, id: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.ids.get(&id).ok_or_else(einval)?;
        let peer = entry.peer.ok_or_else(|| VerbsError::from_errno(libc::ENOTCONN))?;
        let (channel, qp) = (entry.channel, entry.qp);
        let (peer_channel, peer_qp) = match state.ids.get(&peer) {
            Some(p) => (Some(p.channel), p.qp),
            None => (None, None),
        };
        for qp in [qp, peer_qp].into_iter().flatten() {
            if let Some(qp) = state.qps.get_mut(&qp) {
                qp.state = QpState::Error;
            }
        }
        for h in [id, peer] {
            if let Some(e) = state.ids.get_mut(&h) {
                e.peer = None;
            }
        }
        state.push_event(channel, Self::event_for(id, CmEventType::Disconnected));
        if let Some(peer_channel) = peer_channel {
            state.push_event(peer_channel, Self::event_for(peer, CmEventType::Disconnected));
        }
        Ok(())
    }
}
