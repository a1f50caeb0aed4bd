use std::collections::VecDeque;
use std::ptr;

use crate::ibv::{
    AccessFlags, DeviceHandle, Gid, Handle, MrDesc, Mtu, PortAttr, PortState, QpAttr,
    QpAttrMask, QpCreateArgs, QpDesc, QpInitAttr, QpState, RecvWr, SendFlags,
    SendWr, Verbs, VerbsError, WcFlags, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};
use crate::mr::AlignedBuffer;

use super::{einval, CqEntry, CtxEntry, MrEntry, PdEntry, QpEntry, SoftFabric, State};

const MAX_CQE: u32 = 65536;
const MAX_WR: u32 = 16384;

impl SoftFabric {
    /// Reject the call if this build does not know the argument shape or an attribute group in
    /// it.
    pub(super) fn check_qp_shape(&self, args: &QpCreateArgs<'_>) -> Result<(), VerbsError> {
        let profile = &self.shared.profile;
        let shape = args.shape();
        if !profile.qp_shapes.contains(&shape) {
            return Err(VerbsError::UnsupportedShape(format!(
                "create_qp{} is not accepted by this build",
                shape
            )));
        }
        if let Some(attr) = args.attr() {
            if profile.rejects_cap && attr.cap.is_some() {
                return Err(VerbsError::UnsupportedShape(
                    "QPInitAttr has no attribute 'cap'".to_owned(),
                ));
            }
            if profile.rejects_cq_binding && (attr.send_cq.is_some() || attr.recv_cq.is_some()) {
                return Err(VerbsError::UnsupportedShape(
                    "QPInitAttr has no attribute 'send_cq'".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Create a queue pair under `pd`. Missing CQ bindings fall back to `default_cq` when the
    /// caller has one (the connection manager does), otherwise they are an invalid argument.
    pub(super) fn create_qp_locked(
        &self,
        state: &mut State,
        pd: Handle,
        attr: &QpInitAttr,
        default_cq: Option<Handle>,
    ) -> Result<QpDesc, VerbsError> {
        let ctx = state.pds.get(&pd).ok_or_else(einval)?.ctx;
        if state.qps.len() >= self.shared.profile.max_qp {
            return Err(VerbsError::from_errno(libc::ENOMEM));
        }
        let send_cq = attr.send_cq.or(default_cq).ok_or_else(einval)?;
        let recv_cq = attr.recv_cq.unwrap_or(send_cq);
        for cq in [send_cq, recv_cq] {
            let entry = state.cqs.get(&cq).ok_or_else(einval)?;
            if !self.same_device(state, entry.ctx, ctx) {
                return Err(einval());
            }
        }
        let cap = attr.cap.unwrap_or_default();
        if cap.max_send_wr > MAX_WR || cap.max_recv_wr > MAX_WR || cap.max_send_sge > 32 {
            return Err(einval());
        }

        let handle = state.alloc_handle();
        let qp_num = state.alloc_qpn();
        let sq_sig_all = attr.sq_sig_all.unwrap_or(false);
        state.qps.insert(
            handle,
            QpEntry {
                ctx,
                pd,
                send_cq,
                recv_cq,
                qp_num,
                state: QpState::Reset,
                cap,
                sq_sig_all,
                access: AccessFlags::empty(),
                dest_qp_num: 0,
                recv_queue: VecDeque::new(),
            },
        );
        log::debug!("soft: created qp {:#x} under pd {}", qp_num, pd);
        Ok(QpDesc {
            handle,
            qp_num,
            pd,
            send_cq,
            recv_cq,
            cap,
            sq_sig_all,
        })
    }

    pub(super) fn same_device(&self, state: &State, a: Handle, b: Handle) -> bool {
        match (state.contexts.get(&a), state.contexts.get(&b)) {
            (Some(a), Some(b)) => a.device == b.device,
            _ => false,
        }
    }

    pub(super) fn open_context_locked(&self, state: &mut State, device: usize) -> Handle {
        let handle = state.alloc_handle();
        state.contexts.insert(handle, CtxEntry { device });
        handle
    }

    pub(super) fn create_cq_locked(&self, state: &mut State, ctx: Handle, cqe: u32) -> Handle {
        let handle = state.alloc_handle();
        state.cqs.insert(
            handle,
            CqEntry {
                ctx,
                depth: cqe,
                entries: VecDeque::new(),
            },
        );
        handle
    }

    fn validate_transition(
        &self,
        state: &State,
        qp: &QpEntry,
        attr: &QpAttr,
        mask: QpAttrMask,
    ) -> Result<(), VerbsError> {
        let required = QpAttrMask::required_for(qp.state, attr.qp_state).ok_or_else(|| {
            log::debug!("soft: illegal transition {} -> {}", qp.state, attr.qp_state);
            einval()
        })?;
        if !mask.contains(required) {
            log::debug!("soft: missing attributes {:?}", required - mask);
            return Err(einval());
        }
        let device = &self.shared.devices[state.contexts.get(&qp.ctx).ok_or_else(einval)?.device];
        match attr.qp_state {
            QpState::Init => {
                if attr.port_num != 1 || attr.pkey_index != 0 {
                    return Err(einval());
                }
            }
            QpState::Rtr => {
                if attr.dest_qp_num == 0 || attr.dest_qp_num > 0x00ff_ffff {
                    return Err(einval());
                }
                match attr.ah_attr.grh {
                    Some(grh) => {
                        if grh.dgid.is_zero() || grh.sgid_index as usize >= device.gids.len() {
                            return Err(einval());
                        }
                    }
                    // Ethernet links cannot be addressed without a global route.
                    None if device.lid == 0 || attr.ah_attr.dlid == 0 => return Err(einval()),
                    None => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Move a queue pair the way the connection manager does during accept.
    pub(super) fn connect_qp_locked(
        &self,
        state: &mut State,
        qp: Handle,
        dest_qp_num: u32,
    ) -> Result<(), VerbsError> {
        let entry = state.qps.get_mut(&qp).ok_or_else(einval)?;
        if !matches!(entry.state, QpState::Reset | QpState::Init) {
            return Err(einval());
        }
        entry.access = AccessFlags::remote_rw();
        entry.dest_qp_num = dest_qp_num;
        entry.state = QpState::Rts;
        Ok(())
    }

    fn complete(
        state: &mut State,
        cq: Handle,
        wc: WorkCompletion,
    ) -> Result<(), VerbsError> {
        let entry = state.cqs.get_mut(&cq).ok_or_else(einval)?;
        if entry.entries.len() >= entry.depth as usize {
            log::warn!("soft: cq {} overrun", cq);
            return Err(VerbsError::from_errno(libc::ENOSPC));
        }
        entry.entries.push_back(wc);
        Ok(())
    }

    /// Execute a send-queue request; returns the completion status for the initiator.
    fn execute(state: &mut State, qp: Handle, wr: &SendWr) -> WcStatus {
        let Some(local) = state.qps.get(&qp) else {
            return WcStatus::LocQpOpErr;
        };
        let (local_pd, local_qpn, dest_qpn) = (local.pd, local.qp_num, local.dest_qp_num);

        let local_ok = match state.mr_by_lkey(wr.sge.lkey) {
            Some(mr) => {
                mr.pd == local_pd
                    && mr.covers(wr.sge.addr, wr.sge.length)
                    && (wr.opcode != WrOpcode::RdmaRead
                        || mr.access.contains(AccessFlags::LOCAL_WRITE))
            }
            None => false,
        };
        if !local_ok {
            return WcStatus::LocProtErr;
        }

        let Some(peer) = state.qp_by_num(dest_qpn) else {
            return WcStatus::RetryExcErr;
        };
        let peer_entry = &state.qps[&peer];
        if !matches!(peer_entry.state, QpState::Rtr | QpState::Rts)
            || peer_entry.dest_qp_num != local_qpn
        {
            return WcStatus::RetryExcErr;
        }
        let (peer_pd, peer_access) = (peer_entry.pd, peer_entry.access);
        let len = wr.sge.length;

        match wr.opcode {
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm | WrOpcode::RdmaRead => {
                let need = if wr.opcode == WrOpcode::RdmaRead {
                    AccessFlags::REMOTE_READ
                } else {
                    AccessFlags::REMOTE_WRITE
                };
                let remote_ok = match state.mr_by_rkey(wr.rkey) {
                    Some(mr) => {
                        peer_access.contains(need)
                            && mr.pd == peer_pd
                            && mr.access.contains(need)
                            && mr.covers(wr.remote_addr, len)
                    }
                    None => false,
                };
                if !remote_ok {
                    return WcStatus::RemAccessErr;
                }
                // SAFETY: both ranges were checked against live registrations, whose owners
                // guarantee validity until deregistration.
                unsafe {
                    if wr.opcode == WrOpcode::RdmaRead {
                        ptr::copy(
                            wr.remote_addr as *const u8,
                            wr.sge.addr as *mut u8,
                            len as usize,
                        );
                    } else {
                        ptr::copy(
                            wr.sge.addr as *const u8,
                            wr.remote_addr as *mut u8,
                            len as usize,
                        );
                    }
                }
            }
            WrOpcode::Send => {}
        }

        if matches!(wr.opcode, WrOpcode::RdmaWriteWithImm | WrOpcode::Send) {
            let Some(peer_entry) = state.qps.get_mut(&peer) else {
                return WcStatus::RetryExcErr;
            };
            let Some(recv) = peer_entry.recv_queue.pop_front() else {
                return WcStatus::RnrRetryExcErr;
            };
            let (recv_cq, peer_qpn) = (peer_entry.recv_cq, peer_entry.qp_num);
            let mut status = WcStatus::Success;
            if wr.opcode == WrOpcode::Send {
                let fits = state
                    .mr_by_lkey(recv.sge.lkey)
                    .map_or(false, |mr| mr.covers(recv.sge.addr, len) && len <= recv.sge.length);
                if fits {
                    unsafe {
                        ptr::copy(
                            wr.sge.addr as *const u8,
                            recv.sge.addr as *mut u8,
                            len as usize,
                        )
                    };
                } else {
                    status = WcStatus::LocLenErr;
                }
            }
            let wc = WorkCompletion {
                wr_id: recv.wr_id,
                status,
                opcode: if wr.opcode == WrOpcode::Send {
                    WcOpcode::Recv
                } else {
                    WcOpcode::RecvRdmaWithImm
                },
                qp_num: peer_qpn,
                byte_len: len,
                imm_data: wr.imm_data,
                wc_flags: if wr.opcode == WrOpcode::Send {
                    WcFlags::empty()
                } else {
                    WcFlags::WITH_IMM
                },
            };
            if Self::complete(state, recv_cq, wc).is_err() {
                return WcStatus::RemOpErr;
            }
            if status != WcStatus::Success {
                return WcStatus::RemOpErr;
            }
        }
        WcStatus::Success
    }
}

impl Verbs for SoftFabric {
    fn get_devices(&self) -> Result<Vec<DeviceHandle>, VerbsError> {
        Ok((0..self.shared.devices.len())
            .map(|i| self.device_handle(i))
            .collect())
    }

    fn open_device(&self, device: &DeviceHandle) -> Result<Handle, VerbsError> {
        let index = device.id.0 as usize;
        if index == 0 || index > self.shared.devices.len() {
            return Err(VerbsError::from_errno(libc::ENODEV));
        }
        let mut state = self.shared.state.lock();
        Ok(self.open_context_locked(&mut state, index - 1))
    }

    fn close_device(&self, ctx: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        state.contexts.remove(&ctx).map(|_| ()).ok_or_else(einval)
    }

    fn query_port(&self, ctx: Handle, port_num: u8) -> Result<PortAttr, VerbsError> {
        let state = self.shared.state.lock();
        let device = state.contexts.get(&ctx).ok_or_else(einval)?.device;
        if port_num != 1 {
            return Err(einval());
        }
        let spec = &self.shared.devices[device];
        Ok(PortAttr {
            state: PortState::Active,
            lid: spec.lid,
            active_mtu: Mtu::Mtu1024,
            gid_tbl_len: spec.gids.len() as u8,
        })
    }

    fn query_gid(&self, ctx: Handle, port_num: u8, index: u8) -> Result<Gid, VerbsError> {
        let state = self.shared.state.lock();
        let device = state.contexts.get(&ctx).ok_or_else(einval)?.device;
        if port_num != 1 {
            return Err(einval());
        }
        self.shared.devices[device]
            .gids
            .get(index as usize)
            .copied()
            .ok_or_else(einval)
    }

    fn alloc_pd(&self, ctx: Handle) -> Result<Handle, VerbsError> {
        let mut state = self.shared.state.lock();
        if !state.contexts.contains_key(&ctx) {
            return Err(einval());
        }
        let handle = state.alloc_handle();
        state.pds.insert(handle, PdEntry { ctx });
        Ok(handle)
    }

    fn dealloc_pd(&self, pd: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let busy = state.mrs.values().any(|mr| mr.pd == pd)
            || state.qps.values().any(|qp| qp.pd == pd);
        if busy {
            return Err(VerbsError::from_errno(libc::EBUSY));
        }
        state.pds.remove(&pd).map(|_| ()).ok_or_else(einval)
    }

    fn create_cq(&self, ctx: Handle, cqe: u32) -> Result<Handle, VerbsError> {
        let mut state = self.shared.state.lock();
        if !state.contexts.contains_key(&ctx) || cqe == 0 || cqe > MAX_CQE {
            return Err(einval());
        }
        Ok(self.create_cq_locked(&mut state, ctx, cqe))
    }

    fn destroy_cq(&self, cq: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        if state.qps.values().any(|qp| qp.send_cq == cq || qp.recv_cq == cq) {
            return Err(VerbsError::from_errno(libc::EBUSY));
        }
        state.cqs.remove(&cq).map(|_| ()).ok_or_else(einval)
    }

    unsafe fn reg_mr(
        &self,
        pd: Handle,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrDesc, VerbsError> {
        if !self.shared.profile.supports_reg_mr {
            return Err(VerbsError::UnsupportedShape(
                "MR(pd, buffer, access) is not accepted by this build".to_owned(),
            ));
        }
        if addr.is_null() || len == 0 {
            return Err(einval());
        }
        let mut state = self.shared.state.lock();
        register(&mut state, pd, addr as u64, len, access, None)
    }

    fn alloc_mr(&self, pd: Handle, len: usize, access: AccessFlags) -> Result<MrDesc, VerbsError> {
        let buf = AlignedBuffer::new(len).map_err(|e| match e {
            crate::mr::Error::ZeroLength => einval(),
            _ => VerbsError::from_errno(libc::ENOMEM),
        })?;
        let addr = buf.as_ptr() as u64;
        let mut state = self.shared.state.lock();
        register(&mut state, pd, addr, len, access, Some(buf))
    }

    fn dereg_mr(&self, mr: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        state.mrs.remove(&mr).map(|_| ()).ok_or_else(einval)
    }

    fn create_qp(&self, args: QpCreateArgs<'_>) -> Result<Option<QpDesc>, VerbsError> {
        self.check_qp_shape(&args)?;
        let pd = args.pd().ok_or_else(|| {
            VerbsError::UnsupportedShape("QP() requires a protection domain".to_owned())
        })?;
        let default_attr = QpInitAttr::default();
        let attr = args.attr().unwrap_or(&default_attr);
        let mut state = self.shared.state.lock();
        self.create_qp_locked(&mut state, pd, attr, None).map(Some)
    }

    fn destroy_qp(&self, qp: Handle) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        state.qps.remove(&qp).ok_or_else(einval)?;
        for id in state.ids.values_mut() {
            if id.qp == Some(qp) {
                id.qp = None;
            }
        }
        Ok(())
    }

    fn modify_qp(&self, qp: Handle, attr: &QpAttr, mask: QpAttrMask) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        if self.shared.profile.fault_on_transition == Some(attr.qp_state) {
            let entry = state.qps.get_mut(&qp).ok_or_else(einval)?;
            log::warn!("soft: injected fault moving qp {:#x} to {}", entry.qp_num, attr.qp_state);
            entry.state = QpState::Error;
            return Err(VerbsError::from_errno(libc::EIO));
        }
        let entry = state.qps.get(&qp).ok_or_else(einval)?;
        self.validate_transition(&state, entry, attr, mask)?;

        let entry = state.qps.get_mut(&qp).ok_or_else(einval)?;
        let mut flushed = Vec::new();
        match attr.qp_state {
            QpState::Init => entry.access = attr.qp_access_flags,
            QpState::Rtr => entry.dest_qp_num = attr.dest_qp_num,
            QpState::Reset => {
                entry.recv_queue.clear();
                entry.dest_qp_num = 0;
            }
            QpState::Error => flushed.extend(entry.recv_queue.drain(..)),
            _ => {}
        }
        entry.state = attr.qp_state;
        let (recv_cq, qp_num) = (entry.recv_cq, entry.qp_num);
        for recv in flushed {
            let wc = WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::WrFlushErr,
                opcode: WcOpcode::Recv,
                qp_num,
                byte_len: 0,
                imm_data: 0,
                wc_flags: WcFlags::empty(),
            };
            // An overrun CQ drops flush completions, as hardware does.
            let _ = Self::complete(&mut state, recv_cq, wc);
        }
        Ok(())
    }

    fn query_qp_state(&self, qp: Handle) -> Result<QpState, VerbsError> {
        let state = self.shared.state.lock();
        state.qps.get(&qp).map(|qp| qp.state).ok_or_else(einval)
    }

    unsafe fn post_send(&self, qp: Handle, wr: &SendWr) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.qps.get(&qp).ok_or_else(einval)?;
        if entry.state != QpState::Rts {
            return Err(einval());
        }
        let (send_cq, qp_num, signal_all) = (entry.send_cq, entry.qp_num, entry.sq_sig_all);

        let status = Self::execute(&mut state, qp, wr);
        if status != WcStatus::Success {
            log::debug!("soft: wr {} on qp {:#x} failed: {}", wr.wr_id, qp_num, status);
            if let Some(entry) = state.qps.get_mut(&qp) {
                entry.state = QpState::Error;
            }
        }
        // Failed requests always generate a completion.
        if status != WcStatus::Success || signal_all || wr.send_flags.contains(SendFlags::SIGNALED)
        {
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: match wr.opcode {
                    WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
                    WrOpcode::RdmaRead => WcOpcode::RdmaRead,
                    WrOpcode::Send => WcOpcode::Send,
                },
                qp_num,
                byte_len: wr.sge.length,
                imm_data: 0,
                wc_flags: WcFlags::empty(),
            };
            Self::complete(&mut state, send_cq, wc)?;
        }
        Ok(())
    }

    unsafe fn post_recv(&self, qp: Handle, wr: &RecvWr) -> Result<(), VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.qps.get_mut(&qp).ok_or_else(einval)?;
        if matches!(entry.state, QpState::Reset | QpState::Error) {
            return Err(einval());
        }
        if entry.recv_queue.len() >= entry.cap.max_recv_wr as usize {
            return Err(VerbsError::from_errno(libc::ENOMEM));
        }
        entry.recv_queue.push_back(*wr);
        Ok(())
    }

    fn poll_cq(&self, cq: Handle, wc: &mut [WorkCompletion]) -> Result<usize, VerbsError> {
        let mut state = self.shared.state.lock();
        let entry = state.cqs.get_mut(&cq).ok_or_else(einval)?;
        let mut n = 0;
        while n < wc.len() {
            match entry.entries.pop_front() {
                Some(c) => {
                    wc[n] = c;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

fn register(
    state: &mut State,
    pd: Handle,
    addr: u64,
    len: usize,
    access: AccessFlags,
    owned: Option<AlignedBuffer>,
) -> Result<MrDesc, VerbsError> {
    if !state.pds.contains_key(&pd) {
        return Err(einval());
    }
    // Remote write access requires local write, as on real hardware.
    if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE) {
        return Err(einval());
    }
    let handle = state.alloc_handle();
    let lkey = state.alloc_key();
    let rkey = state.alloc_key();
    state.mrs.insert(
        handle,
        MrEntry {
            pd,
            addr,
            len,
            lkey,
            rkey,
            access,
            _owned: owned,
        },
    );
    Ok(MrDesc {
        handle,
        addr,
        len,
        lkey,
        rkey,
    })
}
