//! Data-path operations over one connected queue pair.
//!
//! At most one signaled request is in flight at a time; every blocking call posts it and then
//! spins on the queue pair's send CQ until that single completion comes back.
use std::hint;
use std::ops::Range;
use std::time::{Duration, Instant};

use rdma::ibv::{
    QueuePair, RecvWr, SendFlags, SendWr, Sge, WcFlags, WcStatus, WorkCompletion, WrOpcode,
};
use rdma::mr::{MemoryRegion, RemoteKey};

use crate::peer::RemoteBufInfo;
use crate::{Error, Result};

pub struct Ops<'a, 'res> {
    qp: &'a QueuePair<'res>,
    outstanding: Option<u64>,
    next_wr_id: u64,
}

impl<'a, 'res> Ops<'a, 'res> {
    pub fn new(qp: &'a QueuePair<'res>) -> Self {
        Ops {
            qp,
            outstanding: None,
            next_wr_id: 1,
        }
    }

    #[inline]
    pub fn qp(&self) -> &'a QueuePair<'res> {
        self.qp
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// RDMA WRITE `mr[range]` to `remote.addr + remote_offset`, and wait for it.
    pub fn write(
        &mut self,
        mr: &MemoryRegion<'_>,
        range: Range<usize>,
        remote: RemoteKey,
        remote_offset: u64,
    ) -> Result<WorkCompletion> {
        // SAFETY: `mr` stays borrowed until the completion has been polled below.
        unsafe { self.post_write(mr, range, remote, remote_offset)? };
        self.poll_one()
    }

    /// RDMA READ from `remote.addr + remote_offset` into `mr[range]`, and wait for it.
    pub fn read(
        &mut self,
        mr: &mut MemoryRegion<'_>,
        range: Range<usize>,
        remote: RemoteKey,
        remote_offset: u64,
    ) -> Result<WorkCompletion> {
        // SAFETY: `mr` stays mutably borrowed until the completion has been polled below.
        unsafe { self.post_read(mr, range, remote, remote_offset)? };
        self.poll_one()
    }

    /// RDMA WRITE with immediate data, consuming one receive on the peer. The immediate value is
    /// the payload length.
    pub fn write_with_imm(
        &mut self,
        mr: &MemoryRegion<'_>,
        range: Range<usize>,
        remote: RemoteKey,
        remote_offset: u64,
    ) -> Result<WorkCompletion> {
        let imm = range.len() as u32;
        let sge = Self::sge(mr, range)?;
        let wr = self.send_wr(WrOpcode::RdmaWriteWithImm, sge, remote, remote_offset, imm)?;
        // SAFETY: `mr` stays borrowed until the completion has been polled below.
        unsafe { self.post(wr)? };
        self.poll_one()
    }

    /// # Safety
    ///
    /// `mr[range]` must not be modified or released until [`Ops::poll_one`] returns the
    /// completion of this request.
    pub unsafe fn post_write(
        &mut self,
        mr: &MemoryRegion<'_>,
        range: Range<usize>,
        remote: RemoteKey,
        remote_offset: u64,
    ) -> Result<u64> {
        let sge = Self::sge(mr, range)?;
        let wr = self.send_wr(WrOpcode::RdmaWrite, sge, remote, remote_offset, 0)?;
        self.post(wr)
    }

    /// # Safety
    ///
    /// `mr[range]` must not be accessed or released until [`Ops::poll_one`] returns the
    /// completion of this request.
    pub unsafe fn post_read(
        &mut self,
        mr: &MemoryRegion<'_>,
        range: Range<usize>,
        remote: RemoteKey,
        remote_offset: u64,
    ) -> Result<u64> {
        let sge = Self::sge(mr, range)?;
        let wr = self.send_wr(WrOpcode::RdmaRead, sge, remote, remote_offset, 0)?;
        self.post(wr)
    }

    unsafe fn post(&mut self, wr: SendWr) -> Result<u64> {
        if let Some(wr_id) = self.outstanding {
            tracing::debug!("qp {:#x}: wr {} still outstanding", self.qp.qp_num(), wr_id);
            return Err(Error::Busy);
        }
        self.qp.post_send(&wr).map_err(|source| Error::Provisioning {
            resource: "send work request",
            source,
        })?;
        self.next_wr_id += 1;
        self.outstanding = Some(wr.wr_id);
        Ok(wr.wr_id)
    }

    /// Spin on the send CQ until the outstanding request completes.
    pub fn poll_one(&mut self) -> Result<WorkCompletion> {
        let wr_id = self.outstanding.ok_or(Error::Idle)?;
        let mut wc = [WorkCompletion::default()];
        loop {
            let n = self.qp.poll_send_cq(&mut wc).map_err(|source| Error::Provisioning {
                resource: "send completion",
                source,
            })?;
            if n == 1 {
                break;
            }
            hint::spin_loop();
        }
        self.outstanding = None;
        let wc = wc[0];
        if wc.status != WcStatus::Success {
            tracing::warn!("qp {:#x}: wr {} completed with {}", self.qp.qp_num(), wc.wr_id, wc.status);
            return Err(Error::Completion(wc.status));
        }
        if wc.wr_id != wr_id {
            return Err(Error::violation(
                format!("completion of wr {}", wr_id),
                format!("wr {}", wc.wr_id),
            ));
        }
        Ok(wc)
    }

    /// Post a receive for an immediate-data notification landing in `mr[range]`.
    ///
    /// # Safety
    ///
    /// `mr[range]` must not be accessed or released until the receive completes.
    pub unsafe fn post_recv(
        &self,
        mr: &MemoryRegion<'_>,
        range: Range<usize>,
        wr_id: u64,
    ) -> Result<()> {
        let sge = Self::sge(mr, range)?;
        self.qp
            .post_recv(&RecvWr { wr_id, sge })
            .map_err(|source| Error::Provisioning {
                resource: "receive work request",
                source,
            })
    }

    /// Non-blocking check of the receive CQ.
    pub fn poll_recv(&self) -> Result<Option<WorkCompletion>> {
        let mut wc = [WorkCompletion::default()];
        let n = self.qp.poll_recv_cq(&mut wc).map_err(|source| Error::Provisioning {
            resource: "receive completion",
            source,
        })?;
        if n == 0 {
            return Ok(None);
        }
        match wc[0].status {
            WcStatus::Success => Ok(Some(wc[0])),
            status => Err(Error::Completion(status)),
        }
    }

    /// Spin until a receive completes.
    pub fn wait_recv(&self) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.poll_recv()? {
                return Ok(wc);
            }
            hint::spin_loop();
        }
    }

    /// Write `mr[..len]` to the peer's buffer in `chunk`-byte pieces, one at a time. Stops at the
    /// peer's buffer length.
    pub fn bulk_write(
        &mut self,
        mr: &MemoryRegion<'_>,
        len: usize,
        remote: &RemoteBufInfo,
        chunk: usize,
    ) -> Result<BulkReport> {
        let total = len.min(remote.len as usize).min(mr.len());
        if total < len {
            tracing::warn!("bulk write capped at {} of {} bytes", total, len);
        }
        let chunk = chunk.max(1);
        let start = Instant::now();
        let mut chunks = 0;
        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk).min(total);
            self.write(mr, offset..end, remote.remote_key(), offset as u64)?;
            chunks += 1;
            offset = end;
        }
        Ok(BulkReport {
            bytes: total,
            chunks,
            elapsed: start.elapsed(),
        })
    }

    fn sge(mr: &MemoryRegion<'_>, range: Range<usize>) -> Result<Sge> {
        let len = range.len();
        mr.sge(range.start, len).ok_or_else(|| {
            Error::violation(
                format!("a range within {} registered bytes", mr.len()),
                format!("{:?}", range),
            )
        })
    }

    fn send_wr(
        &self,
        opcode: WrOpcode,
        sge: Sge,
        remote: RemoteKey,
        remote_offset: u64,
        imm: u32,
    ) -> Result<SendWr> {
        let remote_addr = remote.addr.checked_add(remote_offset).ok_or_else(|| {
            Error::violation(
                "a remote address within the 64-bit space",
                format!("{:#x} + {}", remote.addr, remote_offset),
            )
        })?;
        Ok(SendWr {
            wr_id: self.next_wr_id,
            opcode,
            sge,
            remote_addr,
            rkey: remote.rkey,
            imm_data: imm.to_be(),
            send_flags: SendFlags::SIGNALED,
        })
    }
}

/// The immediate value of a receive completion, in host order.
pub fn imm_data(wc: &WorkCompletion) -> Option<u32> {
    if wc.wc_flags.contains(WcFlags::WITH_IMM) {
        Some(u32::from_be(wc.imm_data))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkReport {
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

impl BulkReport {
    pub fn gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs / 1e9
    }
}
