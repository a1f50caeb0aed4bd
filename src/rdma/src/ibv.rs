//! Verbs provider surface and the owned resource handles built on top of it.
//!
//! A [`Verbs`] implementation is the only thing that touches hardware (or, for
//! [`crate::soft`], an in-process fabric). Everything here is plain data plus
//! RAII wrappers whose lifetimes encode the context → domain → queue pair
//! ownership chain.
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerbsError {
    /// The provider build does not accept this call shape (wrong arity or argument kind).
    #[error("Unsupported call shape: {0}.")]
    UnsupportedShape(String),
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
}

impl VerbsError {
    #[inline]
    pub fn from_errno(errno: i32) -> Self {
        VerbsError::Io(io::Error::from_raw_os_error(errno))
    }

    #[inline]
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, VerbsError::UnsupportedShape(_))
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            VerbsError::Io(e) => e.raw_os_error(),
            VerbsError::UnsupportedShape(_) => None,
        }
    }
}

/// Provider-side identifier of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: Handle,
    pub name: String,
}

/// A 128-bit global identifier, printed as eight colon-separated groups of four hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    #[inline]
    pub const fn from_raw(raw: [u8; 16]) -> Self {
        Gid { raw }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.raw
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.raw.iter().all(|&b| b == 0)
    }

    pub fn subnet_prefix(&self) -> u64 {
        u64::from_be_bytes(self.raw[..8].try_into().unwrap_or_default())
    }

    pub fn interface_id(&self) -> u64 {
        u64::from_be_bytes(self.raw[8..].try_into().unwrap_or_default())
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Gid { raw }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.raw.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid gid: {0:?}")]
pub struct GidParseError(pub String);

impl FromStr for Gid {
    type Err = GidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = s.split(':').collect();
        if groups.len() != 8 {
            return Err(GidParseError(s.to_owned()));
        }
        let mut raw = [0u8; 16];
        for (i, g) in groups.iter().enumerate() {
            if g.is_empty() || g.len() > 4 {
                return Err(GidParseError(s.to_owned()));
            }
            let v = u16::from_str_radix(g, 16).map_err(|_| GidParseError(s.to_owned()))?;
            raw[2 * i..2 * i + 2].copy_from_slice(&v.to_be_bytes());
        }
        Ok(Gid { raw })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    pub lid: u16,
    pub active_mtu: Mtu,
    pub gid_tbl_len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    #[default]
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    pub fn bytes(self) -> usize {
        128 << (self as usize)
    }
}

bitflags! {
    /// Memory region access permissions.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b0000_0001;
        const REMOTE_WRITE = 0b0000_0010;
        const REMOTE_READ = 0b0000_0100;
        const REMOTE_ATOMIC = 0b0000_1000;
    }

    /// Flags of the WR properties.
    #[derive(Default)]
    pub struct SendFlags: u32 {
        const FENCE = 0b0000_0001;
        /// Set the completion notification indicator.
        const SIGNALED = 0b0000_0010;
        const SOLICITED = 0b0000_0100;
        const INLINE = 0b0000_1000;
    }

    /// Which fields of a [`QpAttr`] a modify request carries.
    #[derive(Default)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const DEST_QPN = 1 << 20;
    }
}

impl AccessFlags {
    /// The permission set used for a window a peer may both read and write.
    pub fn remote_rw() -> Self {
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE
    }
}

impl QpAttrMask {
    /// The attribute groups a reliable-connection QP must supply for a given transition.
    pub fn required_for(from: QpState, to: QpState) -> Option<QpAttrMask> {
        use QpState::*;
        match (from, to) {
            (Reset, Init) => Some(
                QpAttrMask::STATE
                    | QpAttrMask::PKEY_INDEX
                    | QpAttrMask::PORT
                    | QpAttrMask::ACCESS_FLAGS,
            ),
            (Init, Rtr) => Some(
                QpAttrMask::STATE
                    | QpAttrMask::AV
                    | QpAttrMask::PATH_MTU
                    | QpAttrMask::DEST_QPN
                    | QpAttrMask::RQ_PSN
                    | QpAttrMask::MAX_DEST_RD_ATOMIC
                    | QpAttrMask::MIN_RNR_TIMER,
            ),
            (Rtr, Rts) => Some(
                QpAttrMask::STATE
                    | QpAttrMask::SQ_PSN
                    | QpAttrMask::TIMEOUT
                    | QpAttrMask::RETRY_CNT
                    | QpAttrMask::RNR_RETRY
                    | QpAttrMask::MAX_QP_RD_ATOMIC,
            ),
            (_, QpState::Error) | (_, Reset) => Some(QpAttrMask::STATE),
            _ => None,
        }
    }
}

/// The type of QP used for communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QpType {
    /// reliable connection
    #[default]
    RC,
    /// unreliable datagram
    UD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QpCapability {
    fn default() -> Self {
        QpCapability {
            max_send_wr: 32,
            max_recv_wr: 32,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// Creation attributes. Every optional group may be omitted when a provider build rejects it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub send_cq: Option<Handle>,
    pub recv_cq: Option<Handle>,
    pub cap: Option<QpCapability>,
    pub sq_sig_all: Option<bool>,
}

/// The argument shapes a provider build may accept for queue-pair creation.
#[derive(Debug, Clone, Copy)]
pub enum QpCreateArgs<'a> {
    PdAndAttr(Handle, &'a QpInitAttr),
    Attr(&'a QpInitAttr),
    Pd(Handle),
    Empty,
    /// The extended form, where the domain travels inside the attribute object.
    Extended(Handle, &'a QpInitAttr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpShape {
    PdAndAttr,
    Attr,
    Pd,
    Empty,
    Extended,
}

impl fmt::Display for QpShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QpShape::PdAndAttr => "(pd, attr)",
            QpShape::Attr => "(attr)",
            QpShape::Pd => "(pd)",
            QpShape::Empty => "()",
            QpShape::Extended => "(attr_ex)",
        };
        f.write_str(s)
    }
}

impl<'a> QpCreateArgs<'a> {
    pub fn shape(&self) -> QpShape {
        match self {
            QpCreateArgs::PdAndAttr(..) => QpShape::PdAndAttr,
            QpCreateArgs::Attr(_) => QpShape::Attr,
            QpCreateArgs::Pd(_) => QpShape::Pd,
            QpCreateArgs::Empty => QpShape::Empty,
            QpCreateArgs::Extended(..) => QpShape::Extended,
        }
    }

    pub fn pd(&self) -> Option<Handle> {
        match *self {
            QpCreateArgs::PdAndAttr(pd, _) | QpCreateArgs::Pd(pd) | QpCreateArgs::Extended(pd, _) => {
                Some(pd)
            }
            _ => None,
        }
    }

    pub fn attr(&self) -> Option<&'a QpInitAttr> {
        match *self {
            QpCreateArgs::PdAndAttr(_, a) | QpCreateArgs::Attr(a) | QpCreateArgs::Extended(_, a) => {
                Some(a)
            }
            _ => None,
        }
    }
}

/// What a provider reports back about a created queue pair.
#[derive(Debug, Clone, PartialEq)]
pub struct QpDesc {
    pub handle: Handle,
    pub qp_num: u32,
    pub pd: Handle,
    pub send_cq: Handle,
    pub recv_cq: Handle,
    pub cap: QpCapability,
    pub sq_sig_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address vector. `grh` set means routed addressing; otherwise `dlid` addresses the local fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhAttr {
    pub grh: Option<GlobalRoute>,
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub pkey_index: u16,
    pub port_num: u8,
    pub qp_access_flags: AccessFlags,
    pub path_mtu: Mtu,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub ah_attr: AhAttr,
    pub sq_psn: u32,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    RdmaWrite,
    RdmaWriteWithImm,
    RdmaRead,
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sge: Sge,
    pub remote_addr: u64,
    pub rkey: u32,
    /// Network byte order, as carried on the wire.
    pub imm_data: u32,
    pub send_flags: SendFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    GeneralErr,
    Other(u32),
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocQpOpErr => "local QP operation error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::WrFlushErr => "Work Request Flushed Error",
            WcStatus::RemInvReqErr => "invalid request error",
            WcStatus::RemAccessErr => "remote access error",
            WcStatus::RemOpErr => "remote operation error",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
            WcStatus::RnrRetryExcErr => "RNR retry counter exceeded",
            WcStatus::GeneralErr => "general error",
            WcStatus::Other(code) => return write!(f, "unknown status {}", code),
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

bitflags! {
    /// Flags of the completed WR.
    #[derive(Default)]
    pub struct WcFlags: u32 {
        const GRH = 0b0000_0001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b0000_0010;
    }
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub qp_num: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub wc_flags: WcFlags,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        WorkCompletion {
            wr_id: 0,
            status: WcStatus::GeneralErr,
            opcode: WcOpcode::Invalid,
            qp_num: 0,
            byte_len: 0,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }
}

/// Registration keys and window reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrDesc {
    pub handle: Handle,
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

/// The capability surface of a verbs provider.
///
/// Shape-level rejections are reported as [`VerbsError::UnsupportedShape`]; everything else is a
/// substantive error.
pub trait Verbs: Send + Sync {
    fn get_devices(&self) -> Result<Vec<DeviceHandle>, VerbsError>;
    fn open_device(&self, device: &DeviceHandle) -> Result<Handle, VerbsError>;
    fn close_device(&self, ctx: Handle) -> Result<(), VerbsError>;
    fn query_port(&self, ctx: Handle, port_num: u8) -> Result<PortAttr, VerbsError>;
    fn query_gid(&self, ctx: Handle, port_num: u8, index: u8) -> Result<Gid, VerbsError>;

    fn alloc_pd(&self, ctx: Handle) -> Result<Handle, VerbsError>;
    fn dealloc_pd(&self, pd: Handle) -> Result<(), VerbsError>;

    fn create_cq(&self, ctx: Handle, cqe: u32) -> Result<Handle, VerbsError>;
    fn destroy_cq(&self, cq: Handle) -> Result<(), VerbsError>;

    /// # Safety
    ///
    /// `addr..addr + len` must stay valid and unaliased by Rust references the provider can see
    /// until the region is deregistered.
    unsafe fn reg_mr(
        &self,
        pd: Handle,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrDesc, VerbsError>;
    /// Let the provider allocate and pin `len` bytes itself.
    fn alloc_mr(&self, pd: Handle, len: usize, access: AccessFlags) -> Result<MrDesc, VerbsError>;
    fn dereg_mr(&self, mr: Handle) -> Result<(), VerbsError>;

    /// `Ok(None)` means the build hands the queue pair back some other way (or not at all).
    fn create_qp(&self, args: QpCreateArgs<'_>) -> Result<Option<QpDesc>, VerbsError>;
    fn destroy_qp(&self, qp: Handle) -> Result<(), VerbsError>;
    fn modify_qp(&self, qp: Handle, attr: &QpAttr, mask: QpAttrMask) -> Result<(), VerbsError>;
    fn query_qp_state(&self, qp: Handle) -> Result<QpState, VerbsError>;

    /// # Safety
    ///
    /// The local SGE must reference memory registered under `wr.sge.lkey` that stays valid until
    /// the matching completion is polled.
    unsafe fn post_send(&self, qp: Handle, wr: &SendWr) -> Result<(), VerbsError>;
    /// # Safety
    ///
    /// Same contract as [`Verbs::post_send`].
    unsafe fn post_recv(&self, qp: Handle, wr: &RecvWr) -> Result<(), VerbsError>;
    fn poll_cq(&self, cq: Handle, wc: &mut [WorkCompletion]) -> Result<usize, VerbsError>;
}

/// An opened device. Every other resource borrows it, so it is torn down last.
pub struct Context {
    verbs: Arc<dyn Verbs>,
    handle: Handle,
    device: DeviceHandle,
    owned: bool,
    released: bool,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("device", &self.device.name)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Context {
    pub fn open(verbs: Arc<dyn Verbs>, device: &DeviceHandle) -> Result<Self, VerbsError> {
        let handle = verbs.open_device(device)?;
        log::debug!("opened device {} as context {}", device.name, handle);
        Ok(Context {
            verbs,
            handle,
            device: device.clone(),
            owned: true,
            released: false,
        })
    }

    /// Wrap a context some other component (e.g. the connection manager) owns. Releasing it is a
    /// no-op.
    pub fn borrowed(verbs: Arc<dyn Verbs>, handle: Handle, device: DeviceHandle) -> Self {
        Context {
            verbs,
            handle,
            device,
            owned: false,
            released: false,
        }
    }

    #[inline]
    pub fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.verbs
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn query_port(&self, port_num: u8) -> Result<PortAttr, VerbsError> {
        self.verbs.query_port(self.handle, port_num)
    }

    pub fn query_gid(&self, port_num: u8, index: u8) -> Result<Gid, VerbsError> {
        self.verbs.query_gid(self.handle, port_num, index)
    }

    pub fn alloc_pd(&self) -> Result<ProtectionDomain<'_>, VerbsError> {
        let handle = self.verbs.alloc_pd(self.handle)?;
        Ok(ProtectionDomain {
            ctx: self,
            handle,
            released: false,
        })
    }

    pub fn create_cq(&self, cqe: u32) -> Result<CompletionQueue<'_>, VerbsError> {
        let handle = self.verbs.create_cq(self.handle, cqe)?;
        Ok(CompletionQueue {
            ctx: self,
            handle,
            cqe,
            released: false,
        })
    }

    pub fn release(&mut self) -> Result<(), VerbsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.owned {
            self.verbs.close_device(self.handle)?;
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("error occured when closing context {}: {}", self.handle, e);
        }
    }
}

pub struct ProtectionDomain<'ctx> {
    ctx: &'ctx Context,
    handle: Handle,
    released: bool,
}

impl<'ctx> fmt::Debug for ProtectionDomain<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionDomain").field("handle", &self.handle).finish()
    }
}

impl<'ctx> ProtectionDomain<'ctx> {
    #[inline]
    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn verbs(&self) -> &Arc<dyn Verbs> {
        self.ctx.verbs()
    }

    pub fn release(&mut self) -> Result<(), VerbsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.ctx.verbs.dealloc_pd(self.handle)
    }
}

impl<'ctx> Drop for ProtectionDomain<'ctx> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("error occured when deallocating pd {}: {}", self.handle, e);
        }
    }
}

pub struct CompletionQueue<'ctx> {
    ctx: &'ctx Context,
    handle: Handle,
    cqe: u32,
    released: bool,
}

impl<'ctx> fmt::Debug for CompletionQueue<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("handle", &self.handle)
            .field("cqe", &self.cqe)
            .finish()
    }
}

impl<'ctx> CompletionQueue<'ctx> {
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.cqe
    }

    /// Non-blocking. Returns how many entries of `wc` were filled.
    #[inline]
    pub fn poll(&self, wc: &mut [WorkCompletion]) -> Result<usize, VerbsError> {
        self.ctx.verbs.poll_cq(self.handle, wc)
    }

    /// Release the queue. Unpolled completions are discarded with it.
    pub fn release(&mut self) -> Result<(), VerbsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.ctx.verbs.destroy_cq(self.handle)
    }
}

impl<'ctx> Drop for CompletionQueue<'ctx> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("error occured when destroying cq {}: {}", self.handle, e);
        }
    }
}

/// A created queue pair. The recorded state machine lives one layer up; this only owns the
/// provider resource.
///
/// Releasing a queue pair while work requests posted on it are still outstanding is a caller
/// error.
pub struct QueuePair<'res> {
    verbs: Arc<dyn Verbs>,
    desc: QpDesc,
    released: bool,
    _phantom: PhantomData<&'res ()>,
}

impl<'res> fmt::Debug for QueuePair<'res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.desc.qp_num)
            .field("handle", &self.desc.handle)
            .finish()
    }
}

impl<'res> QueuePair<'res> {
    /// Adopt a provider-created queue pair. The caller picks `'res` so that it does not outlive
    /// the domain and completion queues it was created against.
    pub fn from_desc(verbs: Arc<dyn Verbs>, desc: QpDesc) -> Self {
        QueuePair {
            verbs,
            desc,
            released: false,
            _phantom: PhantomData,
        }
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.desc.qp_num
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.desc.handle
    }

    #[inline]
    pub fn desc(&self) -> &QpDesc {
        &self.desc
    }

    #[inline]
    pub fn send_cq(&self) -> Handle {
        self.desc.send_cq
    }

    #[inline]
    pub fn recv_cq(&self) -> Handle {
        self.desc.recv_cq
    }

    #[inline]
    pub fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.verbs
    }

    pub fn modify(&self, attr: &QpAttr, mask: QpAttrMask) -> Result<(), VerbsError> {
        self.verbs.modify_qp(self.desc.handle, attr, mask)
    }

    pub fn query_state(&self) -> Result<QpState, VerbsError> {
        self.verbs.query_qp_state(self.desc.handle)
    }

    /// # Safety
    ///
    /// See [`Verbs::post_send`].
    #[inline]
    pub unsafe fn post_send(&self, wr: &SendWr) -> Result<(), VerbsError> {
        self.verbs.post_send(self.desc.handle, wr)
    }

    /// # Safety
    ///
    /// See [`Verbs::post_recv`].
    #[inline]
    pub unsafe fn post_recv(&self, wr: &RecvWr) -> Result<(), VerbsError> {
        self.verbs.post_recv(self.desc.handle, wr)
    }

    #[inline]
    pub fn poll_send_cq(&self, wc: &mut [WorkCompletion]) -> Result<usize, VerbsError> {
        self.verbs.poll_cq(self.desc.send_cq, wc)
    }

    #[inline]
    pub fn poll_recv_cq(&self, wc: &mut [WorkCompletion]) -> Result<usize, VerbsError> {
        self.verbs.poll_cq(self.desc.recv_cq, wc)
    }

    pub fn release(&mut self) -> Result<(), VerbsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.verbs.destroy_qp(self.desc.handle)
    }
}

impl<'res> Drop for QueuePair<'res> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("error occured when destroying qp {}: {}", self.desc.qp_num, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_display_parse() {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[15] = 0x01;
        let gid = Gid::from_raw(raw);
        let s = gid.to_string();
        assert_eq!(s, "fe80:0000:0000:0000:0000:0000:0000:0001");
        assert_eq!(s.parse::<Gid>().unwrap(), gid);
        assert_eq!(gid.subnet_prefix(), 0xfe80_0000_0000_0000);
        assert_eq!(gid.interface_id(), 1);
    }

    #[test]
    fn test_gid_parse_rejects_garbage() {
        assert!("".parse::<Gid>().is_err());
        assert!("fe80::1".parse::<Gid>().is_err());
        assert!("zz80:0000:0000:0000:0000:0000:0000:0001".parse::<Gid>().is_err());
    }

    #[test]
    fn test_required_masks() {
        let init = QpAttrMask::required_for(QpState::Reset, QpState::Init).unwrap();
        assert!(init.contains(QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS));
        assert!(QpAttrMask::required_for(QpState::Reset, QpState::Rtr).is_none());
        assert!(QpAttrMask::required_for(QpState::Init, QpState::Rts).is_none());
        assert_eq!(
            QpAttrMask::required_for(QpState::Rts, QpState::Error),
            Some(QpAttrMask::STATE)
        );
    }

    #[test]
    fn test_create_args_shape() {
        let attr = QpInitAttr::default();
        let args = QpCreateArgs::PdAndAttr(Handle(1), &attr);
        assert_eq!(args.shape(), QpShape::PdAndAttr);
        assert_eq!(args.pd(), Some(Handle(1)));
        assert!(QpCreateArgs::Empty.attr().is_none());
        assert_eq!(Mtu::Mtu1024.bytes(), 1024);
    }
}
