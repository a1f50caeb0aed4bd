//! Connection-manager surface: event channels, CM ids and the events they deliver.
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ibv::{DeviceHandle, Handle, QpCreateArgs, QpDesc, QpInitAttr, Verbs, VerbsError};

/// Largest private-data blob a connect request may carry.
pub const MAX_CONNECT_PRIVATE_DATA: usize = 56;
/// Largest private-data blob an accept (or reject) may carry.
pub const MAX_ACCEPT_PRIVATE_DATA: usize = 196;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    Tcp,
    Udp,
    Ib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
}

impl fmt::Display for CmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmEventType::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventType::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventType::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventType::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventType::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventType::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventType::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventType::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventType::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventType::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventType::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventType::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventType::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent {
    pub event: CmEventType,
    pub status: i32,
    /// For a connect request this is the newly created id for the incoming connection.
    pub id: Handle,
    pub listen_id: Option<Handle>,
    pub private_data: Vec<u8>,
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event)?;
        if self.status != 0 {
            write!(f, " (status {})", self.status)?;
        }
        Ok(())
    }
}

impl CmEvent {
    #[inline]
    pub fn event(&self) -> CmEventType {
        self.event
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.status
    }

    #[inline]
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnParam {
    pub private_data: Vec<u8>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub srq: u8,
    pub qp_num: u32,
}

/// Where a CM id's device context can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextLookup {
    Found { ctx: Handle, device: DeviceHandle },
    /// The id carries no context (e.g. bound to a wildcard address); enumerate devices instead.
    NoContext,
}

/// The capability surface of a connection manager.
pub trait ConnectionManager: Send + Sync {
    /// The verbs provider backing the contexts and queue pairs this manager hands out.
    fn verbs(&self) -> Arc<dyn Verbs>;

    fn create_event_channel(&self) -> Result<Handle, VerbsError>;
    fn destroy_event_channel(&self, channel: Handle) -> Result<(), VerbsError>;
    /// Non-blocking: `Ok(None)` when nothing is queued.
    fn get_cm_event(&self, channel: Handle) -> Result<Option<CmEvent>, VerbsError>;

    fn create_id(&self, channel: Handle, ps: PortSpace) -> Result<Handle, VerbsError>;
    fn destroy_id(&self, id: Handle) -> Result<(), VerbsError>;
    fn bind_addr(&self, id: Handle, addr: &SocketAddr) -> Result<(), VerbsError>;
    fn listen(&self, id: Handle, backlog: i32) -> Result<(), VerbsError>;
    fn resolve_addr(
        &self,
        id: Handle,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        timeout_ms: i32,
    ) -> Result<(), VerbsError>;
    fn resolve_route(&self, id: Handle, timeout_ms: i32) -> Result<(), VerbsError>;
    fn local_addr(&self, id: Handle) -> Option<SocketAddr>;

    fn context(&self, id: Handle) -> ContextLookup;
    /// `Ok(None)` means the build hands the queue pair back through [`ConnectionManager::qp`].
    fn create_qp(&self, id: Handle, args: QpCreateArgs<'_>) -> Result<Option<QpDesc>, VerbsError>;
    fn qp(&self, id: Handle) -> Option<QpDesc>;
    /// Creation attributes the manager would pick for this id.
    fn init_qp_attr(&self, id: Handle) -> Result<QpInitAttr, VerbsError>;

    fn connect(&self, id: Handle, param: &ConnParam) -> Result<(), VerbsError>;
    fn accept(&self, id: Handle, param: &ConnParam) -> Result<(), VerbsError>;
    fn reject(&self, id: Handle, private_data: &[u8]) -> Result<(), VerbsError>;
    fn disconnect(&self, id: Handle) -> Result<(), VerbsError>;
}

pub struct EventChannel {
    cm: Arc<dyn ConnectionManager>,
    handle: Handle,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventChannel").field(&self.handle).finish()
    }
}

impl EventChannel {
    pub fn create_event_channel(cm: Arc<dyn ConnectionManager>) -> Result<Self, VerbsError> {
        let handle = cm.create_event_channel()?;
        Ok(EventChannel { cm, handle })
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn cm(&self) -> &Arc<dyn ConnectionManager> {
        &self.cm
    }

    #[inline]
    pub fn try_get_cm_event(&self) -> Result<Option<CmEvent>, VerbsError> {
        self.cm.get_cm_event(self.handle)
    }

    /// Block until the next event arrives, sleeping `interval` between empty polls.
    pub fn get_cm_event(&self, interval: Duration) -> Result<CmEvent, VerbsError> {
        loop {
            if let Some(event) = self.try_get_cm_event()? {
                log::debug!("get_cm_event: {}", event);
                return Ok(event);
            }
            thread::sleep(interval);
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Err(e) = self.cm.destroy_event_channel(self.handle) {
            log::debug!("error occured when destroying event channel: {}", e);
        }
    }
}

/// A CM id. It must not outlive the event channel it reports to.
pub struct CmId<'ec> {
    channel: &'ec EventChannel,
    handle: Handle,
    released: bool,
}

impl<'ec> fmt::Debug for CmId<'ec> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CmId").field(&self.handle).finish()
    }
}

impl<'ec> CmId<'ec> {
    pub fn create_id(channel: &'ec EventChannel, ps: PortSpace) -> Result<Self, VerbsError> {
        let handle = channel.cm.create_id(channel.handle, ps)?;
        Ok(CmId {
            channel,
            handle,
            released: false,
        })
    }

    /// Take ownership of the id a connect request created. `None` for any other event.
    pub fn from_request(channel: &'ec EventChannel, event: &CmEvent) -> Option<Self> {
        if event.event != CmEventType::ConnectRequest {
            return None;
        }
        Some(CmId {
            channel,
            handle: event.id,
            released: false,
        })
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn event_channel(&self) -> &'ec EventChannel {
        self.channel
    }

    #[inline]
    pub fn verbs(&self) -> Arc<dyn Verbs> {
        self.channel.cm.verbs()
    }

    pub fn bind_addr(&self, addr: &SocketAddr) -> Result<(), VerbsError> {
        self.channel.cm.bind_addr(self.handle, addr)
    }

    pub fn listen(&self, backlog: i32) -> Result<(), VerbsError> {
        self.channel.cm.listen(self.handle, backlog)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.cm.local_addr(self.handle)
    }

    pub fn resolve_addr(
        &self,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        timeout_ms: i32,
    ) -> Result<(), VerbsError> {
        self.channel.cm.resolve_addr(self.handle, src, dst, timeout_ms)
    }

    pub fn resolve_route(&self, timeout_ms: i32) -> Result<(), VerbsError> {
        self.channel.cm.resolve_route(self.handle, timeout_ms)
    }

    pub fn context(&self) -> ContextLookup {
        self.channel.cm.context(self.handle)
    }

    #[must_use]
    pub fn create_qp(&self, args: QpCreateArgs<'_>) -> Result<Option<QpDesc>, VerbsError> {
        self.channel.cm.create_qp(self.handle, args)
    }

    /// The queue pair attached to this id, however it got there.
    pub fn qp(&self) -> Option<QpDesc> {
        self.channel.cm.qp(self.handle)
    }

    pub fn init_qp_attr(&self) -> Result<QpInitAttr, VerbsError> {
        self.channel.cm.init_qp_attr(self.handle)
    }

    pub fn connect(&self, param: &ConnParam) -> Result<(), VerbsError> {
        self.channel.cm.connect(self.handle, param)
    }

    pub fn accept(&self, param: &ConnParam) -> Result<(), VerbsError> {
        self.channel.cm.accept(self.handle, param)
    }

    pub fn reject(&self, private_data: &[u8]) -> Result<(), VerbsError> {
        self.channel.cm.reject(self.handle, private_data)
    }

    pub fn disconnect(&self) -> Result<(), VerbsError> {
        self.channel.cm.disconnect(self.handle)
    }

    pub fn release(&mut self) -> Result<(), VerbsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.channel.cm.destroy_id(self.handle)
    }
}

impl<'ec> Drop for CmId<'ec> {
    fn drop(&mut self) {
        log::debug!("dropping CmId {}", self.handle);
        if let Err(e) = self.release() {
            log::debug!("error occured when destroying cm_id: {}", e);
        }
    }
}
