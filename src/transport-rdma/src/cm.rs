//! The connection-manager handshake.
//!
//! The active side resolves the peer, connects and learns the passive side's buffer from the
//! `ESTABLISHED` private data. The passive side listens, waits for a connect request and accepts
//! with its own buffer description. Queue-pair construction happens in between, on the id the
//! caller holds, through [`crate::cascade::build_qp`].
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use rdma::ibv::Context;
use rdma::rdmacm::{CmEvent, CmEventType, CmId, ContextLookup, EventChannel, PortSpace};
use rdma::VerbsError;

use crate::config::RdmaTransportConfig;
use crate::device;
use crate::peer::RemoteBufInfo;
use crate::{Error, Result};

#[inline]
fn cm_err(e: VerbsError) -> Error {
    Error::Cm(e)
}

/// Wait for the next event on `channel`, sleeping `backoff` between empty polls, and require it
/// to be `expected`.
pub fn expect_event(
    channel: &EventChannel,
    expected: CmEventType,
    backoff: Duration,
) -> Result<CmEvent> {
    let event = channel.get_cm_event(backoff).map_err(cm_err)?;
    if event.event() != expected {
        tracing::warn!("expected {}, got {}", expected, event);
        return Err(Error::violation(expected, event));
    }
    Ok(event)
}

/// Active side: create an id and resolve `dst` (and, when configured, the route to it).
pub fn resolve<'ec>(
    channel: &'ec EventChannel,
    dst: &SocketAddr,
    config: &RdmaTransportConfig,
) -> Result<CmId<'ec>> {
    let id = CmId::create_id(channel, PortSpace::Tcp).map_err(cm_err)?;
    tracing::debug!("resolve_addr, cm_id: {:?}, dst: {}", id, dst);
    id.resolve_addr(config.src_addr.as_ref(), dst, config.resolve_timeout_ms)
        .map_err(cm_err)?;
    expect_event(channel, CmEventType::AddrResolved, config.connect_request_backoff())?;
    if config.resolve_route {
        tracing::debug!("resolve_route, cm_id: {:?}", id);
        id.resolve_route(config.resolve_timeout_ms).map_err(cm_err)?;
        expect_event(channel, CmEventType::RouteResolved, config.connect_request_backoff())?;
    }
    Ok(id)
}

/// Passive side: bind to `addr` and start listening.
pub fn listen<'ec>(
    channel: &'ec EventChannel,
    addr: &SocketAddr,
    config: &RdmaTransportConfig,
) -> Result<CmId<'ec>> {
    let id = CmId::create_id(channel, PortSpace::Tcp).map_err(cm_err)?;
    id.bind_addr(addr).map_err(cm_err)?;
    id.listen(config.backlog).map_err(cm_err)?;
    tracing::debug!("listen, cm_id: {:?}, addr: {:?}", id, id.local_addr());
    Ok(id)
}

fn is_transient(e: &VerbsError) -> bool {
    match e {
        VerbsError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
        ),
        VerbsError::UnsupportedShape(_) => false,
    }
}

/// Poll `channel` for a connect request, sleeping `backoff` between empty polls.
///
/// Transient channel errors are retried too; anything else, and any event other than a connect
/// request, ends the wait.
pub fn wait_connect_request(channel: &EventChannel, backoff: Duration) -> Result<CmEvent> {
    loop {
        match channel.try_get_cm_event() {
            Ok(Some(event)) if event.event() == CmEventType::ConnectRequest => {
                tracing::debug!("connect request, new cm_id: {}", event.id);
                return Ok(event);
            }
            Ok(Some(event)) => {
                return Err(Error::violation(CmEventType::ConnectRequest, event));
            }
            Ok(None) => {}
            Err(e) if is_transient(&e) => {
                tracing::debug!("get_request: {}, retrying", e);
            }
            Err(e) => return Err(cm_err(e)),
        }
        thread::sleep(backoff);
    }
}

/// Passive side: wait for the next connect request and take ownership of its id.
pub fn accept_request<'ec>(
    channel: &'ec EventChannel,
    config: &RdmaTransportConfig,
) -> Result<CmId<'ec>> {
    let event = wait_connect_request(channel, config.connect_request_backoff())?;
    CmId::from_request(channel, &event)
        .ok_or_else(|| Error::violation(CmEventType::ConnectRequest, &event))
}

/// The device context behind `id`, or the configured device when the id does not carry one.
pub fn resolve_context(id: &CmId<'_>, config: &RdmaTransportConfig) -> Result<Context> {
    match id.context() {
        ContextLookup::Found { ctx, device } => {
            tracing::debug!("cm_id {} is on device {}", id.handle(), device.name);
            Ok(Context::borrowed(id.verbs(), ctx, device))
        }
        ContextLookup::NoContext => {
            tracing::debug!(
                "cm_id {} has no context, opening {:?}",
                id.handle(),
                config.device_name
            );
            device::open_device_by_name(id.verbs(), config.device_name.as_deref())
        }
    }
}

/// Active side: connect and return the buffer the passive side advertised.
pub fn connect(id: &CmId<'_>, config: &RdmaTransportConfig) -> Result<RemoteBufInfo> {
    tracing::debug!("connect, cm_id: {:?}", id);
    id.connect(&config.conn_param(Vec::new())).map_err(cm_err)?;
    let event = expect_event(
        id.event_channel(),
        CmEventType::Established,
        config.connect_request_backoff(),
    )?;
    let remote = RemoteBufInfo::decode(event.private_data())?;
    tracing::debug!(
        "established, remote buffer {:#x}+{} rkey {:#x}",
        remote.addr,
        remote.len,
        remote.rkey
    );
    Ok(remote)
}

/// Passive side: accept the pending request, advertising `local`.
pub fn accept(id: &CmId<'_>, local: &RemoteBufInfo, config: &RdmaTransportConfig) -> Result<()> {
    tracing::debug!("accept, cm_id: {:?}", id);
    id.accept(&config.conn_param(local.encode().to_vec()))
        .map_err(cm_err)?;
    expect_event(
        id.event_channel(),
        CmEventType::Established,
        config.connect_request_backoff(),
    )?;
    Ok(())
}

/// Tear the connection down and wait for the local `DISCONNECTED`.
pub fn disconnect(id: &CmId<'_>, config: &RdmaTransportConfig) -> Result<()> {
    tracing::debug!("disconnect, cm_id: {:?}", id);
    id.disconnect().map_err(cm_err)?;
    expect_event(
        id.event_channel(),
        CmEventType::Disconnected,
        config.connect_request_backoff(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&VerbsError::Io(io::ErrorKind::WouldBlock.into())));
        assert!(is_transient(&VerbsError::Io(io::ErrorKind::TimedOut.into())));
        assert!(!is_transient(&VerbsError::Io(io::ErrorKind::InvalidInput.into())));
        assert!(!is_transient(&VerbsError::UnsupportedShape("()".to_owned())));
    }
}
