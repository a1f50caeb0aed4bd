//! Out-of-band queue-pair bring-up over a TCP stream.
//!
//! Each side sends one [`PeerDescriptor`] framed as a big-endian `u32` length followed by that
//! many bytes of JSON. The server speaks first; the client answers.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::RdmaTransportConfig;
use crate::peer::PeerDescriptor;
use crate::qp::{InitParams, LocalPsn, QpStateMachine, RtrParams, RtsParams};
use crate::{Error, Result};

/// Upper bound on an encoded descriptor. A real one is around 150 bytes.
pub const MAX_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub fn listen(addr: &SocketAddr) -> Result<TcpListener> {
    let listener = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    listener.bind(&(*addr).into())?;
    listener.listen(1)?;
    tracing::debug!("rendezvous listening on {:?}", listener.local_addr()?.as_socket());
    Ok(listener.into())
}

pub fn connect(addr: &SocketAddr) -> Result<TcpStream> {
    let sock = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.connect(&(*addr).into())?;
    sock.set_nodelay(true)?;
    Ok(sock.into())
}

pub fn send_msg<W: Write>(w: &mut W, desc: &PeerDescriptor) -> Result<()> {
    let body = serde_json::to_vec(desc)?;
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

pub fn recv_msg<R: Read>(r: &mut R) -> Result<PeerDescriptor> {
    let mut len = [0u8; 4];
    read_full(r, &mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::violation(
            format!("a message of at most {} bytes", MAX_MESSAGE_SIZE),
            format!("{} bytes", len),
        ));
    }
    let mut body = vec![0u8; len];
    read_full(r, &mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Fill `buf` completely; end of stream before that is a short read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut received = 0;
    while received < buf.len() {
        match r.read(&mut buf[received..]) {
            Ok(0) => {
                return Err(Error::TransportShortRead {
                    expected: buf.len(),
                    received,
                })
            }
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn exchange_as_server<S: Read + Write>(
    stream: &mut S,
    local: &PeerDescriptor,
) -> Result<PeerDescriptor> {
    send_msg(stream, local)?;
    recv_msg(stream)
}

pub fn exchange_as_client<S: Read + Write>(
    stream: &mut S,
    local: &PeerDescriptor,
) -> Result<PeerDescriptor> {
    let remote = recv_msg(stream)?;
    send_msg(stream, local)?;
    Ok(remote)
}

/// Move `sm` to INIT, swap descriptors, then bring it to RTS against the peer. Returns what the
/// peer advertised.
pub fn establish<S: Read + Write>(
    role: Role,
    stream: &mut S,
    sm: &mut QpStateMachine<'_>,
    local: &PeerDescriptor,
    config: &RdmaTransportConfig,
) -> Result<PeerDescriptor> {
    sm.to_init(&InitParams::from_config(config))?;

    let remote = match role {
        Role::Server => exchange_as_server(stream, local)?,
        Role::Client => exchange_as_client(stream, local)?,
    };
    tracing::debug!(
        "rendezvous: local qp {:#x}, peer qp {:#x} lid {} gid {:?}",
        local.qpn,
        remote.qpn,
        remote.lid,
        remote.gid
    );

    let path = remote.address_path(config.gid_index, config.rtr.hop_limit)?;
    sm.to_rtr(&RtrParams::new(remote.qpn, remote.peer_psn(), path).with_config(config))?;
    sm.to_rts(&RtsParams::new(LocalPsn::new(local.psn)).with_config(config))?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn descriptor(qpn: u32) -> PeerDescriptor {
        PeerDescriptor {
            qpn,
            psn: 0x123456,
            lid: 0,
            gid: "fe80:0000:0000:0000:0200:5eff:fe00:0001".to_owned(),
            rkey: 0x0101,
            addr: 0x7f00_0000_1000,
        }
    }

    #[test]
    fn test_framing() {
        let mut wire = Vec::new();
        send_msg(&mut wire, &descriptor(0x11)).unwrap();
        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(len, wire.len() - 4);
        let body: serde_json::Value = serde_json::from_slice(&wire[4..]).unwrap();
        assert_eq!(body["qpn"], 0x11);
        assert_eq!(recv_msg(&mut Cursor::new(wire)).unwrap(), descriptor(0x11));
    }

    #[test]
    fn test_short_read() {
        let mut wire = Vec::new();
        send_msg(&mut wire, &descriptor(0x11)).unwrap();
        let total = wire.len();
        wire.truncate(total - 5);
        match recv_msg(&mut Cursor::new(wire)) {
            Err(Error::TransportShortRead { expected, received }) => {
                assert_eq!(expected, total - 4);
                assert_eq!(received, total - 9);
            }
            other => panic!("unexpected: {:?}", other),
        }

        match recv_msg(&mut Cursor::new(vec![0u8, 0])) {
            Err(Error::TransportShortRead { expected, received }) => {
                assert_eq!((expected, received), (4, 2));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let wire = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes().to_vec();
        assert!(matches!(
            recv_msg(&mut Cursor::new(wire)),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_garbage_body() {
        let mut wire = 3u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"{x}");
        assert!(matches!(recv_msg(&mut Cursor::new(wire)), Err(Error::Codec(_))));
    }
}
