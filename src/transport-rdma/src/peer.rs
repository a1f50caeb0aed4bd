//! What each side tells the other: the rendezvous descriptor and the CM private-data blob.
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use rdma::ibv::Gid;
use rdma::mr::{MemoryRegion, RemoteKey};

use crate::qp::{AddressPath, LocalPsn, PeerPsn};
use crate::{Error, Result};

/// Everything a peer needs to bring its queue pair up against ours and address our buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub qpn: u32,
    pub psn: u32,
    /// 0 when the port has no link id.
    pub lid: u16,
    /// Empty when the port has no global id.
    pub gid: String,
    pub rkey: u32,
    pub addr: u64,
}

impl PeerDescriptor {
    pub fn new(qpn: u32, psn: LocalPsn, lid: u16, gid: Option<Gid>, key: RemoteKey) -> Self {
        PeerDescriptor {
            qpn,
            psn: psn.value(),
            lid,
            gid: gid.map(|g| g.to_string()).unwrap_or_default(),
            rkey: key.rkey,
            addr: key.addr,
        }
    }

    #[inline]
    pub fn peer_psn(&self) -> PeerPsn {
        PeerPsn::new(self.psn)
    }

    #[inline]
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey {
            rkey: self.rkey,
            addr: self.addr,
        }
    }

    /// Link-id addressing when the peer has one, otherwise global routing.
    pub fn address_path(&self, sgid_index: u8, hop_limit: u8) -> Result<AddressPath> {
        if self.lid != 0 {
            return Ok(AddressPath::Local { dlid: self.lid });
        }
        if self.gid.is_empty() {
            return Err(Error::violation("a peer lid or gid", "neither"));
        }
        let dgid: Gid = self
            .gid
            .parse()
            .map_err(|_| Error::violation("a gid", format!("{:?}", self.gid)))?;
        Ok(AddressPath::Global {
            dgid,
            sgid_index,
            hop_limit,
        })
    }
}

/// The remote buffer a CM peer advertises in its private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBufInfo {
    pub addr: u64,
    pub rkey: u32,
    pub len: u64,
}

const_assert_eq!(RemoteBufInfo::WIRE_SIZE, 8 + 4 + 8);

impl RemoteBufInfo {
    /// Encoded size: big-endian addr, rkey, len, no padding.
    pub const WIRE_SIZE: usize = 20;

    pub fn from_mr(mr: &MemoryRegion<'_>) -> Self {
        let key = mr.rkey();
        RemoteBufInfo {
            addr: key.addr,
            rkey: key.rkey,
            len: mr.len() as u64,
        }
    }

    #[inline]
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey {
            rkey: self.rkey,
            addr: self.addr,
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.addr.to_be_bytes());
        buf[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        buf[12..20].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Decode the leading 20 bytes. Providers may pad private data, so anything after them is
    /// ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            return Err(Error::violation(
                format!("{} bytes of private data", Self::WIRE_SIZE),
                format!("{} bytes", data.len()),
            ));
        }
        let mut addr = [0u8; 8];
        let mut rkey = [0u8; 4];
        let mut len = [0u8; 8];
        addr.copy_from_slice(&data[0..8]);
        rkey.copy_from_slice(&data[8..12]);
        len.copy_from_slice(&data[12..20]);
        Ok(RemoteBufInfo {
            addr: u64::from_be_bytes(addr),
            rkey: u32::from_be_bytes(rkey),
            len: u64::from_be_bytes(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_data_extremes() {
        for info in [
            RemoteBufInfo {
                addr: 0,
                rkey: 0,
                len: 0,
            },
            RemoteBufInfo {
                addr: u64::MAX,
                rkey: u32::MAX,
                len: u64::MAX,
            },
        ] {
            assert_eq!(RemoteBufInfo::decode(&info.encode()).unwrap(), info);
        }
    }

    #[test]
    fn test_private_data_layout() {
        let info = RemoteBufInfo {
            addr: 0x0102_0304_0506_0708,
            rkey: 0x0a0b_0c0d,
            len: 4096,
        };
        let wire = info.encode();
        assert_eq!(&wire[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[8..12], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&wire[12..], &[0, 0, 0, 0, 0, 0, 0x10, 0]);

        let mut padded = wire.to_vec();
        padded.extend_from_slice(&[0xff; 36]);
        assert_eq!(RemoteBufInfo::decode(&padded).unwrap(), info);
    }

    #[test]
    fn test_short_private_data() {
        match RemoteBufInfo::decode(&[0u8; 19]) {
            Err(Error::ProtocolViolation { observed, .. }) => assert_eq!(observed, "19 bytes"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(RemoteBufInfo::decode(&[]).is_err());
    }

    #[test]
    fn test_descriptor_json_keys() {
        let desc = PeerDescriptor::new(
            0x11,
            LocalPsn::new(42),
            0,
            None,
            RemoteKey {
                rkey: 7,
                addr: 0x1000,
            },
        );
        let value: serde_json::Value = serde_json::to_value(&desc).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["addr", "gid", "lid", "psn", "qpn", "rkey"]);
        assert_eq!(obj["gid"], "");
    }

    #[test]
    fn test_address_path_selection() {
        let mut desc = PeerDescriptor {
            qpn: 0x11,
            psn: 1,
            lid: 4,
            gid: "fe80:0000:0000:0000:0000:0000:0000:0001".to_owned(),
            rkey: 0,
            addr: 0,
        };
        assert_eq!(desc.address_path(0, 1).unwrap(), AddressPath::Local { dlid: 4 });
        desc.lid = 0;
        assert!(matches!(
            desc.address_path(2, 1).unwrap(),
            AddressPath::Global { sgid_index: 2, .. }
        ));
        desc.gid.clear();
        assert!(matches!(
            desc.address_path(0, 1),
            Err(Error::ProtocolViolation { .. })
        ));
    }
}
