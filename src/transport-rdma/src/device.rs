//! Device selection and local addressing.
use std::sync::Arc;

use rdma::ibv::{Context, Gid, Verbs};

use crate::{Error, Result};

/// Open the device called `name`, or the first one when no name is given.
pub fn open_device_by_name(verbs: Arc<dyn Verbs>, name: Option<&str>) -> Result<Context> {
    let devices = verbs.get_devices().map_err(|source| Error::Provisioning {
        resource: "device list",
        source,
    })?;
    let device = match name {
        Some(name) => devices.iter().find(|d| d.name == name),
        None => devices.first(),
    }
    .ok_or_else(|| Error::DeviceNotFound(name.unwrap_or("<any>").to_owned()))?;
    tracing::debug!("opening device {}", device.name);
    Context::open(verbs, device).map_err(|source| Error::Provisioning {
        resource: "device context",
        source,
    })
}

/// Link id and global id a peer needs to address this port. A zero gid is reported as absent.
pub fn local_address(ctx: &Context, port_num: u8, gid_index: u8) -> Result<(u16, Option<Gid>)> {
    let port = ctx.query_port(port_num).map_err(|source| Error::Provisioning {
        resource: "port attributes",
        source,
    })?;
    let gid = match ctx.query_gid(port_num, gid_index) {
        Ok(gid) if !gid.is_zero() => Some(gid),
        Ok(_) => None,
        Err(e) if port.lid != 0 => {
            tracing::warn!("query_gid({}, {}) failed: {}, using lid only", port_num, gid_index, e);
            None
        }
        Err(source) => {
            return Err(Error::Provisioning {
                resource: "gid",
                source,
            })
        }
    };
    Ok((port.lid, gid))
}
