//! Client/server sessions driven over the in-process fabric.
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use crossbeam::channel;
use rand::RngCore;

use rdma::ibv::{AccessFlags, Verbs};
use rdma::mr::{AlignedBuffer, MemoryRegion};
use rdma::rdmacm::{CmEventType, EventChannel};
use rdma::soft::{SoftDeviceSpec, SoftFabric, SoftProfile};
use transport_rdma::cascade::{self, QpRequest};
use transport_rdma::ops::Ops;
use transport_rdma::qp::random_psn;
use transport_rdma::rendezvous::{self, Role};
use transport_rdma::{cm, device};
use transport_rdma::{PeerDescriptor, QpStateMachine, RdmaTransportConfig, RemoteBufInfo};

use crate::config::{BenchConfig, FabricConfig, Scenario};

const GREETING: &[u8] = b"hello from rcbench";

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub sessions: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

impl Report {
    pub fn gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs / 1e9
    }
}

pub fn fabric(config: &FabricConfig) -> SoftFabric {
    let profile = SoftProfile {
        qp_via_side_channel: config.qp_via_side_channel,
        supports_reg_mr: config.supports_reg_mr,
        cm_exposes_context: config.cm_exposes_context,
        ..Default::default()
    };
    SoftFabric::new(
        vec![SoftDeviceSpec::roce("rxe0", 1), SoftDeviceSpec::roce("rxe1", 2)],
        profile,
    )
}

pub fn run(bench: &BenchConfig, transport: &RdmaTransportConfig) -> Result<Report> {
    let fabric = fabric(&bench.fabric);
    let mut report = Report::default();
    let start = Instant::now();
    for i in 0..bench.iterations {
        tracing::debug!("session {} of {:?}", i, bench.scenario);
        report.bytes += match bench.scenario {
            Scenario::Cm => cm_session(&fabric, transport, transport.buf_size, Client::WriteRead)?,
            Scenario::Bulk => cm_session(
                &fabric,
                transport,
                bench.bulk_bytes,
                Client::Bulk(bench.chunk_size),
            )?,
            Scenario::Rendezvous => rendezvous_session(&fabric, transport)?,
        };
        report.sessions += 1;
    }
    report.elapsed = start.elapsed();
    if fabric.live_qps() != 0 || fabric.live_mrs() != 0 {
        bail!(
            "{} queue pairs and {} memory regions outlived their sessions",
            fabric.live_qps(),
            fabric.live_mrs()
        );
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy)]
enum Client {
    WriteRead,
    Bulk(usize),
}

fn join<T>(scope: std::thread::Result<Result<T>>) -> Result<T> {
    scope.map_err(|_| anyhow!("session thread panicked"))?
}

/// One CM session; returns the number of bytes the client moved.
fn cm_session(
    fabric: &SoftFabric,
    config: &RdmaTransportConfig,
    buf_size: usize,
    client: Client,
) -> Result<usize> {
    let (addr_tx, addr_rx) = channel::bounded(1);
    let (server, moved) = crossbeam::thread::scope(|s| {
        let server = s.spawn(|_| cm_server(fabric, config, buf_size, addr_tx));
        let moved = match addr_rx.recv() {
            Ok(addr) => cm_client(fabric, config, buf_size, addr, client),
            Err(_) => Err(anyhow!("server exited before listening")),
        };
        (join(server.join()), moved)
    })
    .map_err(|_| anyhow!("session thread panicked"))?;
    server?;
    moved
}

fn cm_server(
    fabric: &SoftFabric,
    config: &RdmaTransportConfig,
    buf_size: usize,
    addr_tx: channel::Sender<SocketAddr>,
) -> Result<()> {
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone()))?;
    let listener = cm::listen(&channel, &"127.0.0.1:0".parse()?, config)?;
    addr_tx.send(listener.local_addr().ok_or_else(|| anyhow!("listener has no local address"))?)?;

    let id = cm::accept_request(&channel, config)?;
    let ctx = cm::resolve_context(&id, config)?;
    let pd = ctx.alloc_pd()?;
    let cq = ctx.create_cq(config.cq_depth)?;
    let mut buf = vec![0u8; buf_size];
    let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())?.value;
    let built = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)?;
    tracing::info!("server QP {} built via {}", built.value.qp_num(), built.strategy);
    cm::accept(&id, &RemoteBufInfo::from_mr(&mr), config)?;

    cm::expect_event(
        &channel,
        CmEventType::Disconnected,
        config.connect_request_backoff(),
    )?;
    tracing::debug!("server saw disconnect");
    Ok(())
}

fn cm_client(
    fabric: &SoftFabric,
    config: &RdmaTransportConfig,
    buf_size: usize,
    dst: SocketAddr,
    client: Client,
) -> Result<usize> {
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone()))?;
    let id = cm::resolve(&channel, &dst, config)?;
    let ctx = cm::resolve_context(&id, config)?;
    let pd = ctx.alloc_pd()?;
    let cq = ctx.create_cq(config.cq_depth)?;
    let mut buf = AlignedBuffer::new(buf_size)?;
    rand::thread_rng().fill_bytes(&mut buf);
    let mut mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())?.value;
    let built = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)?;
    let remote = cm::connect(&id, config)?;
    tracing::info!(
        "client QP {} connected, peer buffer {} bytes",
        built.value.qp_num(),
        remote.len
    );

    let mut ops = Ops::new(&built.value);
    let moved = match client {
        Client::WriteRead => {
            let len = GREETING.len().min(mr.len());
            mr[..len].copy_from_slice(&GREETING[..len]);
            ops.write(&mr, 0..len, remote.remote_key(), 0)?;
            mr.fill(0);
            let span = mr.len().min(remote.len as usize);
            ops.read(&mut mr, 0..span, remote.remote_key(), 0)?;
            if mr[..len] != GREETING[..len] {
                bail!("read back {:?}", String::from_utf8_lossy(&mr[..len]));
            }
            len + span
        }
        Client::Bulk(chunk) => {
            let report = ops.bulk_write(&mr, mr.len(), &remote, chunk)?;
            tracing::info!(
                "bulk wrote {} bytes in {} chunks, {:.3} Gb/s",
                report.bytes,
                report.chunks,
                report.gbps()
            );
            report.bytes
        }
    };
    cm::disconnect(&id, config)?;
    Ok(moved)
}

/// One rendezvous session between rxe0 (server) and rxe1 (client).
fn rendezvous_session(fabric: &SoftFabric, config: &RdmaTransportConfig) -> Result<usize> {
    let listener = rendezvous::listen(&"127.0.0.1:0".parse()?)?;
    let addr = listener.local_addr()?;
    let (done_tx, done_rx) = channel::bounded::<()>(1);

    let (server, client) = crossbeam::thread::scope(|s| {
        let server = s.spawn(|_| -> Result<usize> {
            let (stream, _) = listener.accept()?;
            rendezvous_side(fabric, "rxe0", Role::Server, stream, config, |_, _, _| {
                done_rx.recv()?;
                Ok(0)
            })
        });
        let client = s.spawn(|_| -> Result<usize> {
            let stream = rendezvous::connect(&addr)?;
            let moved = rendezvous_side(fabric, "rxe1", Role::Client, stream, config, |ops, mr, remote| {
                let len = mr.len();
                ops.write(mr, 0..len, remote.remote_key(), 0)?;
                Ok(len)
            });
            // Release the server even when the write failed.
            let _ = done_tx.send(());
            moved
        });
        (join(server.join()), join(client.join()))
    })
    .map_err(|_| anyhow!("session thread panicked"))?;
    server?;
    client
}

fn rendezvous_side<F>(
    fabric: &SoftFabric,
    device_name: &str,
    role: Role,
    mut stream: TcpStream,
    config: &RdmaTransportConfig,
    work: F,
) -> Result<usize>
where
    F: FnOnce(&mut Ops<'_, '_>, &MemoryRegion<'_>, &PeerDescriptor) -> Result<usize>,
{
    let verbs: Arc<dyn Verbs> = Arc::new(fabric.clone());
    let ctx = device::open_device_by_name(verbs, Some(device_name))?;
    let (lid, gid) = device::local_address(&ctx, config.port_num, config.gid_index)?;
    let pd = ctx.alloc_pd()?;
    let cq = ctx.create_cq(config.cq_depth)?;
    let mut buf = vec![0u8; config.buf_size];
    rand::thread_rng().fill_bytes(&mut buf);
    let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())?.value;
    let qp = cascade::build_qp(&pd, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)?.value;

    let local = PeerDescriptor::new(qp.qp_num(), random_psn(), lid, gid, mr.rkey());
    let mut sm = QpStateMachine::new(qp);
    let remote = rendezvous::establish(role, &mut stream, &mut sm, &local, config)?;
    tracing::info!("{:?} connected QP {} to peer QP {}", role, local.qpn, remote.qpn);

    let mut ops = Ops::new(sm.qp());
    work(&mut ops, &mr, &remote)
}
