use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam::channel;
use crossbeam::thread;
use rand::{rngs::StdRng, RngCore, SeedableRng};

use rdma::ibv::{AccessFlags, Context, QpState, Verbs};
use rdma::soft::{SoftDeviceSpec, SoftFabric, SoftProfile};
use transport_rdma::cascade::{self, QpRequest};
use transport_rdma::device;
use transport_rdma::ops::Ops;
use transport_rdma::qp::{self, random_psn};
use transport_rdma::rendezvous::{self, Role};
use transport_rdma::{Error, PeerDescriptor, QpStateMachine, RdmaTransportConfig};

const BUF_SIZE: usize = 8192;
const SEED: u64 = 42;

struct Outcome {
    local: PeerDescriptor,
    remote: PeerDescriptor,
    final_state: QpState,
    buffer: Vec<u8>,
}

/// One side of a rendezvous session on `device`. The client writes a seeded payload into the
/// server's buffer; both sides then meet on `barrier` before tearing down.
fn run_side(
    fabric: &SoftFabric,
    device_name: &str,
    role: Role,
    mut stream: std::net::TcpStream,
    config: &RdmaTransportConfig,
    barrier: (channel::Sender<()>, channel::Receiver<()>),
) -> Outcome {
    let verbs: Arc<dyn Verbs> = Arc::new(fabric.clone());
    let ctx: Context = device::open_device_by_name(verbs, Some(device_name)).unwrap();
    let (lid, gid) = device::local_address(&ctx, config.port_num, config.gid_index).unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(config.cq_depth).unwrap();
    let mut buf = vec![0u8; BUF_SIZE];
    if role == Role::Client {
        StdRng::seed_from_u64(SEED).fill_bytes(&mut buf);
    }
    let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
        .unwrap()
        .value;
    let qp = cascade::build_qp(&pd, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
        .unwrap()
        .value;

    let psn = random_psn();
    let local = PeerDescriptor::new(qp.qp_num(), psn, lid, gid, mr.rkey());
    let mut sm = QpStateMachine::new(qp);
    let remote = rendezvous::establish(role, &mut stream, &mut sm, &local, config).unwrap();
    assert_eq!(sm.state(), QpState::Rts);

    if role == Role::Client {
        let mut ops = Ops::new(sm.qp());
        ops.write(&mr, 0..BUF_SIZE, remote.remote_key(), 0).unwrap();
    }
    barrier.0.send(()).unwrap();
    barrier.1.recv().unwrap();

    Outcome {
        local,
        remote,
        final_state: sm.state(),
        buffer: mr.to_vec(),
    }
}

fn run_pair(fabric: SoftFabric, devices: (&str, &str), config: RdmaTransportConfig) {
    let listener = rendezvous::listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (to_client, from_server) = channel::bounded(1);
    let (to_server, from_client) = channel::bounded(1);

    let (server, client) = thread::scope(|s| {
        let server = s.spawn(|_| {
            let (stream, _) = listener.accept().unwrap();
            run_side(&fabric, devices.0, Role::Server, stream, &config, (to_client, from_client))
        });
        let client = s.spawn(|_| {
            let stream = rendezvous::connect(&addr).unwrap();
            run_side(&fabric, devices.1, Role::Client, stream, &config, (to_server, from_server))
        });
        (server.join().unwrap(), client.join().unwrap())
    })
    .unwrap();

    assert_eq!(server.remote, client.local);
    assert_eq!(client.remote, server.local);
    assert_eq!(server.final_state, QpState::Rts);
    assert_eq!(server.buffer, client.buffer);
    assert_eq!(fabric.live_qps(), 0);
}

#[test]
fn rendezvous_over_roce() {
    let fabric = SoftFabric::new(
        vec![SoftDeviceSpec::roce("rxe0", 1), SoftDeviceSpec::roce("rxe1", 2)],
        SoftProfile::default(),
    );
    run_pair(fabric, ("rxe0", "rxe1"), RdmaTransportConfig::default());
}

#[test]
fn rendezvous_over_infiniband_lids() {
    let fabric = SoftFabric::new(
        vec![
            SoftDeviceSpec::infiniband("mlx5_0", 3),
            SoftDeviceSpec::infiniband("mlx5_1", 4),
        ],
        SoftProfile::default(),
    );
    run_pair(fabric, ("mlx5_0", "mlx5_1"), RdmaTransportConfig::default());
}

#[test]
fn rendezvous_with_restricted_binding() {
    let profile = SoftProfile {
        qp_shapes: vec![rdma::ibv::QpShape::Extended],
        supports_reg_mr: false,
        ..Default::default()
    };
    let fabric = SoftFabric::new(
        vec![SoftDeviceSpec::roce("rxe0", 1), SoftDeviceSpec::roce("rxe1", 2)],
        profile,
    );
    let mut config = RdmaTransportConfig::default();
    config.cascade.use_init_attr_ex = true;
    run_pair(fabric, ("rxe0", "rxe1"), config);
}

#[test]
fn rendezvous_peer_hangs_up_mid_message() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let listener = rendezvous::listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    thread::scope(|s| {
        s.spawn(|_| {
            use std::io::Write;
            let (mut stream, _) = listener.accept().unwrap();
            // A length prefix promising more than is ever sent.
            stream.write_all(&64u32.to_be_bytes()).unwrap();
            stream.write_all(b"{\"qpn\":").unwrap();
        });

        let verbs: Arc<dyn Verbs> = Arc::new(fabric.clone());
        let ctx = device::open_device_by_name(verbs, None).unwrap();
        let (lid, gid) = device::local_address(&ctx, 1, 0).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(config.cq_depth).unwrap();
        let mr = pd.alloc_mr(4096, AccessFlags::remote_rw()).unwrap();
        let qp = cascade::build_qp(&pd, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
            .unwrap()
            .value;
        let local = PeerDescriptor::new(qp.qp_num(), random_psn(), lid, gid, mr.rkey());
        let mut sm = QpStateMachine::new(qp);

        let mut stream = rendezvous::connect(&addr).unwrap();
        match rendezvous::establish(Role::Client, &mut stream, &mut sm, &local, &config) {
            Err(Error::TransportShortRead { expected, received }) => {
                assert_eq!(expected, 64);
                assert_eq!(received, 7);
            }
            other => panic!("unexpected: {:?}", other),
        }
        // INIT happened before the exchange; nothing after it did.
        assert_eq!(sm.state(), QpState::Init);
    })
    .unwrap();
}

#[test]
fn rendezvous_peer_without_address_is_rejected() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let listener = rendezvous::listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    thread::scope(|s| {
        s.spawn(|_| {
            let (mut stream, _) = listener.accept().unwrap();
            let bogus = PeerDescriptor {
                qpn: 0x99,
                psn: 1,
                lid: 0,
                gid: String::new(),
                rkey: 0,
                addr: 0,
            };
            rendezvous::send_msg(&mut stream, &bogus).unwrap();
            rendezvous::recv_msg(&mut stream).unwrap();
        });

        let verbs: Arc<dyn Verbs> = Arc::new(fabric.clone());
        let ctx = device::open_device_by_name(verbs, None).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(config.cq_depth).unwrap();
        let mr = pd.alloc_mr(4096, AccessFlags::remote_rw()).unwrap();
        let qp = cascade::build_qp(&pd, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
            .unwrap()
            .value;
        let local = PeerDescriptor::new(qp.qp_num(), qp::LocalPsn::new(7), 0, None, mr.rkey());
        let mut sm = QpStateMachine::new(qp);
        let mut stream = rendezvous::connect(&addr).unwrap();
        assert!(matches!(
            rendezvous::establish(Role::Client, &mut stream, &mut sm, &local, &config),
            Err(Error::ProtocolViolation { .. })
        ));
        assert_eq!(sm.state(), QpState::Init);
    })
    .unwrap();
}
