use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam::channel;
use crossbeam::thread;
use rand::{rngs::StdRng, RngCore, SeedableRng};

use rdma::ibv::{AccessFlags, QpState};
use rdma::rdmacm::{CmEvent, CmEventType, CmId, EventChannel, PortSpace};
use rdma::soft::{SoftFabric, SoftProfile};
use transport_rdma::cascade::{self, QpRequest};
use transport_rdma::cm;
use transport_rdma::ops::{self, Ops};
use transport_rdma::{Error, QpStateMachine, RdmaTransportConfig, RemoteBufInfo};

const BUF_SIZE: usize = 4096;
const PAYLOAD: &[u8; 18] = b"client-wrote-this\0";
const SEED: u64 = 0x5eed;

fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Passive side: advertise a buffer starting with "server-initial", wait for the client to hang
/// up, and return (initial content, final content).
fn serve(
    fabric: &SoftFabric,
    config: &RdmaTransportConfig,
    addr_tx: channel::Sender<SocketAddr>,
) -> (Vec<u8>, Vec<u8>) {
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
    let listener = cm::listen(&channel, &any_local(), config).unwrap();
    addr_tx.send(listener.local_addr().unwrap()).unwrap();

    let id = cm::accept_request(&channel, config).unwrap();
    let ctx = cm::resolve_context(&id, config).unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(config.cq_depth).unwrap();

    let mut buf = vec![0u8; BUF_SIZE];
    StdRng::seed_from_u64(SEED).fill_bytes(&mut buf);
    buf[..14].copy_from_slice(b"server-initial");
    let initial = buf.clone();

    let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
        .unwrap()
        .value;
    let qp = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
        .unwrap()
        .value;
    cm::accept(&id, &RemoteBufInfo::from_mr(&mr), config).unwrap();
    assert_eq!(qp.query_state().unwrap(), QpState::Rts);

    cm::expect_event(
        &channel,
        CmEventType::Disconnected,
        config.connect_request_backoff(),
    ).unwrap();
    (initial, mr.to_vec())
}

/// Active side: write the payload at offset 0, then read the whole remote buffer back.
fn write_then_read(
    fabric: &SoftFabric,
    config: &RdmaTransportConfig,
    addr_rx: channel::Receiver<SocketAddr>,
) -> Vec<u8> {
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
    let dst = addr_rx.recv().unwrap();
    let id = cm::resolve(&channel, &dst, config).unwrap();
    let ctx = cm::resolve_context(&id, config).unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(config.cq_depth).unwrap();

    let mut buf = vec![0u8; BUF_SIZE];
    let mut mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
        .unwrap()
        .value;
    let qp = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
        .unwrap()
        .value;
    let remote = cm::connect(&id, config).unwrap();
    assert_eq!(remote.len, BUF_SIZE as u64);

    let mut ops = Ops::new(&qp);
    mr[..PAYLOAD.len()].copy_from_slice(PAYLOAD);
    let wc = ops
        .write(&mr, 0..PAYLOAD.len(), remote.remote_key(), 0)
        .unwrap();
    assert_eq!(wc.byte_len, PAYLOAD.len() as u32);

    mr.fill(0);
    ops.read(&mut mr, 0..BUF_SIZE, remote.remote_key(), 0)
        .unwrap();
    let read_back = mr.to_vec();

    cm::disconnect(&id, config).unwrap();
    read_back
}

fn run_pair(fabric: SoftFabric, config: RdmaTransportConfig) {
    let (addr_tx, addr_rx) = channel::bounded(1);
    let ((initial, server_final), read_back) = thread::scope(|s| {
        let server = s.spawn(|_| serve(&fabric, &config, addr_tx));
        let client = s.spawn(|_| write_then_read(&fabric, &config, addr_rx));
        (server.join().unwrap(), client.join().unwrap())
    })
    .unwrap();

    assert_eq!(&read_back[..PAYLOAD.len()], PAYLOAD);
    assert_eq!(&read_back[PAYLOAD.len()..], &initial[PAYLOAD.len()..]);
    assert_eq!(server_final, read_back);
    assert_eq!(fabric.live_qps(), 0);
    assert_eq!(fabric.live_mrs(), 0);
}

#[test]
fn cm_write_then_read_back() {
    run_pair(SoftFabric::default(), RdmaTransportConfig::default());
}

#[test]
fn cm_side_channel_qp_and_alloc_only_mr() {
    let profile = SoftProfile {
        qp_via_side_channel: true,
        supports_reg_mr: false,
        ..Default::default()
    };
    run_pair(SoftFabric::with_profile(profile), RdmaTransportConfig::default());
}

#[test]
fn cm_without_context_uses_named_device() {
    let profile = SoftProfile {
        cm_exposes_context: false,
        ..Default::default()
    };
    let config = RdmaTransportConfig {
        device_name: Some("rxe0".to_owned()),
        resolve_route: false,
        ..Default::default()
    };
    run_pair(SoftFabric::with_profile(profile), config);
}

#[test]
fn cm_missing_device_is_reported() {
    let profile = SoftProfile {
        cm_exposes_context: false,
        ..Default::default()
    };
    let fabric = SoftFabric::with_profile(profile);
    let config = RdmaTransportConfig {
        device_name: Some("mlx5_9".to_owned()),
        ..Default::default()
    };
    let channel = EventChannel::create_event_channel(Arc::new(fabric)).unwrap();
    let id = cm::resolve(&channel, &"127.0.0.1:7471".parse().unwrap(), &config).unwrap();
    match cm::resolve_context(&id, &config) {
        Err(Error::DeviceNotFound(name)) => assert_eq!(name, "mlx5_9"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn cm_immediate_notification() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let (addr_tx, addr_rx) = channel::bounded(1);
    let (notify_len, written) = thread::scope(|s| {
        let server = s.spawn(|_| {
            let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
            let listener = cm::listen(&channel, &any_local(), &config).unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let id = cm::accept_request(&channel, &config).unwrap();
            let ctx = cm::resolve_context(&id, &config).unwrap();
            let pd = ctx.alloc_pd().unwrap();
            let cq = ctx.create_cq(config.cq_depth).unwrap();
            let mut buf = vec![0u8; BUF_SIZE];
            let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
                .unwrap()
                .value;
            let qp = cascade::build_qp(
                &id,
                &QpRequest::new(&pd, &cq, config.qp_cap()),
                &config.cascade,
            )
            .unwrap()
            .value;
            let ops = Ops::new(&qp);
            // The receive must be in place before the peer can write with immediate data.
            unsafe { ops.post_recv(&mr, 0..0, 99).unwrap() };
            cm::accept(&id, &RemoteBufInfo::from_mr(&mr), &config).unwrap();
            let wc = ops.wait_recv().unwrap();
            assert_eq!(wc.wr_id, 99);
            let len = ops::imm_data(&wc).unwrap();
            cm::expect_event(
                &channel,
                CmEventType::Disconnected,
                config.connect_request_backoff(),
            ).unwrap();
            (len, mr[..len as usize].to_vec())
        });
        let client = s.spawn(|_| {
            let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
            let id = cm::resolve(&channel, &addr_rx.recv().unwrap(), &config).unwrap();
            let ctx = cm::resolve_context(&id, &config).unwrap();
            let pd = ctx.alloc_pd().unwrap();
            let cq = ctx.create_cq(config.cq_depth).unwrap();
            let mut buf = vec![0u8; BUF_SIZE];
            StdRng::seed_from_u64(SEED).fill_bytes(&mut buf);
            let expected = buf[..1000].to_vec();
            let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
                .unwrap()
                .value;
            let qp = cascade::build_qp(
                &id,
                &QpRequest::new(&pd, &cq, config.qp_cap()),
                &config.cascade,
            )
            .unwrap()
            .value;
            let remote = cm::connect(&id, &config).unwrap();
            Ops::new(&qp)
                .write_with_imm(&mr, 0..1000, remote.remote_key(), 0)
                .unwrap();
            cm::disconnect(&id, &config).unwrap();
            expected
        });
        let server = server.join().unwrap();
        let expected = client.join().unwrap();
        assert_eq!(server.1, expected);
        server
    })
    .unwrap();
    assert_eq!(notify_len, 1000);
    assert_eq!(written.len(), 1000);
}

#[test]
fn cm_unexpected_event_after_connect() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
    let id = cm::resolve(&channel, &"127.0.0.1:7471".parse().unwrap(), &config).unwrap();
    let ctx = cm::resolve_context(&id, &config).unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(config.cq_depth).unwrap();
    let _qp = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
        .unwrap()
        .value;

    // Nobody listens on the port, so the fabric answers with a reject.
    match cm::connect(&id, &config) {
        Err(Error::ProtocolViolation { expected, observed }) => {
            assert_eq!(expected, "RDMA_CM_EVENT_ESTABLISHED");
            assert!(observed.starts_with("RDMA_CM_EVENT_REJECTED"), "{}", observed);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn event_wait_sleeps_between_polls() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig {
        connect_request_backoff_ms: 20,
        ..Default::default()
    };
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
    let listener = cm::listen(&channel, &any_local(), &config).unwrap();
    let (injector, channel_handle, listener_handle) =
        (fabric.clone(), channel.handle(), listener.handle());
    let event = thread::scope(|s| {
        s.spawn(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            injector.inject_cm_event(
                channel_handle,
                CmEvent {
                    event: CmEventType::Disconnected,
                    status: 0,
                    id: listener_handle,
                    listen_id: None,
                    private_data: Vec::new(),
                },
            );
        });
        cm::expect_event(
            &channel,
            CmEventType::Disconnected,
            config.connect_request_backoff(),
        )
        .unwrap()
    })
    .unwrap();
    assert_eq!(event.id, listener.handle());
    // About 200 / 20 empty polls; a busy loop would make many thousands.
    let polls = fabric.cm_event_polls();
    assert!(polls >= 2 && polls < 50, "{} polls", polls);
}

#[test]
fn cm_injected_event_is_a_violation() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
    let listener = cm::listen(&channel, &any_local(), &config).unwrap();
    fabric.inject_cm_event(
        channel.handle(),
        CmEvent {
            event: CmEventType::DeviceRemoval,
            status: 0,
            id: listener.handle(),
            listen_id: None,
            private_data: Vec::new(),
        },
    );
    match cm::accept_request(&channel, &config) {
        Err(Error::ProtocolViolation { expected, observed }) => {
            assert_eq!(expected, "RDMA_CM_EVENT_CONNECT_REQUEST");
            assert_eq!(observed, "RDMA_CM_EVENT_DEVICE_REMOVAL");
        }
        other => panic!("unexpected: {:?}", other),
    };
}

#[test]
fn cm_short_private_data_is_a_violation() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let (addr_tx, addr_rx) = channel::bounded(1);
    thread::scope(|s| {
        s.spawn(|_| {
            let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
            let listener = cm::listen(&channel, &any_local(), &config).unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let id = cm::accept_request(&channel, &config).unwrap();
            let ctx = cm::resolve_context(&id, &config).unwrap();
            let pd = ctx.alloc_pd().unwrap();
            let cq = ctx.create_cq(config.cq_depth).unwrap();
            let _qp = cascade::build_qp(
                &id,
                &QpRequest::new(&pd, &cq, config.qp_cap()),
                &config.cascade,
            )
            .unwrap()
            .value;
            // A peer speaking a different private-data layout.
            id.accept(&config.conn_param(vec![0u8; 12])).unwrap();
            cm::expect_event(
                &channel,
                CmEventType::Established,
                config.connect_request_backoff(),
            ).unwrap();
        });
        let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
        let id = cm::resolve(&channel, &addr_rx.recv().unwrap(), &config).unwrap();
        let ctx = cm::resolve_context(&id, &config).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(config.cq_depth).unwrap();
        let _qp = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
            .unwrap()
            .value;
        match cm::connect(&id, &config) {
            Err(Error::ProtocolViolation { observed, .. }) => assert_eq!(observed, "12 bytes"),
            other => panic!("unexpected: {:?}", other),
        }
    })
    .unwrap();
}

#[test]
fn cm_adopted_qp_reports_rts_and_cancels() {
    let fabric = SoftFabric::default();
    let config = RdmaTransportConfig::default();
    let (addr_tx, addr_rx) = channel::bounded(1);
    let (done_tx, done_rx) = channel::bounded::<()>(1);
    thread::scope(|s| {
        s.spawn(|_| {
            let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
            let listener = cm::listen(&channel, &any_local(), &config).unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let id = cm::accept_request(&channel, &config).unwrap();
            let ctx = cm::resolve_context(&id, &config).unwrap();
            let pd = ctx.alloc_pd().unwrap();
            let cq = ctx.create_cq(config.cq_depth).unwrap();
            let mut buf = vec![0u8; BUF_SIZE];
            let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
                .unwrap()
                .value;
            let _qp = cascade::build_qp(
                &id,
                &QpRequest::new(&pd, &cq, config.qp_cap()),
                &config.cascade,
            )
            .unwrap()
            .value;
            cm::accept(&id, &RemoteBufInfo::from_mr(&mr), &config).unwrap();
            done_rx.recv().unwrap();
        });

        let channel = EventChannel::create_event_channel(Arc::new(fabric.clone())).unwrap();
        let id = cm::resolve(&channel, &addr_rx.recv().unwrap(), &config).unwrap();
        let ctx = cm::resolve_context(&id, &config).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(config.cq_depth).unwrap();
        let mut buf = vec![7u8; BUF_SIZE];
        let mr = cascade::register_mr(&pd, &mut buf, AccessFlags::remote_rw())
            .unwrap()
            .value;
        let qp = cascade::build_qp(&id, &QpRequest::new(&pd, &cq, config.qp_cap()), &config.cascade)
            .unwrap()
            .value;
        let remote = cm::connect(&id, &config).unwrap();

        let mut sm = QpStateMachine::adopt(qp).unwrap();
        assert_eq!(sm.state(), QpState::Rts);
        sm.to_error().unwrap();
        assert_eq!(sm.state(), QpState::Error);

        // A cancelled queue pair accepts no more work.
        let mut ops = Ops::new(sm.qp());
        assert!(matches!(
            ops.write(&mr, 0..16, remote.remote_key(), 0),
            Err(Error::Provisioning { .. })
        ));
        assert!(!ops.is_busy());
        drop(ops);
        drop(sm);
        done_tx.send(()).unwrap();
    })
    .unwrap();
}

#[test]
fn cm_create_id_rejects_datagram_port_space() {
    let fabric = SoftFabric::default();
    let channel = EventChannel::create_event_channel(Arc::new(fabric)).unwrap();
    assert!(CmId::create_id(&channel, PortSpace::Udp).is_err());
}
