use conntrace::agent::sock::{Flow4, Flow6, Sock, SockAddr, SockId, Socket, MSG_PEEK};
use conntrace::agent::sock::{AF_INET, AF_INET6, SOCK_DGRAM};
use conntrace::agent::{MissCounter, PacketCountMode, Table};
use conntrace::common::{direction, family, protocol, ConnTuple, PortBinding, TcpStats};
use conntrace::{Backend, ConnAggregator, Observation, Tracer, TracerConfig};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
use std::sync::Mutex;

const PID_TGID: u64 = (100 << 32) | 100;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Backend that keeps every observation and miss in arrival order
#[derive(Default)]
struct Recorder {
    observations: Mutex<Vec<Observation>>,
    misses: Mutex<Vec<MissCounter>>,
}

impl Recorder {
    fn observations(&self) -> Vec<Observation> {
        self.observations.lock().unwrap().clone()
    }

    fn misses(&self) -> Vec<MissCounter> {
        self.misses.lock().unwrap().clone()
    }
}

impl Backend for Recorder {
    fn forward_observation(&self, observation: &Observation) {
        self.observations.lock().unwrap().push(*observation);
    }

    fn update_tcp_stats(&self, _tuple: &ConnTuple, _stats: TcpStats) {}

    fn notify_tcp_stats(&self, _tuple: &ConnTuple, _sk: &Sock, _state_hint: u8) {}

    fn finalize_close(&self, _tuple: &ConnTuple, _sock: SockId) {}

    fn flush_if_full(&self) {}

    fn increment_miss_counter(&self, counter: MissCounter) {
        self.misses.lock().unwrap().push(counter);
    }
}

fn recording_tracer() -> Tracer<Recorder> {
    init_logging();
    Tracer::new(Recorder::default(), &TracerConfig::default())
}

fn client_sock() -> Sock {
    Sock::v4(
        SockId(0xffff_8880_0000_1000),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5000),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
    )
}

#[test]
fn test_tcp_client_connect_then_send() {
    let tracer = recording_tracer();
    let sk = client_sock();

    tracer.tcp_connect(PID_TGID, &sk);
    tracer.tcp_finish_connect(&sk);

    let obs = tracer.backend().observations();
    assert_eq!(obs.len(), 1);
    let t = obs[0].tuple;
    assert_eq!(t.pid, 100);
    assert_eq!(t.saddr(), u32::from(Ipv4Addr::new(10, 0, 0, 1)) as u128);
    assert_eq!(t.daddr(), u32::from(Ipv4Addr::new(10, 0, 0, 2)) as u128);
    assert_eq!((t.sport, t.dport), (5000, 80));
    assert_eq!(t.protocol, protocol::TCP);
    assert_eq!(t.family, family::V4);
    assert_eq!(obs[0].direction, direction::OUTGOING);
    assert_eq!(obs[0].sent_bytes + obs[0].recv_bytes, 0);
    assert_eq!(obs[0].mode, PacketCountMode::None);

    tracer.tcp_sendmsg_exit(PID_TGID, &sk, 200);

    let obs = tracer.backend().observations();
    assert_eq!(obs.len(), 2);
    assert_eq!(obs[1].tuple, t);
    assert_eq!(obs[1].sent_bytes, 200);
    assert_eq!(obs[1].direction, direction::UNKNOWN);
    assert_eq!(obs[1].mode, PacketCountMode::Absolute);
}

#[test]
fn test_unmatched_udp_send_entry_stays_staged() {
    let tracer = recording_tracer();
    let fl4 = Flow4 {
        saddr: Ipv4Addr::new(10, 0, 0, 1),
        daddr: Ipv4Addr::new(10, 0, 0, 53),
        sport: 40000,
        dport: 53,
    };

    tracer.udp_send_skb(PID_TGID, None, &fl4);

    assert!(tracer.pending_udp_sends().contains(&PID_TGID));
    assert!(tracer.backend().observations().is_empty());
    assert!(tracer.backend().misses().is_empty());
}

#[test]
fn test_udp_bind_port_zero() {
    let tracer = recording_tracer();
    let any = SockAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

    let mut bound = Sock::new(SockId(1), AF_INET);
    bound.num = 33000;
    let socket = Socket {
        sock_type: SOCK_DGRAM,
        ops_family: Some(AF_INET),
        sk: Some(bound),
    };
    tracer.inet_bind_exit(&socket, Some(&any), 0);
    assert!(tracer.udp_ports().contains(&PortBinding::new(0, 33000)));

    let unbound = Socket {
        sk: Some(Sock::new(SockId(2), AF_INET)),
        ..socket
    };
    tracer.inet_bind_exit(&unbound, Some(&any), 0);

    assert_eq!(tracer.udp_ports().len(), 1);
    assert_eq!(tracer.backend().misses(), vec![MissCounter::UnknownPort]);
}

#[test]
fn test_listen_stop_removes_binding() {
    let tracer = recording_tracer();
    let accepted = Sock::v4(
        SockId(1),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 8080),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 51000),
    )
    .with_netns(7);
    tracer.inet_csk_accept_exit(PID_TGID, Some(&accepted));
    assert!(tracer.tcp_ports().contains(&PortBinding::new(7, 8080)));

    let mut listener = Sock::new(SockId(2), AF_INET).with_netns(7);
    listener.num = 8080;

    tracer.inet_csk_listen_stop(&listener);
    assert!(!tracer.tcp_ports().contains(&PortBinding::new(7, 8080)));

    tracer.inet_csk_listen_stop(&listener);
    assert!(tracer.tcp_ports().is_empty());
    assert!(tracer.backend().misses().is_empty());
}

#[test]
fn test_peek_receive_forwards_nothing() {
    let tracer = recording_tracer();
    let sk = Sock::v4(
        SockId(1),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 53),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
    );

    tracer.udp_recvmsg_exit(PID_TGID, &sk, None, 512, MSG_PEEK);
    assert!(tracer.backend().observations().is_empty());

    tracer.udp_recvmsg_exit(PID_TGID, &sk, None, 512, 0);
    assert_eq!(tracer.backend().observations().len(), 1);
}

#[test]
fn test_ipv4_mapped_flow_collapses_to_v4() {
    let tracer = recording_tracer();
    let fl6 = Flow6 {
        saddr: Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped(),
        daddr: Ipv4Addr::new(10, 0, 0, 2).to_ipv6_mapped(),
        sport: 40000,
        dport: 53,
    };

    tracer.udp_v6_send_skb(PID_TGID, None, &fl6);
    tracer.udp_sendmsg_exit(PID_TGID, &Sock::new(SockId(1), AF_INET6), 32);

    let obs = tracer.backend().observations();
    assert_eq!(obs.len(), 1);
    let t = obs[0].tuple;
    assert_eq!(t.family, family::V4);
    assert_eq!(t.saddr_h, 0);
    assert_eq!(t.daddr_h, 0);
    assert_eq!(Ipv4Addr::from(t.saddr_l as u32), Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(Ipv4Addr::from(t.daddr_l as u32), Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(t.protocol, protocol::UDP);
}

#[test]
fn test_native_ipv6_flow_keeps_family() {
    let tracer = recording_tracer();
    let fl6 = Flow6 {
        saddr: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
        daddr: Ipv4Addr::new(10, 0, 0, 2).to_ipv6_mapped(),
        sport: 40000,
        dport: 53,
    };

    tracer.udp_v6_send_skb(PID_TGID, None, &fl6);
    tracer.udp_sendmsg_exit(PID_TGID, &Sock::new(SockId(1), AF_INET6), 32);

    let obs = tracer.backend().observations();
    assert_eq!(obs[0].tuple.family, family::V6);
    // mapped destination is left as is
    assert_eq!(obs[0].tuple.daddr_l >> 32, 0xffff);
}

#[test]
fn test_map_full_is_reported() {
    init_logging();
    let config = TracerConfig::from_yaml_str("udp_send_capacity: 1\n").unwrap();
    let tracer = Tracer::new(Recorder::default(), &config);
    let fl4 = Flow4 {
        saddr: Ipv4Addr::new(10, 0, 0, 1),
        daddr: Ipv4Addr::new(10, 0, 0, 53),
        sport: 40000,
        dport: 53,
    };

    tracer.udp_send_skb(1, None, &fl4);
    tracer.udp_send_skb(2, None, &fl4);
    // overwriting a staged key still works at capacity
    tracer.udp_send_skb(1, None, &fl4);

    assert_eq!(tracer.pending_udp_sends().len(), 1);
    assert_eq!(
        tracer.backend().misses(),
        vec![MissCounter::MapFull(Table::UdpSendArgs)]
    );
}

#[tokio::test]
async fn test_closed_connections_reach_consumer() {
    init_logging();
    let config = TracerConfig {
        closed_batch_size: 2,
        ..Default::default()
    };
    let (aggregator, mut closed_rx) = ConnAggregator::new(&config).unwrap();
    let tracer = Tracer::new(aggregator, &config);

    let mut socks = Vec::new();
    for port in [5000u16, 5001] {
        let mut sk = Sock::v4(
            SockId(port as u64),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
        );
        sk.packets_out = 4;
        sk.rtt = 120;
        tracer.tcp_connect(PID_TGID, &sk);
        tracer.tcp_finish_connect(&sk);
        tracer.tcp_sendmsg_exit(PID_TGID, &sk, 1000);
        tracer.tcp_retransmit_skb(&sk, 1);
        socks.push(sk);
    }
    assert_eq!(tracer.backend().active_connection_count(), 2);

    for sk in &socks {
        tracer.tcp_close(PID_TGID, sk);
        tracer.tcp_close_exit();
    }

    let batch = closed_rx.recv().await.unwrap();
    assert_eq!(batch.len(), 2);
    for conn in &batch {
        let stats = conn.stats.as_ref().unwrap();
        assert_eq!(stats.sent_bytes, 1000);
        assert_eq!(stats.sent_packets, 4);
        assert_eq!(stats.direction, direction::OUTGOING);

        let tcp = conn.tcp.unwrap();
        assert_eq!(tcp.retransmits, 1);
        assert_eq!(tcp.rtt, 120);
    }
    assert_eq!(tracer.backend().active_connection_count(), 0);
    assert_eq!(tracer.backend().pending_closed(), 0);
}

#[test]
fn test_unconnected_udp_peers_expire_after_destroy() {
    init_logging();
    let (aggregator, _closed_rx) = ConnAggregator::new(&TracerConfig::default()).unwrap();
    let tracer = Tracer::new(aggregator, &TracerConfig::default());
    let sk = Sock::v4(
        SockId(1),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 53),
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    );

    for port in 0..1000u16 {
        let peer = SockAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 0, 1), 20000 + port));
        tracer.udp_recvmsg_exit(PID_TGID, &sk, Some(&peer), 64, 0);
    }
    tracer.udp_destroy_sock(PID_TGID, &sk);
    tracer.udp_destroy_sock_exit();

    // per-peer tuples of an unconnected socket never see a close
    assert_eq!(tracer.backend().active_connection_count(), 1000);

    let expired = tracer.backend().expire_idle_since(std::time::Instant::now());
    assert_eq!(expired, 1000);
    assert_eq!(tracer.backend().active_connection_count(), 0);
}

#[test]
fn test_tracer_is_shareable_across_threads() {
    init_logging();
    let (aggregator, _closed_rx) = ConnAggregator::new(&TracerConfig::default()).unwrap();
    let tracer = std::sync::Arc::new(Tracer::new(aggregator, &TracerConfig::default()));

    let handles: Vec<_> = (0..4u64)
        .map(|i| {
            let tracer = tracer.clone();
            std::thread::spawn(move || {
                let pid_tgid = (1000 + i) << 32;
                let sk = Sock::v4(
                    SockId(i),
                    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6000 + i as u16),
                    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 443),
                );
                for _ in 0..100 {
                    tracer.tcp_recvmsg_exit(pid_tgid, &sk, 10);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let aggregator = tracer.backend();
    assert_eq!(aggregator.active_connection_count(), 4);
    assert_eq!(aggregator.events_processed(), 400);
    for (_, stats) in aggregator.connections() {
        assert_eq!(stats.recv_bytes, 1000);
    }
}

#[test]
fn test_version_const() {
    assert!(!conntrace::VERSION.is_empty());
}
