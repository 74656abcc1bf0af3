//! Event dispatch
//!
//! One method per kernel hook. Each runs to completion on the calling
//! thread: it validates its own arguments, resolves a tuple, then forwards an
//! observation, mutates a binding set, or stages/consumes pending state.
//! Nothing here blocks, retries or returns an error; every unresolved
//! precondition is a silent skip, at most logged and counted.

use crate::backend::{Backend, Observation, PacketCountMode};
use crate::bindings::PortBindings;
use crate::config::TracerConfig;
use crate::error::{ConnTraceError, Result};
use crate::pending::PendingTable;
use crate::resolver::{read_conn_tuple, read_conn_tuple_partial, resolve_chain, resolve_from, TupleSource};
use crate::sock::{Flow4, Flow6, Sock, SockAddr, SockId, Socket, MSG_PEEK};
use crate::sockfd::SockFdIndex;
use crate::telemetry::{MissCounter, Table};
use conntrace_common::{
    direction, pid_of, protocol, tcp_state, tid_of, ConnTuple, PidFd, PortBinding, TcpStats,
};
use log::{debug, trace};

pub struct Tracer<B: Backend> {
    backend: B,
    /// socket -> pid_tgid of the thread that called connect
    ongoing_connects: PendingTable<SockId, u64>,
    /// pid_tgid -> tuple resolved at `udp_send_skb` entry
    udp_sends: PendingTable<u64, ConnTuple>,
    tcp_ports: PortBindings,
    udp_ports: PortBindings,
    sockfd: SockFdIndex,
}

impl<B: Backend> Tracer<B> {
    pub fn new(backend: B, config: &TracerConfig) -> Self {
        Self {
            backend,
            ongoing_connects: PendingTable::new(
                Table::OngoingConnect,
                config.ongoing_connect_capacity,
            ),
            udp_sends: PendingTable::new(Table::UdpSendArgs, config.udp_send_capacity),
            tcp_ports: PortBindings::new(Table::TcpPortBindings, config.port_bindings_capacity),
            udp_ports: PortBindings::new(
                Table::UdpPortBindings,
                config.udp_port_bindings_capacity,
            ),
            sockfd: SockFdIndex::new(config.sockfd_capacity),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tcp_ports(&self) -> &PortBindings {
        &self.tcp_ports
    }

    pub fn udp_ports(&self) -> &PortBindings {
        &self.udp_ports
    }

    pub fn sockfd(&self) -> &SockFdIndex {
        &self.sockfd
    }

    pub fn pending_udp_sends(&self) -> &PendingTable<u64, ConnTuple> {
        &self.udp_sends
    }

    pub fn ongoing_connects(&self) -> &PendingTable<SockId, u64> {
        &self.ongoing_connects
    }

    /// Direction of a connection whose hooks did not say.
    ///
    /// A tuple whose local port is a known binding was accepted or received
    /// on that port, so it is incoming; anything else is outgoing.
    pub fn infer_direction(&self, t: &ConnTuple) -> u8 {
        if t.direction != direction::UNKNOWN {
            return t.direction;
        }

        let bound = if t.is_tcp() {
            self.tcp_ports.contains(&PortBinding::new(t.netns, t.sport))
        } else {
            self.udp_ports.contains(&PortBinding::new(0, t.sport))
        };

        if bound {
            direction::INCOMING
        } else {
            direction::OUTGOING
        }
    }

    // TCP

    /// fexit/tcp_sendmsg
    pub fn tcp_sendmsg_exit(&self, pid_tgid: u64, sk: &Sock, sent: i32) {
        if sent < 0 {
            debug!("tcp_sendmsg_exit: tcp_sendmsg err={}", sent);
            return;
        }
        trace!(
            "tcp_sendmsg_exit: pid_tgid: {}, sent: {}, sock: {:#x}",
            pid_tgid,
            sent,
            sk.id.0
        );

        let Some(t) = read_conn_tuple(sk, pid_tgid, protocol::TCP) else {
            return;
        };

        self.backend.notify_tcp_stats(&t, sk, 0);
        self.backend.forward_observation(&Observation {
            sent_bytes: sent as u64,
            packets_out: sk.packets_out,
            packets_in: sk.packets_in,
            mode: PacketCountMode::Absolute,
            ..Observation::new(t, sk.id)
        });
    }

    /// fexit/tcp_recvmsg
    pub fn tcp_recvmsg_exit(&self, pid_tgid: u64, sk: &Sock, copied: i32) {
        if copied < 0 {
            return;
        }

        let Some(t) = read_conn_tuple(sk, pid_tgid, protocol::TCP) else {
            return;
        };

        self.backend.notify_tcp_stats(&t, sk, 0);
        self.backend.forward_observation(&Observation {
            recv_bytes: copied as u64,
            packets_out: sk.packets_out,
            packets_in: sk.packets_in,
            mode: PacketCountMode::Absolute,
            ..Observation::new(t, sk.id)
        });
    }

    /// fentry/tcp_connect: remember who connected until the handshake completes
    pub fn tcp_connect(&self, pid_tgid: u64, sk: &Sock) {
        trace!(
            "tcp_connect: tgid: {}, pid: {}",
            pid_of(pid_tgid),
            tid_of(pid_tgid)
        );
        self.record(self.ongoing_connects.stage(sk.id, pid_tgid));
    }

    /// fentry/tcp_finish_connect
    pub fn tcp_finish_connect(&self, sk: &Sock) {
        let Some(pid_tgid) = self.ongoing_connects.consume(&sk.id) else {
            return;
        };
        trace!(
            "tcp_finish_connect: tgid: {}, pid: {}",
            pid_of(pid_tgid),
            tid_of(pid_tgid)
        );

        let Some(t) = read_conn_tuple(sk, pid_tgid, protocol::TCP) else {
            return;
        };

        self.backend
            .notify_tcp_stats(&t, sk, tcp_state::ESTABLISHED);
        self.backend.forward_observation(&Observation {
            direction: direction::OUTGOING,
            ..Observation::new(t, sk.id)
        });
        trace!(
            "tcp_finish_connect: netns: {}, sport: {}, dport: {}",
            t.netns,
            t.sport,
            t.dport
        );
    }

    /// fexit/inet_csk_accept; `sk` is the accepted socket, if any
    pub fn inet_csk_accept_exit(&self, pid_tgid: u64, sk: Option<&Sock>) {
        let Some(sk) = sk else {
            return;
        };

        let Some(t) = read_conn_tuple(sk, pid_tgid, protocol::TCP) else {
            return;
        };

        self.backend
            .notify_tcp_stats(&t, sk, tcp_state::ESTABLISHED);
        self.backend.forward_observation(&Observation {
            direction: direction::INCOMING,
            ..Observation::new(t, sk.id)
        });

        self.record(self.tcp_ports.bind(PortBinding::new(t.netns, t.sport)));
        trace!(
            "inet_csk_accept_exit: netns: {}, sport: {}, dport: {}",
            t.netns,
            t.sport,
            t.dport
        );
    }

    /// fentry/tcp_set_state; only transitions to ESTABLISHED are tracked
    pub fn tcp_set_state(&self, pid_tgid: u64, sk: &Sock, state: u8) {
        if state != tcp_state::ESTABLISHED {
            return;
        }

        let Some(t) = read_conn_tuple(sk, pid_tgid, protocol::TCP) else {
            return;
        };

        self.backend.update_tcp_stats(
            &t,
            TcpStats {
                state_transitions: 1 << state,
                ..Default::default()
            },
        );
    }

    /// fentry/tcp_retransmit_skb. Runs outside process context, so the
    /// tuple carries no pid.
    pub fn tcp_retransmit_skb(&self, sk: &Sock, segs: i32) {
        trace!("tcp_retransmit_skb: segs: {}", segs);
        let Ok(segs) = u32::try_from(segs) else {
            return;
        };

        let Some(t) = read_conn_tuple(sk, 0, protocol::TCP) else {
            return;
        };

        self.backend.update_tcp_stats(
            &t,
            TcpStats {
                retransmits: segs,
                ..Default::default()
            },
        );
    }

    /// fentry/tcp_close
    pub fn tcp_close(&self, pid_tgid: u64, sk: &Sock) {
        // only present if the connection never got established
        self.ongoing_connects.discard(&sk.id);
        self.sockfd.remove_by_sock(&sk.id);

        let Some(t) = read_conn_tuple(sk, pid_tgid, protocol::TCP) else {
            return;
        };
        trace!(
            "tcp_close: netns: {}, sport: {}, dport: {}",
            t.netns,
            t.sport,
            t.dport
        );

        self.backend.finalize_close(&t, sk.id);
    }

    /// fexit/tcp_close
    pub fn tcp_close_exit(&self) {
        self.backend.flush_if_full();
    }

    /// fentry/inet_csk_listen_stop
    pub fn inet_csk_listen_stop(&self, sk: &Sock) {
        let lport = sk.local_port();
        if lport == 0 {
            debug!("ERR(inet_csk_listen_stop): lport is 0");
            self.backend.increment_miss_counter(MissCounter::UnknownPort);
            return;
        }

        let binding = PortBinding::new(sk.netns, lport);
        self.tcp_ports.unbind(&binding);
        trace!(
            "inet_csk_listen_stop: net ns: {}, lport: {}",
            binding.netns,
            binding.port
        );
    }

    // UDP

    /// kprobe/udp_send_skb; `sk` is `skb->sk`, if any
    pub fn udp_send_skb(&self, pid_tgid: u64, sk: Option<&Sock>, fl4: &Flow4) {
        self.stage_udp_send(pid_tgid, sk, fl4);
    }

    /// kprobe/udp_v6_send_skb
    pub fn udp_v6_send_skb(&self, pid_tgid: u64, sk: Option<&Sock>, fl6: &Flow6) {
        self.stage_udp_send(pid_tgid, sk, fl6);
    }

    /// fexit/udp_sendmsg and fexit/udpv6_sendmsg
    pub fn udp_sendmsg_exit(&self, pid_tgid: u64, sk: &Sock, sent: i32) {
        let Some(t) = self.udp_sends.consume(&pid_tgid) else {
            if sent > 0 {
                self.backend
                    .increment_miss_counter(MissCounter::UdpSendUnmatched);
            }
            return;
        };

        if sent <= 0 {
            return;
        }
        trace!("udp_sendmsg_exit: sent: {}", sent);

        self.backend.forward_observation(&Observation {
            sent_bytes: sent as u64,
            packets_out: 1,
            ..Observation::new(t, sk.id)
        });
    }

    /// fexit/udp_recvmsg and fexit/udpv6_recvmsg; `msg_name` is the
    /// caller's `msg->msg_name`, if any
    pub fn udp_recvmsg_exit(
        &self,
        pid_tgid: u64,
        sk: &Sock,
        msg_name: Option<&SockAddr>,
        copied: i32,
        flags: i32,
    ) {
        if copied < 0 {
            debug!("udp_recvmsg_exit: ret={} < 0, pid_tgid={}", copied, pid_tgid);
            return;
        }
        if flags & MSG_PEEK != 0 {
            return;
        }

        let mut t = ConnTuple::default();
        if let Some(addr) = msg_name {
            resolve_from(&mut t, addr, pid_tgid, protocol::UDP);
        }

        if !read_conn_tuple_partial(&mut t, sk, pid_tgid, protocol::UDP) {
            debug!(
                "ERR(udp_recvmsg_exit): error reading conn tuple, pid_tgid={}",
                pid_tgid
            );
            return;
        }

        self.backend.forward_observation(&Observation {
            recv_bytes: copied as u64,
            packets_in: 1,
            ..Observation::new(t, sk.id)
        });
    }

    /// fentry/udp_destroy_sock
    pub fn udp_destroy_sock(&self, pid_tgid: u64, sk: &Sock) {
        let lport = match read_conn_tuple(sk, pid_tgid, protocol::UDP) {
            Some(t) => {
                self.backend.finalize_close(&t, sk.id);
                t.sport
            }
            None => sk.local_port(),
        };

        if lport == 0 {
            debug!("ERR(udp_destroy_sock): lport is 0");
            self.backend.increment_miss_counter(MissCounter::UnknownPort);
            return;
        }

        // UDP bindings are tracked without a namespace, see inet_bind_exit
        self.udp_ports.unbind(&PortBinding::new(0, lport));
        trace!("udp_destroy_sock: port {} marked as closed", lport);
    }

    /// fexit/udp_destroy_sock
    pub fn udp_destroy_sock_exit(&self) {
        self.backend.flush_if_full();
    }

    /// fexit/inet_bind and fexit/inet6_bind
    pub fn inet_bind_exit(&self, socket: &Socket, addr: Option<&SockAddr>, rc: i32) {
        trace!("inet_bind_exit: rc={}", rc);
        if rc != 0 || !socket.is_dgram() {
            return;
        }

        let Some(addr) = addr else {
            debug!("inet_bind_exit: could not read sockaddr");
            return;
        };

        let mut port = addr.port();
        if port == 0 {
            port = socket.sk.as_ref().map_or(0, Sock::local_port);
        }
        if port == 0 {
            debug!("ERR(inet_bind_exit): sin_port is 0");
            self.backend.increment_miss_counter(MissCounter::UnknownPort);
            return;
        }

        // the bind hook has no namespace to offer
        self.record(self.udp_ports.bind(PortBinding::new(0, port)));
        trace!("inet_bind_exit: bound UDP port {}", port);
    }

    // descriptors

    /// fexit/sockfd_lookup_light; indexes `(pid, fd) <-> sock` for TCP sockets
    pub fn sockfd_lookup_light_exit(&self, pid_tgid: u64, fd: i32, socket: Option<&Socket>) {
        let pid_fd = PidFd {
            pid: pid_of(pid_tgid),
            fd,
        };

        // already indexed: skip the map writes for long-lived descriptors
        if self.sockfd.resolve(&pid_fd).is_some() {
            return;
        }

        let Some(socket) = socket else {
            return;
        };
        if !SockFdIndex::is_indexable(socket) {
            return;
        }
        let Some(sk) = socket.sk.as_ref() else {
            return;
        };

        // entries are cleaned up by tcp_close
        self.record(self.sockfd.register_if_absent(pid_fd, sk.id));
    }

    /// fexit/do_sendfile. The descriptor is all the hook has, so the socket
    /// it names is looked up in the index and read through `read_sock`.
    pub fn do_sendfile_exit<F>(&self, pid_tgid: u64, out_fd: i32, sent: i64, read_sock: F)
    where
        F: FnOnce(SockId) -> Option<Sock>,
    {
        if sent <= 0 {
            return;
        }

        let pid_fd = PidFd {
            pid: pid_of(pid_tgid),
            fd: out_fd,
        };
        let Some(sock) = self.sockfd.resolve(&pid_fd) else {
            return;
        };
        let Some(sk) = read_sock(sock) else {
            return;
        };

        let Some(t) = read_conn_tuple(&sk, pid_tgid, protocol::TCP) else {
            return;
        };

        self.backend.forward_observation(&Observation {
            sent_bytes: sent as u64,
            ..Observation::new(t, sk.id)
        });
    }

    fn stage_udp_send(&self, pid_tgid: u64, sk: Option<&Sock>, flow: &dyn TupleSource) {
        let mut t = ConnTuple::default();
        let resolved = match sk {
            Some(sk) => resolve_chain(
                &mut t,
                &[sk as &dyn TupleSource, flow],
                pid_tgid,
                protocol::UDP,
            ),
            None => resolve_from(&mut t, flow, pid_tgid, protocol::UDP),
        };

        if !resolved {
            self.backend
                .increment_miss_counter(MissCounter::UdpSendMissed);
            return;
        }

        self.record(self.udp_sends.stage(pid_tgid, t));
    }

    /// Turn a failed table write into a diagnostic
    fn record<T>(&self, result: Result<T>) {
        match result {
            Ok(_) => {}
            Err(ConnTraceError::MapFull { table, capacity }) => {
                debug!("{} is full ({} entries), dropping update", table, capacity);
                self.backend
                    .increment_miss_counter(MissCounter::MapFull(table));
            }
            Err(e) => debug!("table update failed: {}", e),
        }
    }
}
