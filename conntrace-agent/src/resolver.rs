//! Tuple resolution
//!
//! A tuple is built by merging candidates from one or more sources in
//! priority order: the authoritative socket first, weaker sources (flow
//! descriptors, caller-supplied addresses) after. Merging only fills unset
//! fields, so a later source can complete what an earlier one left out
//! without disturbing anything already known.

use crate::sock::{Flow4, Flow6, SockAddr, Sock, AF_INET, AF_INET6};
use conntrace_common::{family, pid_of, ConnTuple};
use log::trace;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Anything that can contribute fields to a [`ConnTuple`]
pub trait TupleSource {
    /// Fields this source knows, or `None` when it cannot contribute at all
    fn candidate(&self) -> Option<ConnTuple>;

    fn name(&self) -> &'static str;
}

impl TupleSource for Sock {
    fn candidate(&self) -> Option<ConnTuple> {
        let mut t = ConnTuple {
            netns: self.netns,
            sport: self.local_port(),
            dport: self.dport,
            ..Default::default()
        };

        match self.family {
            AF_INET => {
                t.family = family::V4;
                t.set_saddr(v4(self.saddr4));
                t.set_daddr(v4(self.daddr4));
            }
            AF_INET6 => {
                t.family = family::V6;
                t.set_saddr(v6(self.saddr6));
                t.set_daddr(v6(self.daddr6));
            }
            _ => return None,
        }

        // the family travels with the addresses: a dual-stack socket with
        // nothing bound or connected may still send over a v4 flow
        if t.saddr() == 0 && t.daddr() == 0 {
            t.family = 0;
        }

        Some(t)
    }

    fn name(&self) -> &'static str {
        "sock"
    }
}

impl TupleSource for Flow4 {
    fn candidate(&self) -> Option<ConnTuple> {
        let mut t = ConnTuple {
            family: family::V4,
            sport: self.sport,
            dport: self.dport,
            ..Default::default()
        };
        t.set_saddr(v4(self.saddr));
        t.set_daddr(v4(self.daddr));
        Some(t)
    }

    fn name(&self) -> &'static str {
        "fl4"
    }
}

impl TupleSource for Flow6 {
    fn candidate(&self) -> Option<ConnTuple> {
        let mut t = ConnTuple {
            family: family::V6,
            sport: self.sport,
            dport: self.dport,
            ..Default::default()
        };
        t.set_saddr(v6(self.saddr));
        t.set_daddr(v6(self.daddr));
        Some(t)
    }

    fn name(&self) -> &'static str {
        "fl6"
    }
}

/// A `msg_name` on receive names the remote peer, i.e. the destination
impl TupleSource for SockAddr {
    fn candidate(&self) -> Option<ConnTuple> {
        let mut t = ConnTuple::default();
        match self {
            SockAddr::V4(addr) => {
                t.family = family::V4;
                t.set_daddr(v4(*addr.ip()));
                t.dport = addr.port();
            }
            SockAddr::V6(addr) => {
                t.family = family::V6;
                t.set_daddr(v6(*addr.ip()));
                t.dport = addr.port();
            }
            SockAddr::Other { .. } => return None,
        }
        Some(t)
    }

    fn name(&self) -> &'static str {
        "sockaddr"
    }
}

/// Merge one source into `t` and report whether `t` is now complete.
///
/// Stamps the pid and protocol when unset, merges the candidate, checks
/// addresses, collapses IPv4-mapped addresses, then checks ports.
pub fn resolve_from<S>(t: &mut ConnTuple, source: &S, pid_tgid: u64, protocol: u8) -> bool
where
    S: TupleSource + ?Sized,
{
    let Some(mut candidate) = source.candidate() else {
        trace!("{}: unsupported address family", source.name());
        return false;
    };
    candidate.pid = pid_of(pid_tgid);
    candidate.protocol = protocol;

    t.merge(&candidate);

    if !t.has_addrs() {
        trace!(
            "ERR({}): src/dst addr not set src:{:#x}, dst:{:#x}",
            source.name(),
            t.saddr(),
            t.daddr()
        );
        return false;
    }

    t.collapse_ipv4_mapped();

    if !t.has_ports() {
        trace!(
            "ERR({}): src/dst port not set src:{}, dst:{}",
            source.name(),
            t.sport,
            t.dport
        );
        return false;
    }

    true
}

/// Walk `sources` in priority order until the tuple is complete
pub fn resolve_chain(
    t: &mut ConnTuple,
    sources: &[&dyn TupleSource],
    pid_tgid: u64,
    protocol: u8,
) -> bool {
    sources
        .iter()
        .any(|source| resolve_from(t, *source, pid_tgid, protocol))
}

/// Fresh tuple from the authoritative socket
pub fn read_conn_tuple(sk: &Sock, pid_tgid: u64, protocol: u8) -> Option<ConnTuple> {
    let mut t = ConnTuple::default();
    read_conn_tuple_partial(&mut t, sk, pid_tgid, protocol).then_some(t)
}

/// Complete an existing tuple from the socket
pub fn read_conn_tuple_partial(t: &mut ConnTuple, sk: &Sock, pid_tgid: u64, protocol: u8) -> bool {
    resolve_from(t, sk, pid_tgid, protocol)
}

/// Complete an existing tuple from an IPv4 flow descriptor
pub fn read_conn_tuple_from_flow4(
    t: &mut ConnTuple,
    fl4: &Flow4,
    pid_tgid: u64,
    protocol: u8,
) -> bool {
    resolve_from(t, fl4, pid_tgid, protocol)
}

/// Complete an existing tuple from an IPv6 flow descriptor
pub fn read_conn_tuple_from_flow6(
    t: &mut ConnTuple,
    fl6: &Flow6,
    pid_tgid: u64,
    protocol: u8,
) -> bool {
    resolve_from(t, fl6, pid_tgid, protocol)
}

fn v4(addr: Ipv4Addr) -> u128 {
    u32::from(addr) as u128
}

fn v6(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}
