//! Views of the kernel objects a hook can read
//!
//! The hook layer copies what it can read out of `struct sock`,
//! `struct socket`, `struct flowi4`/`flowi6` and `struct sockaddr` into
//! these plain values. Fields the kernel did not provide are left at zero.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

/// Opaque socket identity (the kernel object address)
///
/// Only ever used as a map key; the engine never dereferences it.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SockId(pub u64);

/// Snapshot of a `struct sock`
#[derive(Debug, Clone, Copy)]
pub struct Sock {
    pub id: SockId,
    pub netns: u64,
    /// `skc_family`, one of `libc::AF_INET`/`libc::AF_INET6`
    pub family: u16,
    /// `skc_rcv_saddr`
    pub saddr4: Ipv4Addr,
    /// `skc_daddr`
    pub daddr4: Ipv4Addr,
    /// `skc_v6_rcv_saddr`
    pub saddr6: Ipv6Addr,
    /// `skc_v6_daddr`
    pub daddr6: Ipv6Addr,
    /// `inet_sport`, host order
    pub sport: u16,
    /// `skc_num`, the bound local port
    pub num: u16,
    /// `skc_dport`, host order
    pub dport: u16,
    /// `segs_in` for TCP sockets
    pub packets_in: u32,
    /// `segs_out` for TCP sockets
    pub packets_out: u32,
    /// `srtt_us >> 3`
    pub rtt: u32,
    /// `mdev_us >> 2`
    pub rtt_var: u32,
    pub state: u8,
}

impl Sock {
    pub fn new(id: SockId, family: u16) -> Self {
        Self {
            id,
            netns: 0,
            family,
            saddr4: Ipv4Addr::UNSPECIFIED,
            daddr4: Ipv4Addr::UNSPECIFIED,
            saddr6: Ipv6Addr::UNSPECIFIED,
            daddr6: Ipv6Addr::UNSPECIFIED,
            sport: 0,
            num: 0,
            dport: 0,
            packets_in: 0,
            packets_out: 0,
            rtt: 0,
            rtt_var: 0,
            state: 0,
        }
    }

    /// IPv4 socket with both endpoints set
    pub fn v4(id: SockId, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            saddr4: *src.ip(),
            daddr4: *dst.ip(),
            sport: src.port(),
            num: src.port(),
            dport: dst.port(),
            ..Self::new(id, AF_INET)
        }
    }

    /// IPv6 socket with both endpoints set
    pub fn v6(id: SockId, src: SocketAddrV6, dst: SocketAddrV6) -> Self {
        Self {
            saddr6: *src.ip(),
            daddr6: *dst.ip(),
            sport: src.port(),
            num: src.port(),
            dport: dst.port(),
            ..Self::new(id, AF_INET6)
        }
    }

    pub fn with_netns(mut self, netns: u64) -> Self {
        self.netns = netns;
        self
    }

    /// Local port, falling back to `skc_num` when `inet_sport` is not set yet
    pub fn local_port(&self) -> u16 {
        if self.sport != 0 {
            self.sport
        } else {
            self.num
        }
    }
}

/// Snapshot of a `struct socket`
#[derive(Debug, Clone, Copy)]
pub struct Socket {
    /// `libc::SOCK_STREAM`, `libc::SOCK_DGRAM`, ...
    pub sock_type: u16,
    /// `ops->family`; `None` when the proto ops pointer is null
    pub ops_family: Option<u16>,
    pub sk: Option<Sock>,
}

impl Socket {
    pub fn is_stream(&self) -> bool {
        self.sock_type == SOCK_STREAM
    }

    pub fn is_dgram(&self) -> bool {
        self.sock_type & SOCK_DGRAM != 0
    }
}

/// Snapshot of a `struct flowi4`
#[derive(Debug, Clone, Copy)]
pub struct Flow4 {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
}

/// Snapshot of a `struct flowi6`
#[derive(Debug, Clone, Copy)]
pub struct Flow6 {
    pub saddr: Ipv6Addr,
    pub daddr: Ipv6Addr,
    pub sport: u16,
    pub dport: u16,
}

/// Caller-supplied `struct sockaddr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Other { family: u16 },
}

impl SockAddr {
    pub fn family(&self) -> u16 {
        match self {
            SockAddr::V4(_) => AF_INET,
            SockAddr::V6(_) => AF_INET6,
            SockAddr::Other { family } => *family,
        }
    }

    /// Port for inet families, zero otherwise
    pub fn port(&self) -> u16 {
        match self {
            SockAddr::V4(addr) => addr.port(),
            SockAddr::V6(addr) => addr.port(),
            SockAddr::Other { .. } => 0,
        }
    }
}

pub const AF_INET: u16 = libc::AF_INET as u16;
pub const AF_INET6: u16 = libc::AF_INET6 as u16;
pub const SOCK_STREAM: u16 = libc::SOCK_STREAM as u16;
pub const SOCK_DGRAM: u16 = libc::SOCK_DGRAM as u16;
pub const MSG_PEEK: i32 = libc::MSG_PEEK;
