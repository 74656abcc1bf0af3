//! Shared types between the kernel hook layer and the userspace engine
//!
//! This crate defines the connection identity structures that must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Shared between kernel probes and the correlation engine
//!
//! It also owns the additive merge rule for [`ConnTuple`], so that every
//! resolution path (socket, flow descriptor, caller-supplied address) fills
//! gaps the same way.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Canonical identity of one network flow
///
/// Layout (56 bytes total, 8-byte aligned):
/// - saddr_h/saddr_l: Source address, upper and lower 64 bits
/// - daddr_h/daddr_l: Destination address, upper and lower 64 bits
/// - netns: Network namespace inode number
/// - pid: Owning process id (upper half of pid_tgid)
/// - sport/dport: Ports (host byte order)
/// - protocol: `protocol::TCP` or `protocol::UDP`
/// - family: `family::V4` or `family::V6`
/// - direction: `direction::*`
///
/// Addresses hold the numeric value of the network-order address, so
/// 10.0.0.1 is stored as `saddr_l = 0x0A00_0001` with `saddr_h = 0`, and an
/// IPv6 address is `(h << 64) | l`.
///
/// Every field is unset at zero. [`ConnTuple::merge`] only ever fills unset
/// fields, which makes repeated or partial resolution idempotent.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct ConnTuple {
    pub saddr_h: u64,
    pub saddr_l: u64,
    pub daddr_h: u64,
    pub daddr_l: u64,
    pub netns: u64,
    pub pid: u32,
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    pub family: u8,
    pub direction: u8,
    pub _padding: [u8; 5],
}

impl ConnTuple {
    /// Source address as a 128-bit value
    pub const fn saddr(&self) -> u128 {
        join(self.saddr_h, self.saddr_l)
    }

    /// Destination address as a 128-bit value
    pub const fn daddr(&self) -> u128 {
        join(self.daddr_h, self.daddr_l)
    }

    pub fn set_saddr(&mut self, addr: u128) {
        (self.saddr_h, self.saddr_l) = split(addr);
    }

    pub fn set_daddr(&mut self, addr: u128) {
        (self.daddr_h, self.daddr_l) = split(addr);
    }

    /// Fill every unset field of `self` from `other`.
    ///
    /// Set fields are never touched. Addresses are merged as a unit: an
    /// address counts as set when either half is nonzero.
    pub fn merge(&mut self, other: &ConnTuple) {
        if self.saddr() == 0 {
            self.saddr_h = other.saddr_h;
            self.saddr_l = other.saddr_l;
        }
        if self.daddr() == 0 {
            self.daddr_h = other.daddr_h;
            self.daddr_l = other.daddr_l;
        }
        if self.netns == 0 {
            self.netns = other.netns;
        }
        if self.pid == 0 {
            self.pid = other.pid;
        }
        if self.sport == 0 {
            self.sport = other.sport;
        }
        if self.dport == 0 {
            self.dport = other.dport;
        }
        if self.protocol == 0 {
            self.protocol = other.protocol;
        }
        if self.family == 0 {
            self.family = other.family;
        }
        if self.direction == direction::UNKNOWN {
            self.direction = other.direction;
        }
    }

    /// Collapse IPv4-mapped IPv6 addresses into plain IPv4.
    ///
    /// When both addresses are `::ffff:a.b.c.d` the tuple becomes
    /// `family::V4` with the high halves cleared and the low halves holding
    /// the 32-bit IPv4 value. A tuple already marked `V4` gets any leftover
    /// mapped address normalized the same way. Collapsed addresses are no
    /// longer mapped, so calling this again is a no-op.
    pub fn collapse_ipv4_mapped(&mut self) {
        let src_mapped = is_ipv4_mapped(self.saddr_h, self.saddr_l);
        let dst_mapped = is_ipv4_mapped(self.daddr_h, self.daddr_l);

        if src_mapped && dst_mapped {
            self.family = family::V4;
        }
        if self.family != family::V4 {
            return;
        }
        if src_mapped {
            self.saddr_h = 0;
            self.saddr_l &= IPV4_MASK;
        }
        if dst_mapped {
            self.daddr_h = 0;
            self.daddr_l &= IPV4_MASK;
        }
    }

    /// Both addresses and both ports are known
    pub const fn is_complete(&self) -> bool {
        self.has_addrs() && self.has_ports()
    }

    pub const fn has_addrs(&self) -> bool {
        self.saddr() != 0 && self.daddr() != 0
    }

    pub const fn has_ports(&self) -> bool {
        self.sport != 0 && self.dport != 0
    }

    pub const fn is_tcp(&self) -> bool {
        self.protocol == protocol::TCP
    }
}

/// A bound listening (TCP) or bound (UDP) local port
///
/// UDP bindings always carry `netns = 0`: the bind exit hook cannot observe
/// the namespace, so the UDP set is keyed by port alone.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct PortBinding {
    pub netns: u64,
    pub port: u16,
    pub _padding: [u8; 6],
}

impl PortBinding {
    pub const fn new(netns: u64, port: u16) -> Self {
        Self {
            netns,
            port,
            _padding: [0; 6],
        }
    }
}

/// Process id and file descriptor pair
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct PidFd {
    pub pid: u32,
    pub fd: i32,
}

/// Protocol level counters forwarded independently of byte counts
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub retransmits: u32,
    pub rtt: u32,
    pub rtt_var: u32,
    /// Bitmask of `1 << tcp_state::*` transitions seen
    pub state_transitions: u16,
    pub _padding: u16,
}

/// Process id half of a `bpf_get_current_pid_tgid()` value
pub const fn pid_of(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}

/// Thread id half of a `bpf_get_current_pid_tgid()` value
pub const fn tid_of(pid_tgid: u64) -> u32 {
    pid_tgid as u32
}

/// True for `::ffff:a.b.c.d`
pub const fn is_ipv4_mapped(h: u64, l: u64) -> bool {
    h == 0 && (l >> 32) == IPV4_MAPPED_PREFIX
}

const IPV4_MAPPED_PREFIX: u64 = 0x0000_ffff;
const IPV4_MASK: u64 = 0xffff_ffff;

const fn join(h: u64, l: u64) -> u128 {
    ((h as u128) << 64) | l as u128
}

const fn split(addr: u128) -> (u64, u64) {
    ((addr >> 64) as u64, addr as u64)
}

/// Transport protocol constants
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Address family constants (zero means not yet known)
pub mod family {
    pub const V4: u8 = 1;
    pub const V6: u8 = 2;
}

/// Connection direction constants
pub mod direction {
    pub const UNKNOWN: u8 = 0;
    pub const INCOMING: u8 = 1;
    pub const OUTGOING: u8 = 2;
}

/// Subset of the kernel TCP state machine the engine reacts to
pub mod tcp_state {
    pub const ESTABLISHED: u8 = 1;
    pub const CLOSE: u8 = 7;
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<ConnTuple>() == 56,
        "ConnTuple must be exactly 56 bytes"
    );
    assert!(
        core::mem::align_of::<ConnTuple>() == 8,
        "ConnTuple must be 8-byte aligned"
    );
};

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<PortBinding>() == 16,
        "PortBinding must be exactly 16 bytes"
    );
    assert!(
        core::mem::size_of::<PidFd>() == 8,
        "PidFd must be exactly 8 bytes"
    );
    assert!(
        core::mem::size_of::<TcpStats>() == 16,
        "TcpStats must be exactly 16 bytes"
    );
};

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(a: u8, b: u8, c: u8, d: u8) -> u128 {
        0xffff_0000_0000 | u32::from_be_bytes([a, b, c, d]) as u128
    }

    fn complete() -> ConnTuple {
        let mut t = ConnTuple {
            pid: 100,
            sport: 5000,
            dport: 80,
            protocol: protocol::TCP,
            family: family::V4,
            netns: 4026531840,
            ..Default::default()
        };
        t.set_saddr(0x0A00_0001);
        t.set_daddr(0x0A00_0002);
        t
    }

    #[test]
    fn test_merge_never_overwrites_set_fields() {
        let mut t = complete();
        let mut other = ConnTuple {
            pid: 999,
            sport: 1,
            dport: 2,
            netns: 3,
            protocol: protocol::UDP,
            family: family::V6,
            direction: direction::INCOMING,
            ..Default::default()
        };
        other.set_saddr(7);
        other.set_daddr(8);

        t.merge(&other);

        let expected = ConnTuple {
            direction: direction::INCOMING,
            ..complete()
        };
        assert_eq!(t, expected);
    }

    #[test]
    fn test_merge_fills_unset_fields() {
        let mut t = ConnTuple {
            dport: 53,
            ..Default::default()
        };
        t.set_daddr(0x0808_0808);

        t.merge(&complete());

        assert_eq!(t.dport, 53);
        assert_eq!(t.daddr(), 0x0808_0808);
        assert_eq!(t.sport, 5000);
        assert_eq!(t.saddr(), 0x0A00_0001);
        assert_eq!(t.pid, 100);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut once = ConnTuple::default();
        once.merge(&complete());
        let mut twice = once;
        twice.merge(&complete());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_collapse_both_mapped() {
        let mut t = ConnTuple {
            family: family::V6,
            ..Default::default()
        };
        t.set_saddr(mapped(10, 0, 0, 1));
        t.set_daddr(mapped(10, 0, 0, 2));

        t.collapse_ipv4_mapped();

        assert_eq!(t.family, family::V4);
        assert_eq!(t.saddr_h, 0);
        assert_eq!(t.daddr_h, 0);
        assert_eq!(t.saddr_l, 0x0A00_0001);
        assert_eq!(t.daddr_l, 0x0A00_0002);

        let collapsed = t;
        t.collapse_ipv4_mapped();
        assert_eq!(t, collapsed);
    }

    #[test]
    fn test_collapse_requires_both_mapped() {
        let mut t = ConnTuple {
            family: family::V6,
            ..Default::default()
        };
        t.set_saddr(mapped(10, 0, 0, 1));
        t.set_daddr(0x2001_0db8_0000_0000_0000_0000_0000_0001);

        t.collapse_ipv4_mapped();

        assert_eq!(t.family, family::V6);
        assert_eq!(t.saddr(), mapped(10, 0, 0, 1));
    }

    #[test]
    fn test_completeness() {
        assert!(complete().is_complete());
        assert!(!ConnTuple { sport: 0, ..complete() }.is_complete());
        assert!(!ConnTuple { dport: 0, ..complete() }.is_complete());

        let mut no_dst = complete();
        no_dst.set_daddr(0);
        assert!(!no_dst.is_complete());

        let mut high_only = complete();
        high_only.set_saddr(1u128 << 64);
        assert!(high_only.is_complete());
    }

    #[test]
    fn test_pid_tgid_halves() {
        let pid_tgid = (100u64 << 32) | 101;
        assert_eq!(pid_of(pid_tgid), 100);
        assert_eq!(tid_of(pid_tgid), 101);
    }
}
