use std::net::Ipv6Addr;

/// IEEE 802.15.4 extended (64-bit) link address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LinkAddr(pub [u8; 8]);

impl LinkAddr {
    #[must_use]
    pub fn from_u64(x: u64) -> Self {
        Self(x.to_be_bytes())
    }

    #[must_use]
    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Interface identifier derived from this link address.
    #[must_use]
    #[inline]
    pub fn iid(&self) -> [u8; 8] {
        self.0
    }
}

/// `fe80::<iid>`
#[must_use]
pub fn link_local(iid: [u8; 8]) -> Ipv6Addr {
    with_prefix([0xfe, 0x80, 0, 0, 0, 0, 0, 0], iid)
}

#[must_use]
pub fn with_prefix(prefix: [u8; 8], iid: [u8; 8]) -> Ipv6Addr {
    let mut octets = [0; 16];
    octets[..8].copy_from_slice(&prefix);
    octets[8..].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}

#[must_use]
pub fn iid_of(addr: &Ipv6Addr) -> [u8; 8] {
    let mut iid = [0; 8];
    iid.copy_from_slice(&addr.octets()[8..]);
    iid
}

/// Exactly `fe80::/64`.
#[must_use]
pub fn is_link_local(addr: &Ipv6Addr) -> bool {
    let s = addr.segments();
    s[0] == 0xfe80 && s[1] == 0 && s[2] == 0 && s[3] == 0
}

/// `0000:00ff:fe00:XXXX`, the form derived from a 16-bit short address.
#[must_use]
pub fn is_short_iid(iid: &[u8; 8]) -> bool {
    iid[..6] == [0, 0, 0, 0xff, 0xfe, 0]
}

/// Prefixes shared out of band for context-based address compression.
#[derive(Debug, Clone, Default)]
pub struct ContextTable {
    prefixes: [Option<[u8; 8]>; 16],
}

impl ContextTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: u8, prefix: [u8; 8]) {
        assert!(id < 16);
        self.prefixes[id as usize] = Some(prefix);
    }

    pub fn unset(&mut self, id: u8) {
        assert!(id < 16);
        self.prefixes[id as usize] = None;
    }

    #[must_use]
    pub fn get(&self, id: u8) -> Option<[u8; 8]> {
        self.prefixes.get(id as usize).copied().flatten()
    }
}
