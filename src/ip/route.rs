use std::cmp::Reverse;
use std::net::Ipv4Addr;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    network: u32,
    mask: u32,
    prefix_len: u8,
    next_hop: Ipv4Addr,
}

/// Longest-prefix-match forwarding table.
///
/// Entries are kept sorted by descending prefix length so a lookup is a
/// first-match scan. The sort is stable: among equal prefix lengths the
/// entry configured first wins.
#[derive(Debug, Default)]
pub struct ForwardingTable {
    routes: Vec<Route>,
}

impl ForwardingTable {
    /// Parses `(cidr, next_hop)` pairs, `cidr` in `a.b.c.d/n` form with
    /// `0 <= n <= 32`. Replaces the whole table.
    pub fn from_entries(entries: &[(&str, &str)]) -> Result<Self, Error> {
        let mut routes = Vec::with_capacity(entries.len());

        for &(cidr, next_hop) in entries {
            let (addr, prefix_len) = cidr
                .split_once('/')
                .ok_or_else(|| Error::InvalidCidr(cidr.to_string()))?;

            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
            let prefix_len: u8 = prefix_len
                .parse()
                .ok()
                .filter(|n| *n <= 32)
                .ok_or_else(|| Error::InvalidCidr(cidr.to_string()))?;

            let mask = mask_from_prefix(prefix_len);

            routes.push(Route {
                network: u32::from(addr) & mask,
                mask,
                prefix_len,
                next_hop: next_hop.parse()?,
            });
        }

        routes.sort_by_key(|r| Reverse(r.prefix_len));

        Ok(ForwardingTable { routes })
    }

    /// Next hop for `dst`, or `None` when no configured prefix matches.
    /// There is no implicit default route; configure `0.0.0.0/0` for one.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        let dst = u32::from(dst);

        self.routes
            .iter()
            .find(|r| dst & r.mask == r.network)
            .map(|r| r.next_hop)
    }
}

fn mask_from_prefix(n: u8) -> u32 {
    // A /0 would shift by 32, which u32 does not allow.
    match n {
        0 => 0,
        n => u32::MAX << (32 - n),
    }
}
