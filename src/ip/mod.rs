use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};

use crate::link::LinkLayer;
use crate::Error;

pub mod checksum;
pub mod route;

use route::ForwardingTable;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;

const DEFAULT_TTL: u8 = 64;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_QUOTE_LEN: usize = 28;

type SegmentHandler = Box<dyn Fn(Ipv4Addr, Ipv4Addr, &[u8])>;

/// The IPv4 layer, acting as host and router at once.
///
/// Datagrams addressed to the configured host address are delivered to the
/// registered transport receiver; everything else is routed by longest
/// prefix match and forwarded with the TTL decremented, or answered with an
/// ICMP Time-Exceeded when the TTL runs out.
#[derive(Clone)]
pub struct Ipv4Layer {
    inner: Rc<IpInner>,
}

struct IpInner {
    link: LinkLayer,
    addr: Cell<Option<Ipv4Addr>>,
    table: RefCell<ForwardingTable>,
    handler: RefCell<Option<SegmentHandler>>,
    ignore_checksum: Cell<bool>,
}

impl Ipv4Layer {
    pub fn new(link: &LinkLayer) -> Self {
        let inner = Rc::new(IpInner {
            link: link.clone(),
            addr: Cell::new(None),
            table: RefCell::new(ForwardingTable::default()),
            handler: RefCell::new(None),
            ignore_checksum: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        link.register_receiver(move |datagram| {
            if let Some(inner) = weak.upgrade() {
                inner.recv(datagram);
            }
        });

        Ipv4Layer { inner }
    }

    /// Sets this node's own address. Datagrams destined to it are delivered
    /// locally; without an address the node acts purely as a router.
    pub fn set_host_addr(&self, addr: Ipv4Addr) {
        self.inner.addr.set(Some(addr));
    }

    pub fn host_addr(&self) -> Option<Ipv4Addr> {
        self.inner.addr.get()
    }

    /// Replaces the forwarding table with `(cidr, next_hop)` entries, e.g.
    /// `("10.0.0.0/8", "10.0.0.1")`.
    pub fn set_forwarding_table(&self, entries: &[(&str, &str)]) -> Result<(), Error> {
        *self.inner.table.borrow_mut() = ForwardingTable::from_entries(entries)?;
        Ok(())
    }

    /// Disables checksum verification on inbound traffic, both the IPv4
    /// header checksum here and the TCP checksum in the transport layer.
    pub fn set_ignore_checksum(&self, ignore: bool) {
        self.inner.ignore_checksum.set(ignore);
    }

    pub fn ignore_checksum(&self) -> bool {
        self.inner.ignore_checksum.get()
    }

    /// Registers the transport receiver, called with `(src, dst, payload)`
    /// for every locally delivered TCP datagram.
    pub fn register_receiver(&self, handler: impl Fn(Ipv4Addr, Ipv4Addr, &[u8]) + 'static) {
        *self.inner.handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Wraps a transport segment in a fresh IPv4 header (TTL 64, protocol
    /// TCP) and sends it towards `dst` via the forwarding table. The
    /// transport checksum is assumed to be already in place.
    pub fn send(&self, segment: &[u8], dst: Ipv4Addr) -> Result<(), Error> {
        let next_hop = self
            .inner
            .table
            .borrow()
            .next_hop(dst)
            .ok_or(Error::NoRoute(dst))?;

        let src = self.inner.addr.get().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let header = Ipv4Header::new(
            segment.len() as u16,
            DEFAULT_TTL,
            IPPROTO_TCP,
            src.octets(),
            dst.octets(),
        );

        let mut datagram = Vec::with_capacity(20 + segment.len());
        header.write(&mut datagram).unwrap();
        datagram.extend_from_slice(segment);

        self.inner.link.send(&datagram, next_hop)
    }
}

impl IpInner {
    fn recv(&self, datagram: &[u8]) {
        let ip4h = match Ipv4HeaderSlice::from_slice(datagram) {
            Ok(ip4h) => ip4h,
            Err(err) => {
                log::debug!("ip: dropping malformed datagram: {err}");
                return;
            }
        };

        // Options are not accepted: a fixed 20 byte header only.
        if ip4h.ihl() != 5 {
            log::debug!("ip: dropping datagram with options (ihl {})", ip4h.ihl());
            return;
        }

        if !self.ignore_checksum.get() && checksum::checksum(&datagram[..20]) != 0 {
            log::debug!("ip: dropping datagram with bad header checksum");
            return;
        }

        let src = ip4h.source_addr();
        let dst = ip4h.destination_addr();

        if Some(dst) == self.addr.get() {
            // Host: hand the payload to the transport layer. Only TCP is
            // wired up.
            if ip4h.protocol() == IPPROTO_TCP {
                if let Some(handler) = self.handler.borrow().as_ref() {
                    handler(src, dst, &datagram[20..]);
                }
            }
            return;
        }

        // Router.
        let Some(next_hop) = self.table.borrow().next_hop(dst) else {
            log::debug!("ip: no route towards {dst}, dropping");
            return;
        };

        if ip4h.ttl() <= 1 {
            self.send_time_exceeded(datagram, src);
        } else {
            self.forward(datagram, next_hop);
        }
    }

    /// Forwards `datagram` unchanged except for the decremented TTL and the
    /// recomputed header checksum.
    fn forward(&self, datagram: &[u8], next_hop: Ipv4Addr) {
        let mut out = datagram.to_vec();
        out[8] -= 1;
        checksum::fix_ipv4_header(&mut out);

        if let Err(err) = self.link.send(&out, next_hop) {
            log::debug!("ip: forward failed: {err}");
        }
    }

    /// Answers an expired datagram with ICMP Time-Exceeded: type 11, code
    /// 0, four zero bytes, then the first 28 bytes of the offender. The
    /// reply is routed by its own destination through the forwarding table,
    /// not reflected out the ingress link.
    fn send_time_exceeded(&self, offender: &[u8], offender_src: Ipv4Addr) {
        let mut msg = vec![ICMP_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&offender[..offender.len().min(ICMP_QUOTE_LEN)]);

        let sum = checksum::checksum(&msg);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());

        let src = self.addr.get().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let header = Ipv4Header::new(
            msg.len() as u16,
            DEFAULT_TTL,
            IPPROTO_ICMP,
            src.octets(),
            offender_src.octets(),
        );

        let mut datagram = Vec::with_capacity(20 + msg.len());
        header.write(&mut datagram).unwrap();
        datagram.extend_from_slice(&msg);

        let Some(next_hop) = self.table.borrow().next_hop(offender_src) else {
            log::debug!("ip: no route for time-exceeded towards {offender_src}, dropping");
            return;
        };

        if let Err(err) = self.link.send(&datagram, next_hop) {
            log::debug!("ip: time-exceeded send failed: {err}");
        }
    }
}
