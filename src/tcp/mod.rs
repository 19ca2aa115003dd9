use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use etherparse::TcpHeaderSlice;

use crate::ip::Ipv4Layer;
use crate::sched::Scheduler;

mod conn;
mod rtt;
mod wire;

pub use conn::{State, TcpConnection};
pub use rtt::RttEstimator;
pub use wire::MSS;

/// One endpoint of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Connection identifier: the remote and local endpoint pair. Unique
/// across the server's live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub remote: Dual,
    pub local: Dual,
}

type AcceptHandler = Box<dyn Fn(&TcpConnection)>;

/// Passive-open TCP endpoint bound to one port.
///
/// Registers itself as the network layer's transport receiver and
/// demultiplexes inbound segments to per-connection state machines keyed by
/// [`Quad`].
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    ip: Ipv4Layer,
    sched: Rc<dyn Scheduler>,
    port: u16,
    connections: RefCell<HashMap<Quad, TcpConnection>>,
    accept: RefCell<Option<AcceptHandler>>,
}

impl TcpServer {
    pub fn listen(ip: &Ipv4Layer, sched: Rc<dyn Scheduler>, port: u16) -> Self {
        let inner = Rc::new(ServerInner {
            ip: ip.clone(),
            sched,
            port,
            connections: RefCell::new(HashMap::new()),
            accept: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        ip.register_receiver(move |src, dst, segment| {
            if let Some(inner) = weak.upgrade() {
                inner.on_segment(src, dst, segment);
            }
        });

        TcpServer { inner }
    }

    /// Registers the accept callback, invoked for every new connection as
    /// soon as its SYN arrives (before the handshake completes).
    pub fn on_connection(&self, handler: impl Fn(&TcpConnection) + 'static) {
        *self.inner.accept.borrow_mut() = Some(Box::new(handler));
    }
}

impl ServerInner {
    fn on_segment(&self, src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) {
        let tcph = match TcpHeaderSlice::from_slice(segment) {
            Ok(tcph) => tcph,
            Err(err) => {
                log::debug!("tcp: dropping malformed segment: {err}");
                return;
            }
        };

        if tcph.destination_port() != self.port {
            return;
        }

        // The data offset field points past the header and its options.
        let payload = &segment[tcph.slice().len()..];

        if !self.ip.ignore_checksum() && !wire::verify_checksum(&tcph, src, dst, payload) {
            log::warn!(
                "tcp: discarding segment with bad checksum from {}:{}",
                src,
                tcph.source_port()
            );
            return;
        }

        let quad = Quad {
            remote: Dual {
                addr: src,
                port: tcph.source_port(),
            },
            local: Dual {
                addr: dst,
                port: tcph.destination_port(),
            },
        };

        if tcph.syn() {
            // A SYN always starts a fresh connection; a connection already
            // registered under the quad is replaced.
            let conn =
                TcpConnection::accept(&self.ip, self.sched.clone(), quad, tcph.sequence_number());
            self.connections.borrow_mut().insert(quad, conn.clone());

            if let Some(accept) = self.accept.borrow().as_ref() {
                accept(&conn);
            }
            return;
        }

        // Clone the handle out so the table borrow is gone before the
        // connection (and possibly the application) runs.
        let conn = self.connections.borrow().get(&quad).cloned();
        match conn {
            Some(conn) => conn.on_segment(
                tcph.sequence_number(),
                tcph.acknowledgment_number(),
                tcph.ack(),
                tcph.fin(),
                payload,
            ),
            None => log::debug!(
                "tcp: {}:{} -> {}:{} segment for unknown connection",
                src,
                tcph.source_port(),
                dst,
                tcph.destination_port()
            ),
        }
    }
}

/*
                RFC 9293 - S3.4. Sequence Numbers

    TCP determines if a data segment is "old" or "new" by testing whether
    its sequence number is within 2**31 bytes of the left edge of the
    window, and if it is not, discarding the data as "old".
*/
pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}
