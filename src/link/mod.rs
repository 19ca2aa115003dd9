use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::Error;

pub mod slip;

/// A raw byte-stream device, e.g. a serial line. The layer below SLIP.
///
/// Receive hands over arbitrary byte chunks; framing is entirely the link
/// layer's problem. `send` looks synchronous but implementations are free
/// to buffer.
pub trait SerialLine {
    fn register_receiver(&self, handler: Box<dyn FnMut(&[u8])>);
    fn send(&self, chunk: &[u8]);
}

type DatagramHandler = Box<dyn Fn(&[u8])>;

struct Link {
    line: Rc<dyn SerialLine>,
}

impl Link {
    fn new(line: Rc<dyn SerialLine>, handler: Rc<RefCell<Option<DatagramHandler>>>) -> Self {
        let mut decoder = slip::Decoder::new();
        let mut frames = Vec::new();

        line.register_receiver(Box::new(move |chunk| {
            decoder.feed(chunk, &mut frames);
            for frame in frames.drain(..) {
                if let Some(handler) = handler.borrow().as_ref() {
                    // A panicking receiver loses its frame, not the link:
                    // the decoder state is already reset and the event loop
                    // keeps serving the remaining frames and lines.
                    let delivery = panic::catch_unwind(AssertUnwindSafe(|| handler(&frame)));
                    if delivery.is_err() {
                        log::error!("link: receiver panicked on a frame, dropping it");
                    }
                }
            }
        }));

        Link { line }
    }

    fn send(&self, datagram: &[u8]) {
        self.line.send(&slip::encode(datagram));
    }
}

/// Aggregates one SLIP link per directly connected peer.
///
/// Outbound datagrams are dispatched by next-hop address; inbound frames
/// from every link funnel into a single registered receiver, with no source
/// annotation (the network layer reads the source off the datagram itself).
#[derive(Clone)]
pub struct LinkLayer {
    inner: Rc<LinkInner>,
}

struct LinkInner {
    links: HashMap<Ipv4Addr, Link>,
    handler: Rc<RefCell<Option<DatagramHandler>>>,
}

impl LinkLayer {
    /// Builds the link layer over `lines`, a map from the IPv4 address of
    /// the host or router at the far end of each serial line to the line
    /// itself. The peer set is fixed for the lifetime of the layer.
    pub fn new(lines: HashMap<Ipv4Addr, Rc<dyn SerialLine>>) -> Self {
        let handler = Rc::new(RefCell::new(None));

        let links = lines
            .into_iter()
            .map(|(peer, line)| (peer, Link::new(line, handler.clone())))
            .collect();

        LinkLayer {
            inner: Rc::new(LinkInner { links, handler }),
        }
    }

    /// Registers the function called with each datagram decoded from any
    /// of the underlying lines. Replaces any previous receiver.
    pub fn register_receiver(&self, handler: impl Fn(&[u8]) + 'static) {
        *self.inner.handler.borrow_mut() = Some(Box::new(handler));
    }

    /// SLIP-encodes `datagram` and writes it on the line that reaches
    /// `next_hop`. Asking for a peer without a line is a caller bug and
    /// fails with [`Error::UnknownNextHop`].
    pub fn send(&self, datagram: &[u8], next_hop: Ipv4Addr) -> Result<(), Error> {
        let link = self
            .inner
            .links
            .get(&next_hop)
            .ok_or(Error::UnknownNextHop(next_hop))?;

        link.send(datagram);

        Ok(())
    }
}
