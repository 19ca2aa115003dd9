use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::ip::Ipv4Layer;
use crate::sched::{Scheduler, TimerHandle};

use super::rtt::RttEstimator;
use super::wire::{self, Flags, MSS};
use super::{wrapping_lt, Quad};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    SynRcvd,
    Estab,
    Closed,
}

/// The single in-flight data segment. Retransmissions resend `wire`
/// verbatim; `measurable` enforces Karn's rule by going false on the first
/// retransmission.
struct Outstanding {
    wire: Vec<u8>,
    sent_at: Instant,
    measurable: bool,
}

/// What a processed segment asks the application layer to observe. Handed
/// back out of the state machine so callbacks run only after every internal
/// borrow is released.
enum Event {
    Data(Vec<u8>),
    PeerClosed,
}

type DataHandler = Rc<dyn Fn(&TcpConnection, &[u8])>;

/// A server-side TCP connection.
///
/// Cheaply cloneable handle; the server's demux table and the application
/// share the same underlying state. Reliable sending is stop-and-wait: one
/// outstanding segment, retransmitted on an adaptive RFC 6298 timeout.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Rc<RefCell<ConnInner>>,
}

struct ConnInner {
    self_weak: Weak<RefCell<ConnInner>>,
    ip: Ipv4Layer,
    sched: Rc<dyn Scheduler>,
    quad: Quad,

    state: State,
    /// Next sequence number assigned to an outbound byte.
    snd_nxt: u32,
    /// Next sequence number expected from the remote side.
    rcv_nxt: u32,

    send_queue: VecDeque<Vec<u8>>,
    outstanding: Option<Outstanding>,
    rtt: RttEstimator,
    retx_timer: Option<TimerHandle>,

    handler: Option<DataHandler>,
}

impl TcpConnection {
    /// Creates the connection for a just-received SYN and answers it with
    /// SYN+ACK. The connection starts in `SynRcvd` with a random initial
    /// send sequence number.
    pub(crate) fn accept(
        ip: &Ipv4Layer,
        sched: Rc<dyn Scheduler>,
        quad: Quad,
        client_seq: u32,
    ) -> Self {
        let iss = rand::random::<u32>();

        let inner = Rc::new_cyclic(|weak| {
            RefCell::new(ConnInner {
                self_weak: weak.clone(),
                ip: ip.clone(),
                sched,
                quad,
                state: State::SynRcvd,
                snd_nxt: iss,
                rcv_nxt: client_seq.wrapping_add(1),
                send_queue: VecDeque::new(),
                outstanding: None,
                rtt: RttEstimator::new(),
                retx_timer: None,
                handler: None,
            })
        });

        inner.borrow().send_segment(Flags::SYN_ACK, &[]);

        TcpConnection { inner }
    }

    /// Registers the application receiver. It is called with each in-order
    /// payload; an empty payload signals that the peer closed.
    pub fn on_data(&self, handler: impl Fn(&TcpConnection, &[u8]) + 'static) {
        self.inner.borrow_mut().handler = Some(Rc::new(handler));
    }

    /// Queues `data` for reliable transmission, split into segments of at
    /// most [`MSS`] bytes. Sending nothing is a no-op.
    pub fn send(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut inner = self.inner.borrow_mut();
        for chunk in data.chunks(MSS) {
            inner.send_queue.push_back(chunk.to_vec());
        }
        inner.try_send_next();
    }

    /// Initiates local close by sending FIN. The FIN consumes one sequence
    /// number.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.snd_nxt = inner.snd_nxt.wrapping_add(1);
        inner.send_segment(Flags::FIN_ACK, &[]);
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn quad(&self) -> Quad {
        self.inner.borrow().quad
    }

    /// Current retransmission timeout in seconds.
    pub fn rto(&self) -> f64 {
        self.inner.borrow().rtt.rto()
    }

    /// Smoothed round-trip estimate in seconds, once a sample exists.
    pub fn srtt(&self) -> Option<f64> {
        self.inner.borrow().rtt.srtt()
    }

    /// Demux entry point: one parsed inbound segment for this connection.
    pub(crate) fn on_segment(
        &self,
        seq: u32,
        ack: u32,
        ack_set: bool,
        fin_set: bool,
        payload: &[u8],
    ) {
        let events = self
            .inner
            .borrow_mut()
            .handle_segment(seq, ack, ack_set, fin_set, payload);

        if events.is_empty() {
            return;
        }

        // The borrow is released; the application may call send() or
        // close() on this very connection from inside its callback.
        let handler = self.inner.borrow().handler.clone();
        let Some(handler) = handler else { return };

        for event in events {
            match event {
                Event::Data(payload) => handler(self, &payload),
                Event::PeerClosed => handler(self, &[]),
            }
        }
    }
}

impl ConnInner {
    fn handle_segment(
        &mut self,
        seq: u32,
        ack: u32,
        ack_set: bool,
        fin_set: bool,
        payload: &[u8],
    ) -> Vec<Event> {
        let mut events = Vec::new();

        // FIN wins over everything else, whatever the state. The FIN
        // consumes one sequence number and the application learns about the
        // close through an empty payload.
        if fin_set {
            events.push(Event::PeerClosed);
            self.state = State::Closed;
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.send_segment(Flags::ACK, &[]);
            return events;
        }

        match self.state {
            State::SynRcvd => {
                // Only the ACK that completes the handshake matters here;
                // it acknowledges our SYN, so our first data byte is iss+1.
                if ack_set && ack == self.snd_nxt.wrapping_add(1) {
                    self.state = State::Estab;
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                }
            }
            State::Estab => {
                if ack_set {
                    if !payload.is_empty() {
                        if seq == self.rcv_nxt {
                            events.push(Event::Data(payload.to_vec()));
                            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
                        }
                        // In order or not, answer with the current rcv_nxt.
                        // For out-of-order and duplicate segments this is
                        // the duplicate ACK that tells the peer what we are
                        // still expecting.
                        self.send_segment(Flags::ACK, &[]);
                    }

                    if self.outstanding.is_some() && wrapping_lt(self.snd_nxt, ack) {
                        self.on_ack_progress(ack);
                    }
                }
            }
            State::Closed => {}
        }

        events
    }

    /// The peer acknowledged the outstanding segment.
    fn on_ack_progress(&mut self, ack: u32) {
        let outstanding = self.outstanding.take().unwrap();

        /*
                    RFC 6298 - S3. Taking RTT Samples

            TCP MUST use Karn's algorithm [KP87] for taking RTT samples.
            That is, RTT samples MUST NOT be made using segments that were
            retransmitted (and thus for which it is ambiguous whether the
            reply was for the first instance of the packet or a later
            instance).
        */
        if outstanding.measurable {
            self.rtt
                .on_sample(outstanding.sent_at.elapsed().as_secs_f64());
        }

        self.snd_nxt = ack;

        if let Some(timer) = self.retx_timer.take() {
            timer.cancel();
        }

        self.try_send_next();
    }

    /// Transmits the head of the send queue if nothing is in flight.
    fn try_send_next(&mut self) {
        if self.outstanding.is_some() {
            return;
        }
        let Some(chunk) = self.send_queue.pop_front() else {
            return;
        };

        let wire = self.send_segment(Flags::ACK, &chunk);
        self.outstanding = Some(Outstanding {
            wire,
            sent_at: Instant::now(),
            measurable: true,
        });

        self.arm_retx_timer();
    }

    fn on_retx_timer(&mut self) {
        self.retx_timer = None;

        // A stale timer with nothing in flight is a no-op.
        let Some(outstanding) = self.outstanding.as_mut() else {
            return;
        };

        // Resend the stored bytes verbatim, same sequence number. The
        // retransmission makes any later ACK ambiguous, so the segment is
        // no longer eligible for RTT measurement.
        outstanding.measurable = false;
        let wire = outstanding.wire.clone();

        log::debug!(
            "tcp: retransmitting towards {}:{}",
            self.quad.remote.addr,
            self.quad.remote.port
        );
        if let Err(err) = self.ip.send(&wire, self.quad.remote.addr) {
            log::warn!("tcp: retransmit towards {} failed: {err}", self.quad.remote.addr);
        }

        self.arm_retx_timer();
    }

    fn arm_retx_timer(&mut self) {
        let weak = self.self_weak.clone();
        let handle = self.sched.call_later(
            Duration::from_secs_f64(self.rtt.rto()),
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.borrow_mut().on_retx_timer();
                }
            }),
        );

        self.retx_timer = Some(handle);
    }

    /// Builds a segment at the current `snd_nxt`/`rcv_nxt`, sends it via
    /// the network layer and returns the wire bytes for retransmission
    /// bookkeeping.
    fn send_segment(&self, flags: Flags, payload: &[u8]) -> Vec<u8> {
        let segment = wire::build_segment(&self.quad, self.snd_nxt, self.rcv_nxt, flags, payload);

        if let Err(err) = self.ip.send(&segment, self.quad.remote.addr) {
            log::warn!("tcp: send towards {} failed: {err}", self.quad.remote.addr);
        }

        segment
    }
}
