//! End-to-end scenarios: client segments enter through SLIP framing and the
//! IPv4 layer, server replies are captured off the serial line.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use etherparse::{Ipv4Header, TcpHeader, TcpHeaderSlice};

use slipstack::ip::{Ipv4Layer, IPPROTO_TCP};
use slipstack::link::{slip, LinkLayer, SerialLine};
use slipstack::sched::TimerQueue;
use slipstack::tcp::{State, TcpConnection, TcpServer, MSS};

const SERVER_ADDR: &str = "10.0.0.2";
const CLIENT_ADDR: &str = "10.0.0.1";
const SERVER_PORT: u16 = 7000;
const CLIENT_PORT: u16 = 40100;

/// In-memory serial line.
#[derive(Default)]
struct TestLine {
    sent: RefCell<Vec<Vec<u8>>>,
    handler: RefCell<Option<Box<dyn FnMut(&[u8])>>>,
}

impl TestLine {
    fn inject(&self, chunk: &[u8]) {
        if let Some(handler) = self.handler.borrow_mut().as_mut() {
            handler(chunk);
        }
    }
}

impl SerialLine for TestLine {
    fn register_receiver(&self, handler: Box<dyn FnMut(&[u8])>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    fn send(&self, chunk: &[u8]) {
        self.sent.borrow_mut().push(chunk.to_vec());
    }
}

/// One parsed segment the server put on the wire.
#[derive(Debug, Clone)]
struct Seg {
    raw: Vec<u8>,
    seq: u32,
    ack: u32,
    syn: bool,
    ack_set: bool,
    fin: bool,
    payload: Vec<u8>,
}

struct Harness {
    line: Rc<TestLine>,
    timers: TimerQueue,
    // Keeps the demux alive; the network layer only holds a weak reference
    // to its registered receiver.
    _server: TcpServer,
    accepted: Rc<RefCell<Vec<TcpConnection>>>,
    delivered: Rc<RefCell<Vec<Vec<u8>>>>,
    read_cursor: RefCell<usize>,
}

impl Harness {
    fn new() -> Self {
        let line = Rc::new(TestLine::default());
        let mut lines: HashMap<Ipv4Addr, Rc<dyn SerialLine>> = HashMap::new();
        lines.insert(CLIENT_ADDR.parse().unwrap(), line.clone() as Rc<dyn SerialLine>);

        let net = Ipv4Layer::new(&LinkLayer::new(lines));
        net.set_host_addr(SERVER_ADDR.parse().unwrap());
        net.set_forwarding_table(&[("10.0.0.0/8", CLIENT_ADDR)])
            .unwrap();

        let timers = TimerQueue::new();
        let server = TcpServer::listen(&net, Rc::new(timers.clone()), SERVER_PORT);

        let accepted = Rc::new(RefCell::new(Vec::new()));
        let delivered = Rc::new(RefCell::new(Vec::new()));

        server.on_connection({
            let accepted = accepted.clone();
            let delivered = delivered.clone();
            move |conn| {
                let delivered = delivered.clone();
                conn.on_data(move |_conn, payload| {
                    delivered.borrow_mut().push(payload.to_vec());
                });
                accepted.borrow_mut().push(conn.clone());
            }
        });

        Harness {
            line,
            timers,
            _server: server,
            accepted,
            delivered,
            read_cursor: RefCell::new(0),
        }
    }

    fn inject(&self, mut tcph: TcpHeader, payload: &[u8]) {
        let src: Ipv4Addr = CLIENT_ADDR.parse().unwrap();
        let dst: Ipv4Addr = SERVER_ADDR.parse().unwrap();

        tcph.checksum = tcph
            .calc_checksum_ipv4_raw(src.octets(), dst.octets(), payload)
            .unwrap();

        let mut segment = Vec::new();
        tcph.write(&mut segment).unwrap();
        segment.extend_from_slice(payload);

        let iph = Ipv4Header::new(
            segment.len() as u16,
            64,
            IPPROTO_TCP,
            src.octets(),
            dst.octets(),
        );
        let mut datagram = Vec::new();
        iph.write(&mut datagram).unwrap();
        datagram.extend_from_slice(&segment);

        self.line.inject(&slip::encode(&datagram));
    }

    fn inject_data(&self, seq: u32, ack: u32, payload: &[u8]) {
        let mut tcph = TcpHeader::new(CLIENT_PORT, SERVER_PORT, seq, 64240);
        tcph.ack = true;
        tcph.acknowledgment_number = ack;
        self.inject(tcph, payload);
    }

    /// Segments the server sent since the last call.
    fn sent(&self) -> Vec<Seg> {
        let chunks = self.line.sent.borrow();

        let mut dec = slip::Decoder::new();
        let mut frames = Vec::new();
        for chunk in chunks.iter() {
            dec.feed(chunk, &mut frames);
        }

        let mut cursor = self.read_cursor.borrow_mut();
        let new = frames.split_off(*cursor);
        *cursor += new.len();

        new.into_iter()
            .map(|datagram| {
                let raw = datagram[20..].to_vec();
                let tcph = TcpHeaderSlice::from_slice(&raw).unwrap();
                Seg {
                    seq: tcph.sequence_number(),
                    ack: tcph.acknowledgment_number(),
                    syn: tcph.syn(),
                    ack_set: tcph.ack(),
                    fin: tcph.fin(),
                    payload: raw[tcph.slice().len()..].to_vec(),
                    raw,
                }
            })
            .collect()
    }

    /// Runs the three-way handshake. Returns the accepted connection and
    /// the server's first data sequence number (iss + 1).
    fn handshake(&self, client_seq: u32) -> (TcpConnection, u32) {
        let mut syn = TcpHeader::new(CLIENT_PORT, SERVER_PORT, client_seq, 64240);
        syn.syn = true;
        self.inject(syn, &[]);

        let replies = self.sent();
        let synack = &replies[0];
        assert!(synack.syn && synack.ack_set);
        assert_eq!(synack.ack, client_seq.wrapping_add(1));

        let iss = synack.seq;

        let mut ack = TcpHeader::new(CLIENT_PORT, SERVER_PORT, client_seq.wrapping_add(1), 64240);
        ack.ack = true;
        ack.acknowledgment_number = iss.wrapping_add(1);
        self.inject(ack, &[]);

        let conn = self.accepted.borrow().last().unwrap().clone();
        (conn, iss.wrapping_add(1))
    }

    fn fire_timers_after(&self, dt: Duration) {
        self.timers.fire_due(Instant::now() + dt);
    }
}

#[test]
fn handshake_reaches_established() {
    let h = Harness::new();

    let mut syn = TcpHeader::new(CLIENT_PORT, SERVER_PORT, 100, 64240);
    syn.syn = true;
    h.inject(syn, &[]);

    // Accept fires on the SYN, before the handshake completes.
    assert_eq!(h.accepted.borrow().len(), 1);
    let conn = h.accepted.borrow()[0].clone();
    assert_eq!(conn.state(), State::SynRcvd);

    let synack = h.sent().remove(0);
    assert!(synack.syn && synack.ack_set);
    assert_eq!(synack.ack, 101);
    let iss = synack.seq;

    // A segment whose ACK does not cover our SYN is ignored in SYN_RCVD:
    // no state change, no delivery, no reply.
    h.inject_data(101, iss.wrapping_add(7), b"too early");
    assert!(h.delivered.borrow().is_empty());
    assert_eq!(conn.state(), State::SynRcvd);
    assert!(h.sent().is_empty());

    let mut ack = TcpHeader::new(CLIENT_PORT, SERVER_PORT, 101, 64240);
    ack.ack = true;
    ack.acknowledgment_number = iss.wrapping_add(1);
    h.inject(ack, &[]);
    assert_eq!(conn.state(), State::Estab);

    // The server's first data byte is numbered iss + 1.
    conn.send(b"hi");
    let data = h.sent();
    let data = data.last().unwrap();
    assert_eq!(data.seq, iss.wrapping_add(1));
    assert_eq!(data.payload, b"hi");
}

#[test]
fn in_order_delivery_with_duplicate_acks() {
    let h = Harness::new();
    let (_conn, _snd) = h.handshake(199); // server expects client seq 200

    // Out of order: dropped, answered with a duplicate ACK at 200.
    h.inject_data(210, 1, &[0xBB; 20]);
    assert!(h.delivered.borrow().is_empty());
    let reply = h.sent().remove(0);
    assert!(reply.ack_set && reply.payload.is_empty());
    assert_eq!(reply.ack, 200);

    // The missing piece arrives: delivered, ACK moves to 210.
    h.inject_data(200, 1, &[0xAA; 10]);
    assert_eq!(*h.delivered.borrow(), vec![vec![0xAA; 10]]);
    assert_eq!(h.sent().remove(0).ack, 210);

    // The formerly out-of-order segment again, now in order.
    h.inject_data(210, 1, &[0xBB; 20]);
    assert_eq!(
        *h.delivered.borrow(),
        vec![vec![0xAA; 10], vec![0xBB; 20]]
    );
    assert_eq!(h.sent().remove(0).ack, 230);

    // A stale duplicate: dropped, duplicate ACK stays at 230.
    h.inject_data(200, 1, &[0xAA; 10]);
    assert_eq!(h.delivered.borrow().len(), 2);
    assert_eq!(h.sent().remove(0).ack, 230);
}

#[test]
fn retransmission_reuses_wire_bytes_and_skips_rtt_sample() {
    let h = Harness::new();
    let (conn, snd) = h.handshake(100);

    conn.send(b"ping");
    let first = h.sent().remove(0);
    assert_eq!(first.payload, b"ping");
    assert_eq!(conn.rto(), 1.0);

    // The retransmission timer fires before any ACK: the exact same bytes
    // go out again.
    h.fire_timers_after(Duration::from_secs(2));
    let second = h.sent().remove(0);
    assert_eq!(second.raw, first.raw);

    // Another timeout retransmits again; the timeout is rearmed each time.
    h.fire_timers_after(Duration::from_secs(4));
    assert_eq!(h.sent().remove(0).raw, first.raw);

    // The ACK finally lands. Karn's rule: no RTT sample from an ambiguous,
    // retransmitted segment, so the estimators are untouched.
    h.inject_data(101, snd.wrapping_add(4), &[]);
    assert_eq!(conn.srtt(), None);
    assert_eq!(conn.rto(), 1.0);

    // Nothing outstanding anymore: a stale timer deadline is a no-op.
    h.fire_timers_after(Duration::from_secs(60));
    assert!(h.sent().is_empty());
}

#[test]
fn clean_ack_feeds_the_rtt_estimator() {
    let h = Harness::new();
    let (conn, snd) = h.handshake(100);

    conn.send(b"measured");
    h.sent();

    h.inject_data(101, snd.wrapping_add(8), &[]);

    assert!(conn.srtt().is_some());
    // The near-zero sample drives the timeout into its lower clamp.
    assert_eq!(conn.rto(), 0.1);
}

#[test]
fn stop_and_wait_respects_mss_and_single_outstanding() {
    let h = Harness::new();
    let (conn, snd) = h.handshake(100);

    let data = vec![0x42u8; MSS + 10];
    conn.send(&data);

    // Only the head chunk goes out, capped at MSS.
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq, snd);
    assert_eq!(sent[0].payload.len(), MSS);

    // More application data queues behind the outstanding segment.
    conn.send(b"tail");
    assert!(h.sent().is_empty());

    // The ACK releases the next chunk, and only the next chunk.
    h.inject_data(101, snd.wrapping_add(MSS as u32), &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq, snd.wrapping_add(MSS as u32));
    assert_eq!(sent[0].payload, vec![0x42u8; 10]);

    h.inject_data(101, snd.wrapping_add(MSS as u32 + 10), &[]);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, b"tail");
}

#[test]
fn fin_delivers_eof_and_acknowledges() {
    let h = Harness::new();
    let (conn, _snd) = h.handshake(199);

    // Some data first so rcv_nxt has moved.
    h.inject_data(200, 1, b"bye soon");
    assert_eq!(h.sent().remove(0).ack, 208);

    let mut fin = TcpHeader::new(CLIENT_PORT, SERVER_PORT, 208, 64240);
    fin.fin = true;
    fin.ack = true;
    h.inject(fin, &[]);

    // EOF is an empty payload delivery; the FIN consumes one sequence
    // number.
    assert_eq!(h.delivered.borrow().last().unwrap(), &Vec::<u8>::new());
    assert_eq!(conn.state(), State::Closed);
    let reply = h.sent().remove(0);
    assert!(reply.ack_set && !reply.fin);
    assert_eq!(reply.ack, 209);
}

#[test]
fn local_close_sends_fin() {
    let h = Harness::new();
    let (conn, snd) = h.handshake(100);

    conn.close();

    let fin = h.sent().remove(0);
    assert!(fin.fin && fin.ack_set);
    // The FIN consumes a sequence number, counted before sending.
    assert_eq!(fin.seq, snd.wrapping_add(1));
}

#[test]
fn two_connections_are_demultiplexed_independently() {
    let h = Harness::new();

    let (conn_a, _) = h.handshake(100);

    // A second client port, its own handshake.
    let mut syn = TcpHeader::new(CLIENT_PORT + 1, SERVER_PORT, 500, 64240);
    syn.syn = true;
    h.inject(syn, &[]);
    let synack = h.sent().remove(0);
    assert_eq!(synack.ack, 501);
    let iss_b = synack.seq;

    let mut ack = TcpHeader::new(CLIENT_PORT + 1, SERVER_PORT, 501, 64240);
    ack.ack = true;
    ack.acknowledgment_number = iss_b.wrapping_add(1);
    h.inject(ack, &[]);

    let conn_b = h.accepted.borrow().last().unwrap().clone();
    assert_eq!(conn_b.state(), State::Estab);
    assert_eq!(conn_a.state(), State::Estab);

    // Data on connection B does not disturb A's sequence numbers.
    let mut data = TcpHeader::new(CLIENT_PORT + 1, SERVER_PORT, 501, 64240);
    data.ack = true;
    data.acknowledgment_number = iss_b.wrapping_add(1);
    h.inject(data, b"for b");

    assert_eq!(*h.delivered.borrow(), vec![b"for b".to_vec()]);
    assert_eq!(h.sent().remove(0).ack, 506);
}
