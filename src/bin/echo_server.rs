use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use slipstack::ip::Ipv4Layer;
use slipstack::link::{LinkLayer, SerialLine};
use slipstack::phys::{serve, PtyLine};
use slipstack::sched::TimerQueue;
use slipstack::tcp::TcpServer;

/// Echo server over a single SLIP serial line.
///
/// Usage: echo_server [host-addr] [peer-addr] [port]
///
/// Prints the pty slave path; attach the peer end of the link to it.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let host: Ipv4Addr = args.next().as_deref().unwrap_or("192.168.123.2").parse()?;
    let peer: Ipv4Addr = args.next().as_deref().unwrap_or("192.168.123.1").parse()?;
    let port: u16 = args.next().as_deref().unwrap_or("7000").parse()?;

    let line = Rc::new(PtyLine::open()?);

    println!(">>> Serial line: {}", line.path().display());
    println!(">>> Listening on {host}:{port}");

    let mut lines: HashMap<Ipv4Addr, Rc<dyn SerialLine>> = HashMap::new();
    lines.insert(peer, line.clone());

    let net = Ipv4Layer::new(&LinkLayer::new(lines));
    net.set_host_addr(host);

    let peer_route = peer.to_string();
    net.set_forwarding_table(&[("0.0.0.0/0", peer_route.as_str())])?;

    let timers = TimerQueue::new();
    let server = TcpServer::listen(&net, Rc::new(timers.clone()), port);

    server.on_connection(|conn| {
        let remote = conn.quad().remote;
        println!(">>> Connection accepted from {}:{}", remote.addr, remote.port);

        conn.on_data(move |conn, payload| {
            if payload.is_empty() {
                println!(">>> {}:{} closed", remote.addr, remote.port);
                conn.close();
            } else {
                conn.send(payload);
            }
        });
    });

    serve(&[line], &timers)?;

    Ok(())
}
