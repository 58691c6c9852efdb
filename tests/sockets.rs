use portos::{Backlog, Family, Interest, Pollset, Protocol, Socket, Which};

fn listener() -> (Socket, u16) {
    let server = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
    server.bind("127.0.0.1", 0).unwrap();
    server.listen(Backlog::Max).unwrap();
    let (_, port) = server.addr_get(Which::Local).unwrap();
    (server, port)
}

#[test]
fn request_response_over_loopback() {
    let (server, port) = listener();
    let client = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let peer = server.accept().unwrap();

    client.write(&[b"GET thing\n"]).unwrap();
    assert_eq!(peer.read_line().unwrap().unwrap(), b"GET thing");
    peer.write(&[b"thing: 42\n"]).unwrap();
    assert_eq!(client.read_line().unwrap().unwrap(), b"thing: 42");

    peer.shutdown(portos::ShutdownMode::Write).unwrap();
    assert_eq!(client.read_line().unwrap(), None);
}

#[test]
fn lines_iterator_drains_the_peer() {
    let (server, port) = listener();
    let client = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let peer = server.accept().unwrap();

    client.write(&[b"one\ntwo\nthree\n"]).unwrap();
    client.close().unwrap();
    let lines: Vec<Vec<u8>> = peer.lines().map(|l| l.unwrap()).collect();
    assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

#[test]
fn pollset_reports_write_readiness_before_data_arrives() {
    let (server, port) = listener();
    let client = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let accepted = server.accept().unwrap();

    let set = Pollset::new(2).unwrap();
    set.add(&accepted, Interest::INPUT).unwrap();
    set.add(&client, Interest::OUTPUT).unwrap();

    // Until the client writes, only write readiness is reported.
    let (readable, writable) = set.poll(1_000_000).unwrap();
    assert!(readable.is_empty());
    assert_eq!(writable.len(), 1);

    client.write(&[b"data\n"]).unwrap();
    let (readable, _) = set.poll(1_000_000).unwrap();
    assert_eq!(readable.len(), 1);
    assert_eq!(readable[0].addr_get(Which::Local).unwrap().1, port);
}

#[test]
fn pollset_pins_registered_sockets() {
    let (server, port) = listener();
    let client = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
    client.connect("127.0.0.1", port).unwrap();
    let set = Pollset::new(1).unwrap();
    {
        let accepted = server.accept().unwrap();
        set.add(&accepted, Interest::INPUT).unwrap();
        // The runtime drops its reference here; the set keeps the socket.
    }
    client.write(&[b"ping\n"]).unwrap();
    let (readable, _) = set.poll(1_000_000).unwrap();
    assert_eq!(readable.len(), 1);
    assert_eq!(readable[0].read_line().unwrap().unwrap(), b"ping");
    set.destroy();
}

#[test]
fn udp_round_trip() {
    let receiver = Socket::create(Protocol::Udp, Family::Inet).unwrap();
    receiver.bind("127.0.0.1", 0).unwrap();
    let (_, port) = receiver.addr_get(Which::Local).unwrap();

    let sender = Socket::create(Protocol::Udp, Family::Inet).unwrap();
    sender.connect("127.0.0.1", port).unwrap();
    sender.write(&[b"datagram"]).unwrap();
    // A count read blocks until that many bytes arrive, so ask for exactly
    // the datagram's length.
    assert_eq!(receiver.read_count(8).unwrap().unwrap(), b"datagram");
}

#[test]
fn addresses_have_expected_shape() {
    let (server, port) = listener();
    let (host, reported) = server.addr_get(Which::Local).unwrap();
    assert_eq!(host, "127.0.0.1");
    assert_eq!(reported, port);
}
