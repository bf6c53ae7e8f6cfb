//! Socket-level behavior of the reliable channel, driven over real loopback
//! connections. The raw-peer tests speak the wire format by hand to inject
//! corruption and negative acknowledgements.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::Duration,
};

use comms::{
    frame::{self, ACK, DIGEST_SIZE, NAK, TERMINATOR},
    rendezvous, Acceptor, ChannelConfig, CommsErr, ReliableChannel,
};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn frame_len(payload: &[u8]) -> usize {
    DIGEST_SIZE + payload.len() + TERMINATOR.len()
}

fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn read_token(stream: &mut TcpStream) -> [u8; 3] {
    let mut token = [0u8; 3];
    stream.read_exact(&mut token).unwrap();
    token
}

#[test]
fn payload_roundtrips_bit_for_bit() {
    let acceptor = Acceptor::bind(loopback(), ChannelConfig::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut channel = ReliableChannel::connect(addr, ChannelConfig::default()).unwrap();
        channel.send(b"activation \x00\xff bytes").unwrap();
        channel.receive().unwrap()
    });

    let mut server = acceptor.accept().unwrap();
    let request = server.receive().unwrap();
    assert_eq!(request, b"activation \x00\xff bytes");
    server.send(b"reply \x00\x01\x02").unwrap();

    let reply = client.join().unwrap();
    assert_eq!(reply, b"reply \x00\x01\x02");
}

#[test]
fn corrupted_frame_is_nacked_then_accepted_on_resend() {
    let payload = b"gradient bytes";
    let acceptor = Acceptor::bind(loopback(), ChannelConfig::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let raw_peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();

        let mut corrupted = frame::encode(payload);
        corrupted[DIGEST_SIZE] ^= 0x01;
        stream.write_all(&corrupted).unwrap();
        let first = read_token(&mut stream);

        stream.write_all(&frame::encode(payload)).unwrap();
        let second = read_token(&mut stream);

        (first, second)
    });

    let mut server = acceptor.accept().unwrap();
    let received = server.receive().unwrap();
    assert_eq!(received, payload);
    assert_eq!(server.metrics().nacks_sent, 1);

    let (first, second) = raw_peer.join().unwrap();
    assert_eq!(first, *NAK);
    assert_eq!(second, *ACK);
}

#[test]
fn send_exhausts_after_exactly_the_ceiling_and_keeps_the_connection() {
    const CEILING: usize = 5;

    let payload = b"stubborn";
    let cfg = ChannelConfig {
        retry_limit: CEILING,
        ..ChannelConfig::default()
    };

    let acceptor = Acceptor::bind(loopback(), cfg.clone()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let raw_peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let len = frame_len(payload);

        let mut frames = 0;
        for _ in 0..CEILING {
            read_exactly(&mut stream, len);
            frames += 1;
            stream.write_all(NAK).unwrap();
        }

        // The channel must still be usable after exhaustion.
        read_exactly(&mut stream, len);
        frames += 1;
        stream.write_all(ACK).unwrap();

        frames
    });

    let mut server = acceptor.accept().unwrap();

    match server.send(payload) {
        Err(CommsErr::SendExhausted { attempts }) => assert_eq!(attempts, CEILING),
        other => panic!("expected SendExhausted, got {other:?}"),
    }

    server.send(payload).unwrap();

    let frames = raw_peer.join().unwrap();
    assert_eq!(frames, CEILING + 1);
    assert_eq!(server.metrics().frames_sent, (CEILING + 1) as u64);
}

#[test]
fn empty_payload_surfaces_the_shutdown_sentinel() {
    let acceptor = Acceptor::bind(loopback(), ChannelConfig::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut channel = ReliableChannel::connect(addr, ChannelConfig::default()).unwrap();
        channel.send(&[])
    });

    let mut server = acceptor.accept().unwrap();
    assert!(matches!(server.receive(), Err(CommsErr::EmptyPayload)));

    // The sentinel itself is acknowledged like any valid frame.
    client.join().unwrap().unwrap();
}

#[test]
fn receive_timeout_reconnects_to_a_fresh_peer() {
    let payload = b"after the reconnect";
    let cfg = ChannelConfig {
        recv_timeout: Duration::from_millis(200),
        reconnect_pause: Duration::from_millis(50),
        ..ChannelConfig::default()
    };

    let acceptor = Acceptor::bind(loopback(), cfg).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut channel = acceptor.accept().unwrap();
        let received = channel.receive().unwrap();
        (received, channel.metrics().reconnects)
    });

    // First peer connects and goes silent; the server must give up on it.
    let silent = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(500));

    // Second peer speaks properly over a fresh connection.
    let mut fresh = TcpStream::connect(addr).unwrap();
    fresh.write_all(&frame::encode(payload)).unwrap();
    assert_eq!(read_token(&mut fresh), *ACK);

    let (received, reconnects) = server.join().unwrap();
    assert_eq!(received, payload);
    assert!(reconnects >= 1);

    drop(silent);
}

#[test]
fn relay_pairs_requests_with_replies_in_order() {
    const ROUNDS: usize = 3;

    let acceptor = Acceptor::bind(loopback(), ChannelConfig::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut channel = acceptor.accept().unwrap();
        let (net, compute) = rendezvous::pair::<Vec<u8>>();

        let echo = thread::spawn(move || {
            while let Ok(mut payload) = compute.take() {
                payload.reverse();
                if compute.reply(payload).is_err() {
                    break;
                }
            }
        });

        let result = comms::relay(&mut channel, net);
        echo.join().unwrap();
        result
    });

    let mut client = ReliableChannel::connect(addr, ChannelConfig::default()).unwrap();

    for round in 0..ROUNDS {
        let request = format!("step {round}").into_bytes();
        let mut expected = request.clone();
        expected.reverse();

        client.send(&request).unwrap();
        assert_eq!(client.receive().unwrap(), expected);
    }

    // The empty payload ends the relay cleanly.
    client.send(&[]).unwrap();
    server.join().unwrap().unwrap();
}
