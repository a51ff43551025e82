//! Integration tests: the event loop exercised through real UDP sockets.
//!
//! Each test starts an event loop, drives it from the outside (std UDP
//! sockets as peers, channel-backed writers as sinks), and verifies port
//! lifecycle, datagram delivery, and resolution behavior.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use packetline::{
    Config, Datagram, DatagramWriter, EndpointUri, EventLoop, UdpReceiverConfig, UdpSenderConfig,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Writer that forwards every delivered datagram into a channel.
struct ChannelWriter(Sender<Datagram>);

impl DatagramWriter for ChannelWriter {
    fn write(&self, datagram: Datagram) {
        let _ = self.0.send(datagram);
    }
}

fn channel_writer() -> (Arc<ChannelWriter>, Receiver<Datagram>) {
    let (tx, rx) = unbounded();
    (Arc::new(ChannelWriter(tx)), rx)
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.sq_entries = 64;
    config.max_ports = 8;
    config
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

// ── Port lifecycle ──────────────────────────────────────────────────

#[test]
fn receiver_binds_ephemeral_port() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, _rx) = channel_writer();

    let mut config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    let handle = event_loop
        .add_udp_receiver(&mut config, writer)
        .expect("add receiver failed");

    assert!(config.bind_address.port() > 0);
    assert_eq!(event_loop.num_ports(), 1);

    event_loop.remove_port(handle);
    assert_eq!(event_loop.num_ports(), 0);
}

#[test]
fn bind_conflict_fails_second_receiver() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, _rx) = channel_writer();

    let mut first = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    event_loop
        .add_udp_receiver(&mut first, writer.clone())
        .expect("first add failed");

    let mut second = UdpReceiverConfig {
        bind_address: first.bind_address,
    };
    assert!(event_loop.add_udp_receiver(&mut second, writer).is_none());
    assert_eq!(event_loop.num_ports(), 1);
}

#[test]
fn rebind_after_remove() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, _rx) = channel_writer();

    let mut config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    let handle = event_loop
        .add_udp_receiver(&mut config, writer.clone())
        .expect("add receiver failed");
    let bound = config.bind_address;

    // remove_port only returns once the socket is fully closed, so the
    // address must be immediately rebindable.
    event_loop.remove_port(handle);

    let mut again = UdpReceiverConfig { bind_address: bound };
    event_loop
        .add_udp_receiver(&mut again, writer)
        .expect("rebind at freed address failed");
    assert_eq!(again.bind_address, bound);
}

#[test]
fn port_limit_fails_cleanly() {
    let mut config = test_config();
    config.max_ports = 2;
    let event_loop = EventLoop::start(config).expect("start failed");
    let (writer, _rx) = channel_writer();

    for _ in 0..2 {
        let mut config = UdpReceiverConfig {
            bind_address: localhost(0),
        };
        event_loop
            .add_udp_receiver(&mut config, writer.clone())
            .expect("add receiver failed");
    }

    let mut config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    assert!(event_loop.add_udp_receiver(&mut config, writer).is_none());
    assert_eq!(event_loop.num_ports(), 2);
}

#[test]
fn shutdown_with_live_ports() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, _rx) = channel_writer();

    for _ in 0..3 {
        let mut config = UdpReceiverConfig {
            bind_address: localhost(0),
        };
        event_loop
            .add_udp_receiver(&mut config, writer.clone())
            .expect("add receiver failed");
    }
    assert_eq!(event_loop.num_ports(), 3);
    assert!(event_loop.valid());

    // Drop without removing the ports; must join cleanly.
    drop(event_loop);
}

// ── Datagram delivery ───────────────────────────────────────────────

#[test]
fn receiver_delivers_inbound_datagrams() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, rx) = channel_writer();

    let mut config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    event_loop
        .add_udp_receiver(&mut config, writer)
        .expect("add receiver failed");

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"ping", config.bind_address).unwrap();

    let datagram = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("datagram not delivered");
    assert_eq!(&datagram.payload[..], b"ping");
    assert_eq!(datagram.peer, peer.local_addr().unwrap());
}

#[test]
fn receiver_delivers_multiple_datagrams_in_order() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, rx) = channel_writer();

    let mut config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    event_loop
        .add_udp_receiver(&mut config, writer)
        .expect("add receiver failed");

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    for i in 0..10u8 {
        peer.send_to(&[i], config.bind_address).unwrap();
        // Receive one at a time: single-shot recvmsg re-arms between
        // datagrams, and lockstep avoids kernel-side drops.
        let datagram = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("datagram not delivered");
        assert_eq!(&datagram.payload[..], &[i], "mismatch on datagram {i}");
    }
}

#[test]
fn sender_writer_reaches_receiver() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");
    let (writer, rx) = channel_writer();

    let mut recv_config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    event_loop
        .add_udp_receiver(&mut recv_config, writer)
        .expect("add receiver failed");

    let mut send_config = UdpSenderConfig {
        bind_address: localhost(0),
        broadcast: false,
    };
    let (_handle, sender) = event_loop
        .add_udp_sender(&mut send_config)
        .expect("add sender failed");
    assert!(send_config.bind_address.port() > 0);
    assert_eq!(event_loop.num_ports(), 2);

    sender
        .send(Datagram {
            peer: recv_config.bind_address,
            payload: Bytes::from_static(b"one shot"),
        })
        .expect("send failed");

    let datagram = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("datagram not delivered");
    assert_eq!(&datagram.payload[..], b"one shot");
    assert_eq!(datagram.peer, send_config.bind_address);

    // Exactly once.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn sender_reaches_external_socket() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut send_config = UdpSenderConfig {
        bind_address: localhost(0),
        broadcast: false,
    };
    let (_handle, sender) = event_loop
        .add_udp_sender(&mut send_config)
        .expect("add sender failed");

    for i in 0..5u8 {
        sender
            .send(Datagram {
                peer: peer.local_addr().unwrap(),
                payload: Bytes::copy_from_slice(&[i; 16]),
            })
            .expect("send failed");
    }

    let mut buf = [0u8; 64];
    for i in 0..5u8 {
        let (len, from) = peer.recv_from(&mut buf).expect("recv timed out");
        assert_eq!(&buf[..len], &[i; 16], "mismatch on datagram {i}");
        assert_eq!(from, send_config.bind_address);
    }
}

// ── Resolution ──────────────────────────────────────────────────────

#[test]
fn resolve_literal_ip() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");

    let uri: EndpointUri = "rtp://127.0.0.1:5000".parse().unwrap();
    let address = event_loop
        .resolve_endpoint_address(&uri)
        .expect("resolve failed");
    assert_eq!(address, localhost(5000));
}

#[test]
fn resolve_literal_ipv6() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");

    let uri: EndpointUri = "rtp://[::1]:5000".parse().unwrap();
    let address = event_loop
        .resolve_endpoint_address(&uri)
        .expect("resolve failed");
    assert_eq!(address, "[::1]:5000".parse::<SocketAddr>().unwrap());
}

#[test]
fn resolve_localhost() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");

    let uri: EndpointUri = "rtp://localhost:5000".parse().unwrap();
    let address = event_loop
        .resolve_endpoint_address(&uri)
        .expect("resolve failed");
    assert!(address.ip().is_loopback());
    assert_eq!(address.port(), 5000);
}

#[test]
fn resolve_failure_leaves_loop_usable() {
    let event_loop = EventLoop::start(test_config()).expect("start failed");

    // .invalid is reserved and guaranteed not to resolve.
    let uri: EndpointUri = "rtp://no-such-host.invalid:5000".parse().unwrap();
    assert!(event_loop.resolve_endpoint_address(&uri).is_none());

    let (writer, _rx) = channel_writer();
    let mut config = UdpReceiverConfig {
        bind_address: localhost(0),
    };
    event_loop
        .add_udp_receiver(&mut config, writer)
        .expect("add receiver failed after resolve failure");
    assert_eq!(event_loop.num_ports(), 1);
}

// ── Concurrency ─────────────────────────────────────────────────────

#[test]
fn concurrent_add_remove_from_many_threads() {
    let event_loop = Arc::new(EventLoop::start(test_config()).expect("start failed"));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let event_loop = event_loop.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..8 {
                let (writer, _rx) = channel_writer();
                let mut config = UdpReceiverConfig {
                    bind_address: localhost(0),
                };
                let handle = event_loop
                    .add_udp_receiver(&mut config, writer)
                    .expect("add receiver failed");
                event_loop.remove_port(handle);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(event_loop.num_ports(), 0);
}
