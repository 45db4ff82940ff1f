mod common;

use common::{drain, wait_for, EchoSink, Event, TestServer};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

/// A single client connects, is echoed, and disconnects; the hook
/// sequence is accepted, data_received, closed, and every slot is free
/// afterwards.
#[test]
fn single_client_echo() {
    let (tx, rx) = mpsc::channel();
    let mut server = TestServer::start(EchoSink::new(tx), 2, 16, 0);

    let mut client = server.connect();

    let accepted = wait_for(&rx, Duration::from_secs(5), |e| {
        matches!(e, Event::Accepted(_))
    });
    let Event::Accepted(id) = accepted else {
        unreachable!()
    };

    client.write_all(b"hello").unwrap();
    let mut echo = [0u8; 5];
    client.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"hello");

    let data = wait_for(&rx, Duration::from_secs(5), |e| matches!(e, Event::Data(..)));
    assert_eq!(data, Event::Data(id, b"hello".to_vec()));

    drop(client);
    let closed = wait_for(&rx, Duration::from_secs(5), |e| {
        matches!(e, Event::Closed(_))
    });
    assert_eq!(closed, Event::Closed(id));

    let stats = server.server.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.errored, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.bytes_received, 5);

    server.stop();
}

/// Bytes written by a hook arrive at the peer in order across several
/// exchanges on one connection.
#[test]
fn echo_roundtrips_preserve_order() {
    let (tx, rx) = mpsc::channel();
    let mut server = TestServer::start(EchoSink::new(tx), 2, 16, 0);

    let mut client = server.connect();
    wait_for(&rx, Duration::from_secs(5), |e| {
        matches!(e, Event::Accepted(_))
    });

    for round in 0u32..20 {
        let payload = format!("message-{}", round).into_bytes();
        client.write_all(&payload).unwrap();

        let mut echo = vec![0u8; payload.len()];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(echo, payload);
    }

    drop(client);
    wait_for(&rx, Duration::from_secs(5), |e| matches!(e, Event::Closed(_)));
    let leftover = drain(&rx, Duration::from_millis(100));
    assert!(leftover.is_empty(), "unexpected events: {:?}", leftover);

    server.stop();
}

/// An aborted connection (RST) takes the error path, not the close
/// path, and still reclaims the slot.
#[test]
fn reset_connection_surfaces_error() {
    use std::os::fd::AsRawFd;

    let (tx, rx) = mpsc::channel();
    let mut server = TestServer::start(EchoSink::new(tx), 1, 4, 0);

    let client = server.connect();
    wait_for(&rx, Duration::from_secs(5), |e| {
        matches!(e, Event::Accepted(_))
    });

    // Closing with zero linger aborts the connection with an RST.
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            client.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0);
    drop(client);

    let event = wait_for(&rx, Duration::from_secs(5), |e| {
        matches!(e, Event::Closed(_) | Event::Error(_))
    });
    assert!(matches!(event, Event::Error(_)), "got {:?}", event);

    let stats = server.server.stats();
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.closed, 0);
    assert_eq!(stats.active, 0);

    server.stop();
}

/// A bound-port listener (rather than an adopted one) accepts too.
#[test]
fn bound_port_listener_accepts() {
    use ravel::Server;
    use std::sync::Arc;

    let (tx, rx) = mpsc::channel();
    let server = Arc::new(Server::new(EchoSink::new(tx)).unwrap().workers(1));

    // Ephemeral-ish port; retry a few candidates to dodge collisions.
    let mut bound_port = None;
    for port in 42611..42641 {
        if server.bind(port).is_ok() {
            bound_port = Some(port);
            break;
        }
    }
    let port = bound_port.expect("no free port in range");

    let runner = {
        let server = server.clone();
        std::thread::spawn(move || server.run().unwrap())
    };
    std::thread::sleep(Duration::from_millis(20));

    let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"ping").unwrap();
    let mut echo = [0u8; 4];
    client.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"ping");

    wait_for(&rx, Duration::from_secs(5), |e| matches!(e, Event::Data(..)));

    drop(client);
    server.stop();
    runner.join().unwrap();
}
