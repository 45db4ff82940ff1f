#![allow(dead_code)]

use ravel::{PacketSink, Server, Session};
use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// One observed callback, tagged with the session identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accepted(u32),
    Data(u32, Vec<u8>),
    Oob(u32, u8),
    Closed(u32),
    Error(u32),
}

/// Echoes received bytes back and reports every hook on a channel.
pub struct EchoSink {
    events: Mutex<Sender<Event>>,
}

impl EchoSink {
    pub fn new(events: Sender<Event>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    fn report(&self, event: Event) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl PacketSink for EchoSink {
    type State = ();

    fn accepted(&self, session: &mut Session<'_, ()>) {
        self.report(Event::Accepted(session.id()));
    }

    fn data_received(&self, session: &mut Session<'_, ()>, data: &[u8]) {
        let _ = session.write(data);
        self.report(Event::Data(session.id(), data.to_vec()));
        session.rearm();
    }

    fn oob_received(&self, session: &mut Session<'_, ()>, byte: u8) {
        self.report(Event::Oob(session.id(), byte));
        session.rearm();
    }

    fn closed(&self, session: &mut Session<'_, ()>) {
        self.report(Event::Closed(session.id()));
    }

    fn error(&self, session: &mut Session<'_, ()>) {
        self.report(Event::Error(session.id()));
    }
}

/// A server running on a background thread, listening on an ephemeral
/// port adopted through `add`.
pub struct TestServer<P: PacketSink> {
    pub server: Arc<Server<P>>,
    pub port: u16,
    runner: Option<thread::JoinHandle<()>>,
}

impl<P: PacketSink> TestServer<P> {
    pub fn start(sink: P, workers: usize, max_clients: usize, timeout_ms: u64) -> Self {
        ravel::init_logging();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = Arc::new(
            Server::new(sink)
                .unwrap()
                .workers(workers)
                .max_clients(max_clients)
                .timeout_ms(timeout_ms),
        );
        server.add(listener.into_raw_fd()).unwrap();

        let runner = {
            let server = server.clone();
            thread::spawn(move || server.run().unwrap())
        };
        // Let the accept loop enter its wait.
        thread::sleep(Duration::from_millis(20));

        Self {
            server,
            port,
            runner: Some(runner),
        }
    }

    /// Restarts the accept loop after a `stop`.
    pub fn restart(&mut self) {
        assert!(self.runner.is_none(), "server still running");
        let server = self.server.clone();
        self.runner = Some(thread::spawn(move || server.run().unwrap()));
        thread::sleep(Duration::from_millis(20));
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    pub fn stop(&mut self) {
        self.server.stop();
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap();
        }
    }
}

impl<P: PacketSink> Drop for TestServer<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receives events until `pred` matches, failing after `timeout`.
/// Returns the matching event; earlier non-matching events are dropped.
pub fn wait_for<F>(rx: &Receiver<Event>, timeout: Duration, pred: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .expect("timed out waiting for event");
        let event = rx
            .recv_timeout(remaining)
            .expect("timed out waiting for event");
        if pred(&event) {
            return event;
        }
    }
}

/// Drains every event currently queued, plus anything arriving within
/// the settle window.
pub fn drain(rx: &Receiver<Event>, settle: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(settle) {
        events.push(event);
    }
    events
}
