mod common;

use common::{bytes, wait_until, Echo, Recorder};
use netio_session::{
    ByteArrayMessage, EventGenerator, Message, MessageRecognizer, Session, SessionError,
    SimpleSessionFactory,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn start_listener(generator: &EventGenerator, factory: SimpleSessionFactory) -> Session {
    let listener = Session::listener();
    listener.set_event_generator(generator.clone()).unwrap();
    listener.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_session_factory(Arc::new(factory)).unwrap();
    listener.start(true).unwrap();
    assert!(listener.is_established());
    listener
}

fn connect(generator: &EventGenerator, addr: SocketAddr, recorder: &Arc<Recorder>) -> Session {
    let client = Session::tcp();
    client.set_event_generator(generator.clone()).unwrap();
    client.set_remote_addr(addr).unwrap();
    client.add_session_listener(recorder.clone());
    client.start(true).unwrap();
    client
}

#[test]
fn test_echo_preserves_write_order() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new().with_listener(Arc::new(Echo)));
    let recorder = Recorder::new();
    let client = connect(&generator, listener.local_addr().unwrap(), &recorder);
    assert!(client.is_available());

    for chunk in [&b"first "[..], b"second ", b"third"] {
        client.write(bytes(chunk)).unwrap();
    }
    assert!(wait_until(|| recorder.received_len() == 18));
    assert_eq!(recorder.received.lock().as_slice(), b"first second third");

    client.close(true);
    listener.close(true);
    generator.stop();
}

#[test]
fn test_idle_after_queue_drains() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new());
    let recorder = Recorder::new();
    let client = connect(&generator, listener.local_addr().unwrap(), &recorder);

    let receipt = client.write_with_receipt(bytes(b"ping")).unwrap();
    assert!(receipt.wait());
    assert!(wait_until(|| Recorder::count(&recorder.idle) >= 1));
    assert_eq!(Recorder::count(&recorder.sent), 1);
    assert_eq!(client.write_queue_size(), 0);

    generator.stop();
    assert!(!client.is_started());
}

#[test]
fn test_block_write_from_caller_thread() {
    let generator = EventGenerator::new();
    let server = Recorder::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new().with_listener(server.clone()));
    let client = connect(&generator, listener.local_addr().unwrap(), &Recorder::new());

    assert!(client.block_write(bytes(b"hello")).unwrap());
    assert!(wait_until(|| server.received_len() == 5));
    generator.stop();
}

#[test]
fn test_statistics_count_received_bytes() {
    let generator = EventGenerator::new();
    let listener = Session::listener();
    listener.set_event_generator(generator.clone()).unwrap();
    listener.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_statistics_enabled(true).unwrap();
    listener.start(true).unwrap();

    let client = connect(&generator, listener.local_addr().unwrap(), &Recorder::new());
    client.write(bytes(b"0123456789")).unwrap();

    assert!(wait_until(|| listener.connected_sessions().len() == 1));
    let child = listener.connected_sessions().remove(0);
    assert!(wait_until(|| child
        .statistic()
        .is_some_and(|s| s.received_bytes() == 10)));
    assert!(child.snapshot().statistic.is_some());
    generator.stop();
}

#[test]
fn test_close_is_idempotent() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new());
    let recorder = Recorder::new();
    let client = connect(&generator, listener.local_addr().unwrap(), &recorder);

    client.close(true);
    client.close(true);
    client.close(false);
    assert!(!client.is_started());
    assert!(!client.is_closing());
    assert_eq!(Recorder::count(&recorder.closed), 1);
    assert!(matches!(
        client.write(bytes(b"late")),
        Err(SessionError::IllegalState(_))
    ));
    generator.stop();
}

#[test]
fn test_session_restarts_after_close() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new());
    let recorder = Recorder::new();
    let client = connect(&generator, listener.local_addr().unwrap(), &recorder);
    client.close(true);

    client.start(true).unwrap();
    assert!(client.is_available());
    assert!(wait_until(|| Recorder::count(&recorder.established) == 2));
    generator.stop();
}

struct NeverComplete;

impl MessageRecognizer for NeverComplete {
    fn recognize(&self, _session: &Session, _buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
        Ok(None)
    }
}

#[test]
fn test_buffer_limit_closes_session_once() {
    let generator = EventGenerator::new();
    let server = Recorder::new();
    let listener = Session::listener();
    listener.set_event_generator(generator.clone()).unwrap();
    listener.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_message_recognizer(Arc::new(NeverComplete)).unwrap();
    listener.set_buffer_capacity_limit(16).unwrap();
    listener
        .set_session_factory(Arc::new(SimpleSessionFactory::new().with_listener(server.clone())))
        .unwrap();
    listener.start(true).unwrap();

    let client = connect(&generator, listener.local_addr().unwrap(), &Recorder::new());
    client.write(bytes(&[7u8; 64])).unwrap();

    assert!(wait_until(|| Recorder::count(&server.closed) == 1));
    let exceptions = server.exceptions.lock().clone();
    assert_eq!(exceptions.len(), 1, "{:?}", exceptions);
    assert!(exceptions[0].contains("capacity limit"));
    generator.stop();
}

#[test]
fn test_connect_refused_reports_then_closes() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let generator = EventGenerator::new();
    let recorder = Recorder::new();
    let client = connect(&generator, SocketAddr::from(([127, 0, 0, 1], port)), &recorder);

    assert!(wait_until(|| Recorder::count(&recorder.closed) == 1));
    assert!(!client.is_started());
    assert_eq!(Recorder::count(&recorder.established), 0);
    assert_eq!(*recorder.events.lock(), vec!["exception", "closed"]);
    generator.stop();
}

#[test]
fn test_close_children_with_listener() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new());
    listener.set_close_children_on_close(true).unwrap();

    let recorder = Recorder::new();
    let _client = connect(&generator, listener.local_addr().unwrap(), &recorder);
    assert!(wait_until(|| listener.connected_sessions().len() == 1));

    listener.close(true);
    assert!(listener.connected_sessions().is_empty());
    assert!(wait_until(|| Recorder::count(&recorder.closed) == 1));
    generator.stop();
}

#[test]
fn test_children_leave_map_when_closed() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new());
    let client = connect(&generator, listener.local_addr().unwrap(), &Recorder::new());
    assert!(wait_until(|| listener.connected_sessions().len() == 1));
    assert_eq!(listener.snapshot().connected_sessions, Some(1));

    client.close(true);
    assert!(wait_until(|| listener.connected_sessions().is_empty()));
    generator.stop();
}

#[test]
fn test_message_sent_follows_write_order() {
    let generator = EventGenerator::new();
    let listener = start_listener(&generator, SimpleSessionFactory::new());
    let recorder = Recorder::new();
    let client = connect(&generator, listener.local_addr().unwrap(), &recorder);

    let chunks: [&'static [u8]; 5] = [b"one", b"two", b"three", b"four", b"five"];
    for chunk in chunks {
        client.write(bytes(chunk)).unwrap();
    }
    assert!(wait_until(|| Recorder::count(&recorder.sent) == 5));
    let sent = recorder.sent_payloads.lock().clone();
    assert_eq!(sent, chunks.iter().map(|c| c.to_vec()).collect::<Vec<_>>());
    generator.stop();
}

/// Fails (or panics) on the first buffer it sees, then recognizes bytes.
struct FirstTimeFaulty {
    tripped: AtomicBool,
    panics: bool,
}

impl FirstTimeFaulty {
    fn new(panics: bool) -> Arc<Self> {
        Arc::new(Self {
            tripped: AtomicBool::new(false),
            panics,
        })
    }
}

impl MessageRecognizer for FirstTimeFaulty {
    fn recognize(&self, _session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            if self.panics {
                panic!("malformed header");
            }
            anyhow::bail!("malformed header");
        }
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(ByteArrayMessage::default())))
    }
}

fn faulty_listener(generator: &EventGenerator, panics: bool, server: &Arc<Recorder>) -> Session {
    let listener = Session::listener();
    listener.set_event_generator(generator.clone()).unwrap();
    listener.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_message_recognizer(FirstTimeFaulty::new(panics)).unwrap();
    listener
        .set_session_factory(Arc::new(SimpleSessionFactory::new().with_listener(server.clone())))
        .unwrap();
    listener.start(true).unwrap();
    listener
}

#[test]
fn test_recognizer_error_keeps_session_receiving() {
    let generator = EventGenerator::new();
    let server = Recorder::new();
    let listener = faulty_listener(&generator, false, &server);
    let client = connect(&generator, listener.local_addr().unwrap(), &Recorder::new());

    client.write(bytes(b"bad")).unwrap();
    assert!(wait_until(|| server.exceptions.lock().len() == 1));
    assert!(server.exceptions.lock()[0].contains("malformed header"));

    // The failed bytes stay buffered and come out with the next read.
    client.write(bytes(b"good")).unwrap();
    assert!(wait_until(|| server.received.lock().ends_with(b"good")));
    assert_eq!(Recorder::count(&server.closed), 0);
    assert_eq!(listener.connected_sessions().len(), 1);
    assert!(listener.connected_sessions()[0].is_available());
    generator.stop();
}

#[test]
fn test_recognizer_panic_is_reported_and_generator_survives() {
    let generator = EventGenerator::new();
    let server = Recorder::new();
    let listener = faulty_listener(&generator, true, &server);
    let client = connect(&generator, listener.local_addr().unwrap(), &Recorder::new());

    client.write(bytes(b"boom")).unwrap();
    assert!(wait_until(|| server.exceptions.lock().len() == 1));
    assert!(server.exceptions.lock()[0].contains("recognizer panicked: malformed header"));

    // The offending bytes are discarded; the session keeps going.
    client.write(bytes(b"after")).unwrap();
    assert!(wait_until(|| server.received.lock().ends_with(b"after")));
    assert!(!server.received.lock().starts_with(b"boom"));
    assert_eq!(Recorder::count(&server.closed), 0);

    let second = Recorder::new();
    let other = connect(&generator, listener.local_addr().unwrap(), &second);
    assert!(other.is_established());
    assert!(wait_until(|| Recorder::count(&server.established) == 2));
    assert!(generator.is_started());
    generator.stop();
}

