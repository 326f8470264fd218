mod common;

use common::{bytes, content, wait_until, Recorder};
use netio_session::{ByteArrayMessage, EventGenerator, Session, SessionError};
use std::sync::Arc;

fn udp(generator: &EventGenerator, recorder: &Arc<Recorder>) -> Session {
    let session = Session::udp();
    session.set_event_generator(generator.clone()).unwrap();
    session.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    session.add_session_listener(recorder.clone());
    session
}

#[test]
fn test_datagrams_carry_source_address() {
    let generator = EventGenerator::new();
    let server_events = Recorder::new();
    let server = udp(&generator, &server_events);
    server.start(true).unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_events = Recorder::new();
    let client = udp(&generator, &client_events);
    client.set_remote_addr(server_addr).unwrap();
    client.start(true).unwrap();
    assert_eq!(client.remote_addr(), Some(server_addr));

    client.write(bytes(b"one")).unwrap();
    client.write(bytes(b"two")).unwrap();
    assert!(wait_until(|| server_events.messages.lock().len() == 2));

    let messages = server_events.messages.lock().clone();
    assert_eq!(content(&messages[0]), b"one");
    assert_eq!(content(&messages[1]), b"two");
    let source = messages[0].peer_addr().unwrap();
    assert_eq!(source, client.local_addr().unwrap());

    // Unconnected sockets reply to the address stamped on the message.
    server
        .write(Arc::new(ByteArrayMessage::new(&b"pong"[..]).with_peer_addr(source)))
        .unwrap();
    assert!(wait_until(|| client_events.received_len() == 4));
    assert_eq!(client_events.received.lock().as_slice(), b"pong");
    generator.stop();
}

#[test]
fn test_unconnected_write_needs_destination() {
    let generator = EventGenerator::new();
    let session = udp(&generator, &Recorder::new());
    session.start(true).unwrap();
    assert!(matches!(
        session.write(bytes(b"lost")),
        Err(SessionError::IllegalArgument(_))
    ));
    generator.stop();
}

#[test]
fn test_session_timeout_fires_when_quiet() {
    let generator = EventGenerator::custom(false, std::time::Duration::from_millis(20));
    let recorder = Recorder::new();
    let session = udp(&generator, &recorder);
    session
        .set_session_timeout(std::time::Duration::from_millis(60))
        .unwrap();
    session.start(true).unwrap();

    assert!(wait_until(|| Recorder::count(&recorder.timeouts) >= 1));
    // A timeout only notifies; the session stays open.
    assert!(session.is_available());
    assert!(Recorder::count(&recorder.idle) >= 1);
    generator.stop();
}
