#![cfg(feature = "tls")]

mod common;

use common::{bytes, wait_until, Recorder};
use netio_session::tls::{client_config_from_pem, server_config_from_pem, server_name};
use netio_session::{EventGenerator, Session, SessionError, SessionKind, SimpleSessionFactory};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use std::sync::Arc;

struct Pair {
    generator: EventGenerator,
    listener: Session,
    client: Session,
    server_events: Arc<Recorder>,
    client_events: Arc<Recorder>,
}

fn connect_pair(echo: bool) -> Pair {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let server_config = server_config_from_pem(&cert.pem(), &key_pair.serialize_pem(), None).unwrap();
    let client_config = client_config_from_pem(&cert.pem(), None).unwrap();

    let generator = EventGenerator::new();
    let server_events = Recorder::new();
    let listener = Session::listener();
    listener.set_event_generator(generator.clone()).unwrap();
    listener.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_tls_server(Arc::new(server_config)).unwrap();
    let mut factory = SimpleSessionFactory::new().with_listener(server_events.clone());
    if echo {
        factory = factory.with_listener(Arc::new(common::Echo));
    }
    listener.set_session_factory(Arc::new(factory)).unwrap();
    listener.start(true).unwrap();

    let client_events = Recorder::new();
    let client = Session::tls_client(Arc::new(client_config), server_name("localhost").unwrap());
    client.set_event_generator(generator.clone()).unwrap();
    client.set_remote_addr(listener.local_addr().unwrap()).unwrap();
    client.add_session_listener(client_events.clone());

    Pair {
        generator,
        listener,
        client,
        server_events,
        client_events,
    }
}

#[test]
fn test_write_before_handshake_is_delivered() {
    let pair = connect_pair(false);
    pair.client.start(true).unwrap();
    assert_eq!(pair.client.kind(), SessionKind::Tls);

    // Queued while the handshake is still running.
    pair.client.write(bytes(b"early bird")).unwrap();
    assert!(wait_until(|| pair.server_events.received_len() == 10));
    assert_eq!(pair.server_events.received.lock().as_slice(), b"early bird");
    assert!(pair.client.is_handshake_completed());

    let children = pair.listener.connected_sessions();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].kind(), SessionKind::Tls);
    assert!(children[0].is_handshake_completed());
    assert_eq!(children[0].snapshot().handshake_completed, Some(true));
    pair.generator.stop();
}

#[test]
fn test_echo_over_tls() {
    let pair = connect_pair(true);
    pair.client.start(true).unwrap();

    assert!(wait_until(|| pair.client.is_handshake_completed()));
    assert!(pair.client.block_write(bytes(b"secret")).unwrap());
    assert!(wait_until(|| pair.client_events.received_len() == 6));
    assert_eq!(pair.client_events.received.lock().as_slice(), b"secret");

    let events = pair.client_events.events.lock().clone();
    assert_eq!(events.first(), Some(&"established"));
    let first_received = events.iter().position(|e| *e == "received").unwrap();
    assert!(first_received > 0);
    // Decrypted data is only ever delivered after the handshake completed.
    assert!(pair.client_events.handshake_at_receive.lock().iter().all(|done| *done));
    assert!(pair.server_events.handshake_at_receive.lock().iter().all(|done| *done));
    pair.generator.stop();
}

#[test]
fn test_rehandshake_keeps_queued_data_in_order() {
    let pair = connect_pair(true);
    pair.client.start(true).unwrap();
    assert!(wait_until(|| pair.client.is_handshake_completed()));

    let chunks: [&'static [u8]; 6] = [b"alpha ", b"beta ", b"gamma ", b"delta ", b"epsilon ", b"zeta"];
    let mut expected = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        pair.client.write(bytes(chunk)).unwrap();
        expected.extend_from_slice(chunk);
        if i % 2 == 0 {
            pair.client.handshake().unwrap();
        }
    }

    assert!(wait_until(|| pair.client_events.received_len() == expected.len()));
    assert_eq!(pair.server_events.received.lock().as_slice(), expected.as_slice());
    assert_eq!(pair.client_events.received.lock().as_slice(), expected.as_slice());
    assert!(wait_until(|| Recorder::count(&pair.client_events.sent) == chunks.len()));
    assert_eq!(
        *pair.client_events.sent_payloads.lock(),
        chunks.iter().map(|c| c.to_vec()).collect::<Vec<_>>()
    );
    assert!(pair.client.is_available());
    assert!(pair.client_events.exceptions.lock().is_empty());
    pair.generator.stop();
}

#[test]
fn test_block_write_needs_completed_handshake() {
    let pair = connect_pair(false);
    let err = pair.client.block_write(bytes(b"x")).unwrap_err();
    assert!(matches!(err, SessionError::IllegalState(_)));
    pair.generator.stop();
}

#[test]
fn test_handshake_requires_tls_kind() {
    let session = Session::tcp();
    assert!(matches!(session.handshake(), Err(SessionError::Unsupported(_))));
    let pair = connect_pair(false);
    // No-op until the first handshake has completed.
    pair.client.handshake().unwrap();
    pair.generator.stop();
}

#[test]
fn test_tls_start_needs_role() {
    let session = Session::tls();
    session.set_remote_addr("127.0.0.1:9".parse().unwrap()).unwrap();
    assert!(matches!(session.start(false), Err(SessionError::IllegalState(_))));
    assert!(!session.is_started());
}

#[test]
fn test_closing_client_closes_server_child() {
    let pair = connect_pair(false);
    pair.client.start(true).unwrap();
    assert!(wait_until(|| pair.client.is_handshake_completed()));
    assert!(wait_until(|| Recorder::count(&pair.server_events.established) == 1));

    pair.client.close(true);
    assert!(wait_until(|| Recorder::count(&pair.server_events.closed) == 1));
    assert!(pair.server_events.exceptions.lock().is_empty());
    pair.generator.stop();
}
