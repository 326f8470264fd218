mod common;

use common::{bytes, content, wait_until, Recorder};
use netio_session::{EventGenerator, MessageRef, PooledDispatcher, Session, SessionListener};
use std::sync::Arc;

struct Failing;

impl SessionListener for Failing {
    fn message_received(&self, _session: &Session, _message: &MessageRef) -> anyhow::Result<()> {
        anyhow::bail!("refusing message")
    }
}

struct Panicking;

impl SessionListener for Panicking {
    fn session_established(&self, _session: &Session) -> anyhow::Result<()> {
        panic!("listener blew up");
    }
}

fn udp_pair(generator: &EventGenerator, receiver_setup: impl FnOnce(&Session)) -> (Session, Session) {
    let receiver = Session::udp();
    receiver.set_event_generator(generator.clone()).unwrap();
    receiver.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
    receiver_setup(&receiver);
    receiver.start(true).unwrap();

    let sender = Session::udp();
    sender.set_event_generator(generator.clone()).unwrap();
    sender.set_remote_addr(receiver.local_addr().unwrap()).unwrap();
    sender.start(true).unwrap();
    (receiver, sender)
}

#[test]
fn test_failing_listener_does_not_starve_others() {
    let generator = EventGenerator::new();
    let recorder = Recorder::new();
    let (_receiver, sender) = udp_pair(&generator, |receiver| {
        receiver.add_session_listener(Arc::new(Failing));
        receiver.add_session_listener(recorder.clone());
    });

    sender.write(bytes(b"payload")).unwrap();
    assert!(wait_until(|| !recorder.exceptions.lock().is_empty()));
    assert_eq!(recorder.received.lock().as_slice(), b"payload");
    let exceptions = recorder.exceptions.lock().clone();
    assert_eq!(exceptions.len(), 1);
    assert!(exceptions[0].contains("refusing message"));
    generator.stop();
}

#[test]
fn test_panicking_listener_is_reported() {
    let generator = EventGenerator::new();
    let recorder = Recorder::new();
    let (receiver, _sender) = udp_pair(&generator, |receiver| {
        receiver.add_session_listener(Arc::new(Panicking));
        receiver.add_session_listener(recorder.clone());
    });

    assert!(wait_until(|| Recorder::count(&recorder.established) == 1));
    assert!(wait_until(|| !recorder.exceptions.lock().is_empty()));
    assert!(recorder.exceptions.lock()[0].contains("listener blew up"));
    assert!(receiver.is_available());
    generator.stop();
}

#[test]
fn test_ordered_pool_keeps_session_order() {
    let generator = EventGenerator::new();
    let recorder = Recorder::new();
    let (_receiver, sender) = udp_pair(&generator, |receiver| {
        receiver
            .set_dispatcher(Arc::new(PooledDispatcher::ordered(4)))
            .unwrap();
        receiver.add_session_listener(recorder.clone());
    });

    const PAYLOADS: [&[u8]; 6] = [b"0", b"1", b"2", b"3", b"4", b"5"];
    for payload in PAYLOADS {
        assert!(sender.block_write(bytes(payload)).unwrap());
    }
    assert!(wait_until(|| recorder.messages.lock().len() == PAYLOADS.len()));
    let seen: Vec<Vec<u8>> = recorder.messages.lock().iter().map(content).collect();
    let expected: Vec<Vec<u8>> = PAYLOADS.iter().map(|p| p.to_vec()).collect();
    assert_eq!(seen, expected);
    generator.stop();
}

#[test]
fn test_removed_listener_stops_receiving() {
    let generator = EventGenerator::new();
    let kept = Recorder::new();
    let removed = Recorder::new();
    let removed_dyn: Arc<dyn SessionListener> = removed.clone();
    let (receiver, sender) = udp_pair(&generator, |receiver| {
        receiver.add_session_listener(kept.clone());
        receiver.add_session_listener(Arc::clone(&removed_dyn));
    });

    receiver.remove_session_listener(&removed_dyn);
    sender.write(bytes(b"after")).unwrap();
    assert!(wait_until(|| kept.received_len() == 5));
    assert_eq!(removed.received_len(), 0);
    generator.stop();
}
