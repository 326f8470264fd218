#![cfg(unix)]

mod common;

use common::{bytes, wait_until, Recorder};
use netio_session::{EventGenerator, Session};

#[test]
fn test_pipe_loops_writes_back() {
    let generator = EventGenerator::new();
    let recorder = Recorder::new();
    let session = Session::pipe();
    session.set_event_generator(generator.clone()).unwrap();
    session.add_session_listener(recorder.clone());
    session.start(true).unwrap();
    assert!(session.local_addr().is_none());

    session.write(bytes(b"loop")).unwrap();
    session.write(bytes(b"back")).unwrap();
    assert!(wait_until(|| recorder.received_len() == 8));
    assert_eq!(recorder.received.lock().as_slice(), b"loopback");

    session.close(true);
    assert_eq!(*recorder.events.lock().last().unwrap(), "closed");
    generator.stop();
}
