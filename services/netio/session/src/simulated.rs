//! Multicast sessions driven by a dedicated worker thread.
//!
//! The socket runs in blocking mode with a short read timeout. The worker
//! alternates between receiving one datagram and flushing the write queue,
//! and keeps its own idle clock for the session timeout.

use crate::engine::{guarded, MAX_DATAGRAM};
use crate::error::Result;
use crate::recognizer::MessageRecognizer;
use crate::registry;
use crate::session::{BoundAddrs, Notice, Session, Settings};
use crate::write_queue::WriteReceipt;
use netio_util::{buffer, ElapsedTime};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::Cell;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Read timeout of the worker's blocking receive.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

thread_local! {
    static WORKER_SESSION: Cell<Option<u64>> = const { Cell::new(None) };
}

#[derive(Default)]
pub(crate) struct Simulated {
    state: Mutex<SimulatedState>,
}

#[derive(Default)]
struct SimulatedState {
    socket: Option<Arc<UdpSocket>>,
    worker: Option<JoinHandle<()>>,
}

fn open_socket(settings: &Settings) -> io::Result<UdpSocket> {
    let bind = settings.local_addr.unwrap_or_else(|| {
        let any: IpAddr = match settings.multicast_group {
            Some(IpAddr::V6(_)) => IpAddr::from([0u16; 8]),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        SocketAddr::new(any, 0)
    });
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;
    socket.bind(&bind.into())?;
    match settings.multicast_group {
        Some(IpAddr::V4(group)) => socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?,
        Some(IpAddr::V6(group)) => socket.join_multicast_v6(&group, 0)?,
        None => {}
    }

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
    if let Some(remote) = settings.remote_addr {
        socket.connect(remote)?;
    }
    Ok(socket)
}

impl Session {
    pub(crate) fn on_simulated_worker(&self) -> bool {
        WORKER_SESSION.with(|worker| worker.get() == Some(self.id()))
    }

    fn simulated(&self) -> Option<&Simulated> {
        self.inner.simulated.as_ref()
    }

    /// Open the socket, report `Established` and spawn the worker.
    pub(crate) fn start_simulated(&self) -> Result<()> {
        let Some(simulated) = self.simulated() else {
            return Ok(());
        };
        let settings = self.settings_snapshot();
        let socket = Arc::new(open_socket(&settings)?);
        *self.inner.addrs.lock() = BoundAddrs {
            local: socket.local_addr().ok(),
            remote: socket.peer_addr().ok(),
        };
        simulated.state.lock().socket = Some(Arc::clone(&socket));

        self.inner.established.store(true, std::sync::atomic::Ordering::Release);
        if settings.statistics_enabled {
            self.inner.statistic.start();
        }
        self.fire(Notice::Established);

        let session = self.clone();
        let spawned = thread::Builder::new()
            .name(registry::global().thread_name("SimulatedMulticastSession"))
            .spawn(move || session.run_worker(socket, settings));
        match spawned {
            Ok(handle) => simulated.state.lock().worker = Some(handle),
            Err(e) => {
                error!("Failed to spawn worker for session {}: {}", self.id(), e);
                self.dispatch_exception(e.into());
                self.close(false);
            }
        }
        Ok(())
    }

    fn run_worker(self, socket: Arc<UdpSocket>, settings: Settings) {
        WORKER_SESSION.with(|worker| worker.set(Some(self.id())));
        debug!("Session {} worker running", self.id());

        let recognizer: Arc<dyn MessageRecognizer> = settings.recognizer;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut idle = Duration::ZERO;

        while self.is_available() {
            let clock = ElapsedTime::new();
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    idle = Duration::ZERO;
                    if settings.statistics_enabled {
                        self.fire(Notice::StatReceived(n as u64));
                    }
                    match self.recognize_datagram(recognizer.as_ref(), &buf[..n], peer) {
                        Ok(Some(message)) => self.fire(Notice::Received(message)),
                        Ok(None) => {}
                        Err(e) => self.dispatch_exception(e),
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    idle += clock.elapsed();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.is_available() {
                        self.dispatch_exception(e.into());
                    }
                    break;
                }
            }

            match self.send_queued(&socket, settings.statistics_enabled) {
                Ok(true) => idle = Duration::ZERO,
                Ok(false) => {}
                Err(e) => {
                    if self.is_available() {
                        self.dispatch_exception(e.into());
                    }
                    break;
                }
            }

            if !settings.session_timeout.is_zero() && idle >= settings.session_timeout {
                idle = Duration::ZERO;
                self.fire(Notice::Timeout);
            }
        }

        debug!("Session {} worker exiting", self.id());
        self.close(false);
        WORKER_SESSION.with(|worker| worker.set(None));
    }

    /// Send everything queued. `Ok(true)` if anything was sent.
    fn send_queued(&self, socket: &UdpSocket, statistics: bool) -> io::Result<bool> {
        let mut sent_any = false;
        while let Some(write) = self.inner.writes.pop_front() {
            let Some(message) = write.message else {
                continue;
            };
            let segments = match guarded("message encoding", || message.to_segments()) {
                Ok(segments) => segments,
                Err(e) => {
                    if let Some(tx) = write.receipt {
                        let _ = tx.send(false);
                    }
                    self.dispatch_exception(e);
                    continue;
                }
            };
            let datagram = buffer::gather(&segments);
            let n = match (socket.peer_addr().is_ok(), message.peer_addr()) {
                (false, Some(target)) => socket.send_to(&datagram, target)?,
                _ => socket.send(&datagram)?,
            };
            if statistics {
                self.fire(Notice::StatSent(n as u64));
            }
            sent_any = true;
            self.fire(Notice::Sent(message, write.receipt));
        }
        if sent_any {
            self.fire(Notice::Idle);
        }
        Ok(sent_any)
    }

    /// Blocking write issued from the worker thread itself.
    pub(crate) fn send_inline(&self, receipt: &mut WriteReceipt) -> bool {
        let socket = self
            .simulated()
            .and_then(|simulated| simulated.state.lock().socket.clone());
        let Some(socket) = socket else {
            return false;
        };
        if let Err(e) = self.send_queued(&socket, self.is_statistics_enabled()) {
            self.dispatch_exception(e.into());
            self.close(false);
        }
        receipt.try_result().unwrap_or(false)
    }

    /// Stop the worker and tear the session down.
    pub(crate) fn close_simulated(&self) {
        let (socket, worker) = match self.simulated() {
            Some(simulated) => {
                let mut state = simulated.state.lock();
                (state.socket.take(), state.worker.take())
            }
            None => (None, None),
        };
        drop(socket);
        if let Some(worker) = worker {
            if !self.on_simulated_worker() && worker.join().is_err() {
                error!("Worker of session {} terminated abnormally", self.id());
            }
        }
        self.finish_teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_marker_is_per_session() {
        let a = Session::multicast();
        let b = Session::multicast();
        assert!(!a.on_simulated_worker());
        WORKER_SESSION.with(|worker| worker.set(Some(a.id())));
        assert!(a.on_simulated_worker());
        assert!(!b.on_simulated_worker());
        WORKER_SESSION.with(|worker| worker.set(None));
    }

    #[test]
    fn test_open_socket_without_group() {
        let session = Session::multicast();
        session.set_local_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        let socket = open_socket(&session.settings_snapshot()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
