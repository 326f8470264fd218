//! Non-blocking transports driven by an event generator.
//!
//! Each variant wraps a `mio` source. The session engine only talks to the
//! transport through the primitives here: registration, stream and packet
//! I/O, accept and connect completion.

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

#[cfg(unix)]
use mio::unix::pipe;

#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const EINPROGRESS: i32 = 36;
#[cfg(not(unix))]
const EINPROGRESS: i32 = -1;

pub(crate) enum Transport {
    /// Connected or connecting TCP stream
    Stream(TcpStream),
    /// UDP socket, optionally connected to one peer
    Datagram { socket: UdpSocket, connected: bool },
    /// In-process loopback: bytes written to the sender come back on the
    /// receiver
    #[cfg(unix)]
    Pipe {
        sender: pipe::Sender,
        receiver: pipe::Receiver,
    },
    /// Passive TCP listener
    Listener(TcpListener),
}

/// Unspecified address of the same family as `other`, port 0.
pub(crate) fn any_addr(other: Option<SocketAddr>) -> SocketAddr {
    match other {
        Some(SocketAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    }
}

impl Transport {
    /// Start a non-blocking connect, optionally from a fixed local address.
    pub(crate) fn connect(local: Option<SocketAddr>, remote: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        if let Some(local) = local {
            socket.set_reuse_address(true)?;
            socket.bind(&local.into())?;
        }
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        Ok(Transport::Stream(TcpStream::from_std(socket.into())))
    }

    /// Wrap an accepted stream.
    pub(crate) fn adopt(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on accepted stream: {}", e);
        }
        Transport::Stream(stream)
    }

    pub(crate) fn bind_udp(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind(local.unwrap_or_else(|| any_addr(remote)))?;
        if let Some(remote) = remote {
            socket.connect(remote)?;
        }
        Ok(Transport::Datagram {
            socket,
            connected: remote.is_some(),
        })
    }

    #[cfg(unix)]
    pub(crate) fn pipe() -> io::Result<Self> {
        let (sender, receiver) = pipe::new()?;
        Ok(Transport::Pipe { sender, receiver })
    }

    pub(crate) fn listen(local: Option<SocketAddr>) -> io::Result<Self> {
        Ok(Transport::Listener(TcpListener::bind(local.unwrap_or_else(|| any_addr(None)))?))
    }

    pub(crate) fn is_packet(&self) -> bool {
        matches!(self, Transport::Datagram { .. })
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Transport::Stream(stream) => registry.register(stream, token, interest),
            Transport::Datagram { socket, .. } => registry.register(socket, token, interest),
            #[cfg(unix)]
            Transport::Pipe { sender, receiver } => {
                // The sender stays registered for writability; spurious
                // writable events with an empty queue are ignored.
                registry.register(receiver, token, Interest::READABLE)?;
                registry.register(sender, token, Interest::WRITABLE)
            }
            Transport::Listener(listener) => registry.register(listener, token, interest),
        }
    }

    pub(crate) fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Transport::Stream(stream) => registry.reregister(stream, token, interest),
            Transport::Datagram { socket, .. } => registry.reregister(socket, token, interest),
            #[cfg(unix)]
            Transport::Pipe { .. } => Ok(()),
            Transport::Listener(listener) => registry.reregister(listener, token, interest),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Stream(stream) => registry.deregister(stream),
            Transport::Datagram { socket, .. } => registry.deregister(socket),
            #[cfg(unix)]
            Transport::Pipe { sender, receiver } => {
                let receiver_result = registry.deregister(receiver);
                registry.deregister(sender).and(receiver_result)
            }
            Transport::Listener(listener) => registry.deregister(listener),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Stream(stream) => stream.read(buf),
            #[cfg(unix)]
            Transport::Pipe { receiver, .. } => receiver.read(buf),
            _ => Err(unsupported("read")),
        }
    }

    pub(crate) fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Transport::Stream(stream) => stream.write_vectored(bufs),
            #[cfg(unix)]
            Transport::Pipe { sender, .. } => sender.write_vectored(bufs),
            _ => Err(unsupported("write")),
        }
    }

    pub(crate) fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            Transport::Datagram { socket, .. } => socket.recv_from(buf),
            _ => Err(unsupported("recv_from")),
        }
    }

    /// Send one datagram, to `target` when the socket is not connected.
    pub(crate) fn send(&mut self, buf: &[u8], target: Option<SocketAddr>) -> io::Result<usize> {
        match self {
            Transport::Datagram { socket, connected: true } => socket.send(buf),
            Transport::Datagram { socket, connected: false } => match target {
                Some(target) => socket.send_to(buf, target),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "datagram without destination on unconnected socket",
                )),
            },
            _ => Err(unsupported("send")),
        }
    }

    pub(crate) fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self {
            Transport::Listener(listener) => listener.accept(),
            _ => Err(unsupported("accept")),
        }
    }

    /// Resolve a pending connect: `Ok(true)` once connected, `Ok(false)` if
    /// still in progress.
    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        let Transport::Stream(stream) = self else {
            return Ok(true);
        };
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Stream(stream) => stream.local_addr().ok(),
            Transport::Datagram { socket, .. } => socket.local_addr().ok(),
            #[cfg(unix)]
            Transport::Pipe { .. } => None,
            Transport::Listener(listener) => listener.local_addr().ok(),
        }
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Stream(stream) => stream.peer_addr().ok(),
            Transport::Datagram { socket, connected: true } => socket.peer_addr().ok(),
            _ => None,
        }
    }
}

/// Drop an accepted stream with linger off so it does not sit in
/// `TIME_WAIT`.
pub(crate) fn discard(stream: TcpStream) {
    if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        tracing::debug!("Failed to disable linger on discarded stream: {}", e);
    }
}

fn unsupported(op: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("{} not supported by this transport", op))
}
