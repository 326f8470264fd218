//! Serializable views of session state for diagnostics.

use crate::session::{Session, SessionKind};
use crate::statistic::StatisticSnapshot;
use serde::Serialize;
use std::net::SocketAddr;

/// Point-in-time session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: u64,
    /// Session kind
    pub kind: SessionKind,
    /// Started and not torn down
    pub started: bool,
    /// Close requested, teardown pending
    pub closing: bool,
    /// Accepting writes
    pub available: bool,
    /// Transport connected or bound
    pub established: bool,
    /// TLS handshake state; absent for plain sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_completed: Option<bool>,
    /// Application writes waiting
    pub write_queue_size: usize,
    /// Local address
    pub local_addr: Option<SocketAddr>,
    /// Remote address
    pub remote_addr: Option<SocketAddr>,
    /// Traffic statistics, when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistic: Option<StatisticSnapshot>,
    /// Open children of a listener
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_sessions: Option<usize>,
}

impl Session {
    /// Capture the session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id(),
            kind: self.kind(),
            started: self.is_started(),
            closing: self.is_closing(),
            available: self.is_available(),
            established: self.is_established(),
            handshake_completed: (self.kind() == SessionKind::Tls).then(|| self.is_handshake_completed()),
            write_queue_size: self.write_queue_size(),
            local_addr: self.local_addr(),
            remote_addr: self.remote_addr(),
            statistic: self.statistic().map(|s| s.snapshot()),
            connected_sessions: (self.kind() == SessionKind::Listener)
                .then(|| self.connected_sessions().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_session_snapshot() {
        let session = Session::tcp();
        session.set_remote_addr("127.0.0.1:7000".parse().unwrap()).unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.kind, SessionKind::Tcp);
        assert!(!snapshot.started);
        assert!(!snapshot.available);
        assert_eq!(snapshot.remote_addr, Some("127.0.0.1:7000".parse().unwrap()));
        assert!(snapshot.statistic.is_none());
        assert!(snapshot.connected_sessions.is_none());
    }

    #[test]
    fn test_snapshot_serializes() {
        let listener = Session::listener();
        listener.set_statistics_enabled(true).unwrap();
        let json = serde_json::to_value(listener.snapshot()).unwrap();
        assert_eq!(json["kind"], "listener");
        assert_eq!(json["connected_sessions"], 0);
        assert_eq!(json["statistic"]["received_bytes"], 0);
        assert!(json.get("handshake_completed").is_none());
    }
}
