//! Per-session traffic statistics.

use crate::listener::{ListenerSet, StatisticListener};
use crate::session::Session;
use netio_util::Speed;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Rolling byte counters and throughput for one session.
///
/// Counters reset when the session is established; once it closes the
/// average speeds and elapsed time are frozen until the next start.
#[derive(Default)]
pub struct SessionStatistic {
    state: Mutex<StatState>,
    listeners: ListenerSet<dyn StatisticListener>,
}

#[derive(Default)]
struct StatState {
    running: bool,
    received: Speed,
    sent: Speed,
    frozen_avg_receive: f64,
    frozen_avg_send: f64,
    frozen_elapsed: Duration,
}

/// Point-in-time statistic values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticSnapshot {
    /// Bytes read since start
    pub received_bytes: u64,
    /// Bytes written since start
    pub sent_bytes: u64,
    /// Milliseconds since start, frozen at stop
    pub elapsed_ms: u64,
    /// Average receive throughput in bytes per second
    pub avg_receive_speed: f64,
    /// Average send throughput in bytes per second
    pub avg_send_speed: f64,
    /// Recent receive throughput in bytes per second
    pub receive_speed: f64,
    /// Recent send throughput in bytes per second
    pub send_speed: f64,
}

impl SessionStatistic {
    /// Bytes read since the last start.
    pub fn received_bytes(&self) -> u64 {
        self.state.lock().received.total()
    }

    /// Bytes written since the last start.
    pub fn sent_bytes(&self) -> u64 {
        self.state.lock().sent.total()
    }

    /// Time since the last start, frozen once stopped.
    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock();
        if state.running {
            state.received.elapsed()
        } else {
            state.frozen_elapsed
        }
    }

    /// Average receive throughput in bytes per second.
    pub fn avg_receive_speed(&self) -> f64 {
        let state = self.state.lock();
        if state.running {
            state.received.avg_speed()
        } else {
            state.frozen_avg_receive
        }
    }

    /// Average send throughput in bytes per second.
    pub fn avg_send_speed(&self) -> f64 {
        let state = self.state.lock();
        if state.running {
            state.sent.avg_speed()
        } else {
            state.frozen_avg_send
        }
    }

    /// Recent receive throughput; zero while stopped.
    pub fn receive_speed(&self) -> f64 {
        let state = self.state.lock();
        if state.running {
            state.received.speed()
        } else {
            0.0
        }
    }

    /// Recent send throughput; zero while stopped.
    pub fn send_speed(&self) -> f64 {
        let state = self.state.lock();
        if state.running {
            state.sent.speed()
        } else {
            0.0
        }
    }

    /// Whether the statistic is counting.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Register a listener for received/sent deltas.
    pub fn add_listener(&self, listener: Arc<dyn StatisticListener>) {
        self.listeners.add(listener);
    }

    /// Remove a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn StatisticListener>) {
        self.listeners.remove(listener);
    }

    /// Capture every value at once.
    pub fn snapshot(&self) -> StatisticSnapshot {
        let state = self.state.lock();
        let (elapsed, avg_receive, avg_send, receive, send) = if state.running {
            (
                state.received.elapsed(),
                state.received.avg_speed(),
                state.sent.avg_speed(),
                state.received.speed(),
                state.sent.speed(),
            )
        } else {
            (
                state.frozen_elapsed,
                state.frozen_avg_receive,
                state.frozen_avg_send,
                0.0,
                0.0,
            )
        };
        StatisticSnapshot {
            received_bytes: state.received.total(),
            sent_bytes: state.sent.total(),
            elapsed_ms: elapsed.as_millis() as u64,
            avg_receive_speed: avg_receive,
            avg_send_speed: avg_send,
            receive_speed: receive,
            send_speed: send,
        }
    }

    pub(crate) fn start(&self) {
        let mut state = self.state.lock();
        state.received.reset();
        state.sent.reset();
        state.frozen_avg_receive = 0.0;
        state.frozen_avg_send = 0.0;
        state.frozen_elapsed = Duration::ZERO;
        state.running = true;
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.frozen_avg_receive = state.received.avg_speed();
        state.frozen_avg_send = state.sent.avg_speed();
        state.frozen_elapsed = state.received.elapsed();
        state.running = false;
    }

    pub(crate) fn record_received(&self, session: &Session, bytes: u64) {
        if bytes == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.received.add(bytes);
        }
        self.notify(session, move |listener, session| listener.received(session, bytes));
    }

    pub(crate) fn record_sent(&self, session: &Session, bytes: u64) {
        if bytes == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.sent.add(bytes);
        }
        self.notify(session, move |listener, session| listener.sent(session, bytes));
    }

    fn notify<F>(&self, session: &Session, call: F)
    where
        F: Fn(&dyn StatisticListener, &Session) + Send + 'static,
    {
        if self.listeners.len() == 0 {
            return;
        }
        let listeners = self.listeners.snapshot();
        let target = session.clone();
        session.dispatch_task(Box::new(move || {
            for listener in listeners.iter() {
                call(&**listener, &target);
            }
        }));
    }
}
