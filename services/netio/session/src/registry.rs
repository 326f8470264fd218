//! Process-wide registry.
//!
//! Owns the tunable defaults, the session id counter, thread name counters
//! and the shared auto-closing event generator used by sessions that are not
//! given one explicitly. Initialise it with [`init`] before creating sessions
//! to override the defaults; otherwise [`global`] loads them lazily.

use crate::config::Defaults;
use crate::error::{Result, SessionError};
use crate::generator::EventGenerator;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::warn;

static REGISTRY: OnceCell<Registry> = OnceCell::new();

/// Shared process state for the session layer.
#[derive(Debug)]
pub struct Registry {
    defaults: Defaults,
    next_session_id: AtomicU64,
    thread_counters: DashMap<&'static str, AtomicUsize>,
    shared_generator: OnceCell<EventGenerator>,
}

/// Install the registry with explicit defaults.
///
/// Fails if the registry was already initialised, explicitly or by a
/// session created earlier.
pub fn init(defaults: Defaults) -> Result<&'static Registry> {
    let mut installed = false;
    let registry = REGISTRY.get_or_init(|| {
        installed = true;
        Registry::new(defaults)
    });
    if installed {
        Ok(registry)
    } else {
        Err(SessionError::IllegalState("registry already initialised"))
    }
}

/// The process registry, loading defaults on first use.
pub fn global() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let defaults = Defaults::load().unwrap_or_else(|e| {
            warn!("Failed to load session defaults, using built-in values: {}", e);
            Defaults::default()
        });
        Registry::new(defaults)
    })
}

impl Registry {
    fn new(defaults: Defaults) -> Self {
        Self {
            defaults,
            next_session_id: AtomicU64::new(0),
            thread_counters: DashMap::new(),
            shared_generator: OnceCell::new(),
        }
    }

    /// Tunable defaults.
    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Allocate the next session id.
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Next number in the per-prefix thread counter.
    pub fn next_thread_index(&self, prefix: &'static str) -> usize {
        self.thread_counters
            .entry(prefix)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Build a numbered thread name such as `PooledDispatcher-3`.
    pub fn thread_name(&self, prefix: &'static str) -> String {
        format!("{}-{}", prefix, self.next_thread_index(prefix))
    }

    /// The auto-closing generator shared by sessions without their own.
    pub fn shared_generator(&self) -> &EventGenerator {
        self.shared_generator.get_or_init(EventGenerator::auto_close)
    }
}
