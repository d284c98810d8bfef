//! The metric poller.
//!
//! One logical component owns the platform-dispatched source list: external
//! layers register [`MonitorSource`] implementations through `subscribe`,
//! and a dedicated thread polls every source on a fixed cadence. Source
//! errors are logged and swallowed; a source can never take the poller down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::MetricRegistry;

/// A pollable producer of metric samples (console counters, runtime event
/// sources, platform probes).
pub trait MonitorSource: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;
    /// Called on every poll tick; records samples through the registry.
    fn poll(&self, registry: &MetricRegistry, timestamp: OffsetDateTime) -> Result<()>;
}

struct MonitorState {
    sources: Mutex<Vec<Arc<dyn MonitorSource>>>,
    stop_gate: Mutex<bool>,
    stop_signal: Condvar,
    stopped: AtomicBool,
}

/// Handle to the poller thread.
pub struct Monitor {
    state: Arc<MonitorState>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Monitor {
    /// Spawns the poller against a registry.
    pub fn spawn(registry: Arc<MetricRegistry>, poll_interval: Duration) -> Result<Self> {
        let state = Arc::new(MonitorState {
            sources: Mutex::new(Vec::new()),
            stop_gate: Mutex::new(false),
            stop_signal: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("lantern-monitor".into())
            .spawn(move || run(worker_state, registry, poll_interval))
            .map_err(std::io::Error::from)?;
        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    /// Registers a source; it is polled starting with the next tick.
    pub fn subscribe(&self, source: Arc<dyn MonitorSource>) {
        self.state
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(source);
    }

    /// Stops the poller and waits for the thread to exit.
    pub fn shutdown(&mut self) {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut gate = self
                .state
                .stop_gate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *gate = true;
            self.state.stop_signal.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(state: Arc<MonitorState>, registry: Arc<MetricRegistry>, poll_interval: Duration) {
    loop {
        {
            let gate = state
                .stop_gate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let (gate, _timeout) = state
                .stop_signal
                .wait_timeout_while(gate, poll_interval, |stop| !*stop)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *gate {
                break;
            }
        }
        let timestamp = OffsetDateTime::now_utc();
        let sources = state
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for source in sources {
            if let Err(err) = source.poll(&registry, timestamp) {
                warn!(source = source.name(), error = %err, "monitor.poll.source_failed");
            }
        }
    }
    debug!("monitor.stopped");
}
