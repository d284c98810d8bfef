//! The fragment writer thread.
//!
//! The spool is the single consumer of the publisher queue. It appends
//! packets to the currently-open fragment, rotates on size, age, or an
//! explicit `CloseFile` command, rewrites the header heartbeat on a timer,
//! and terminates on `ExitMode`. Callers that published with
//! `WaitForCommit` are woken only after file data has been synced.
//!
//! On an I/O failure the spool attempts one reopen under a fresh file name;
//! a second failure puts the session into the degraded state where packets
//! are dropped but counted.

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::FragmentFile;
use crate::error::Result;
use crate::packet::{Command, FragmentInfo, Packet, PacketBody, ThreadInfo};
use crate::session::{current_thread_id, SessionContext};

thread_local! {
    static IS_SPOOL_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_spool_thread() {
    IS_SPOOL_THREAD.with(|flag| flag.set(true));
}

/// True on the spool's own thread. A `WaitForCommit` publish from here would
/// deadlock, so the publisher downgrades it to `Queued`.
pub(crate) fn is_spool_thread() -> bool {
    IS_SPOOL_THREAD.with(|flag| flag.get())
}

/// Wakes a `WaitForCommit` caller once its batch is durably on disk.
#[derive(Clone, Debug)]
pub(crate) struct CommitNotifier {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl CommitNotifier {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub(crate) fn notify(&self) {
        let (lock, cvar) = &*self.state;
        let mut done = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *done = true;
        cvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut done = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*done {
            done = cvar
                .wait(done)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// One unit of work for the spool.
#[derive(Debug)]
pub(crate) struct SpoolRequest {
    pub(crate) packets: Vec<Packet>,
    pub(crate) notifier: Option<CommitNotifier>,
}

/// Rotation and flush thresholds.
#[derive(Debug, Clone)]
pub struct SpoolOptions {
    /// Rotate when the open fragment reaches this size.
    pub max_size_bytes: u64,
    /// Rotate when the open fragment reaches this age.
    pub max_age: time::Duration,
    /// Header heartbeat cadence while idle.
    pub auto_flush_interval: Duration,
}

impl Default for SpoolOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 20 * 1024 * 1024,
            max_age: time::Duration::hours(24),
            auto_flush_interval: Duration::from_secs(15),
        }
    }
}

/// Handle to the spool thread, owned by the coordinator.
#[derive(Debug)]
pub(crate) struct FragmentSpool {
    sender: Option<Sender<SpoolRequest>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FragmentSpool {
    /// Opens fragment 0 (so startup failures surface to `init`) and spawns
    /// the writer thread.
    pub(crate) fn spawn(
        dir: PathBuf,
        context: Arc<SessionContext>,
        options: SpoolOptions,
    ) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let first = FragmentFile::create(&dir, &context, 0, now)?;
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("lantern-spool".into())
            .spawn(move || {
                let mut worker = SpoolWorker {
                    dir,
                    context,
                    options,
                    current: Some(first),
                    next_sequence: 1,
                    degraded: false,
                    recovering: false,
                    needs_preamble: true,
                    metric_definitions: Vec::new(),
                };
                worker.run(receiver);
            })
            .map_err(std::io::Error::from)?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// A sender the publisher enqueues through.
    pub(crate) fn sender(&self) -> Option<Sender<SpoolRequest>> {
        self.sender.clone()
    }

    /// Drops the queue and waits for the worker to drain and finalize.
    pub(crate) fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("spool.shutdown.worker_panicked");
            }
        }
    }
}

impl Drop for FragmentSpool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SpoolWorker {
    dir: PathBuf,
    context: Arc<SessionContext>,
    options: SpoolOptions,
    current: Option<FragmentFile>,
    next_sequence: u32,
    degraded: bool,
    // Guards against append failures inside the recovery path itself.
    recovering: bool,
    // Fragment 0 is created on the caller's thread; its session-info and
    // fragment-info packets are stamped here so they carry the spool
    // thread's identity like every later preamble.
    needs_preamble: bool,
    // Metric definitions seen so far, re-emitted after rotation so every
    // fragment is readable on its own.
    metric_definitions: Vec<Packet>,
}

impl SpoolWorker {
    fn run(&mut self, receiver: Receiver<SpoolRequest>) {
        mark_spool_thread();
        if self.needs_preamble {
            self.write_preamble();
            self.needs_preamble = false;
        }
        loop {
            match receiver.recv_timeout(self.options.auto_flush_interval) {
                Ok(first) => {
                    let mut pending = vec![first];
                    while let Ok(request) = receiver.try_recv() {
                        pending.push(request);
                    }
                    let mut notifiers = Vec::new();
                    let mut exit = false;
                    for request in pending {
                        if let Some(notifier) = request.notifier.clone() {
                            notifiers.push(notifier);
                        }
                        if self.handle_packets(request.packets) {
                            exit = true;
                            break;
                        }
                    }
                    if exit {
                        self.finalize_current();
                        for notifier in &notifiers {
                            notifier.notify();
                        }
                        Self::drain_after_exit(&receiver, &self.context);
                        break;
                    }
                    if !notifiers.is_empty() {
                        self.flush_current();
                        for notifier in &notifiers {
                            notifier.notify();
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Heartbeat so a crashed session's last end time stays
                    // close to the truth.
                    self.context.touch(OffsetDateTime::now_utc());
                    self.flush_current();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finalize_current();
                    break;
                }
            }
        }
        debug!("spool.worker.stopped");
    }

    // Returns true when an exit command was consumed.
    fn handle_packets(&mut self, packets: Vec<Packet>) -> bool {
        for packet in packets {
            match &packet.body {
                PacketBody::Command(command) => match command.command {
                    Command::CloseFile => {
                        info!(reason = %command.reason, "spool.rotate.requested");
                        self.rotate();
                    }
                    Command::ExitMode(status) => {
                        info!(
                            reason = %command.reason,
                            ?status,
                            "spool.exit.requested"
                        );
                        self.context.advance_status(status);
                        return true;
                    }
                },
                _ => {
                    if matches!(packet.body, PacketBody::MetricDefinition(_)) {
                        self.metric_definitions.push(packet.clone());
                    }
                    self.append(&packet);
                    self.maybe_rotate();
                }
            }
        }
        false
    }

    fn append(&mut self, packet: &Packet) {
        if self.degraded {
            self.context.add_packets_lost(1);
            return;
        }
        let failed = match self.current.as_mut() {
            Some(fragment) => fragment.append(packet).is_err(),
            None => true,
        };
        if failed {
            self.recover_append(packet);
        }
    }

    // One reopen attempt under a fresh file name, then degraded mode.
    fn recover_append(&mut self, packet: &Packet) {
        if self.recovering {
            // The reopen attempt itself failed to write; give up.
            self.enter_degraded();
            self.context.add_packets_lost(1);
            return;
        }
        warn!("spool.append.io_failure");
        self.recovering = true;
        self.current = None;
        match FragmentFile::create(
            &self.dir,
            &self.context,
            self.next_sequence,
            OffsetDateTime::now_utc(),
        ) {
            Ok(fragment) => {
                self.next_sequence += 1;
                self.current = Some(fragment);
                self.write_preamble();
                let recovered = self
                    .current
                    .as_mut()
                    .map(|fragment| fragment.append(packet).is_ok())
                    .unwrap_or(false);
                if !recovered {
                    self.enter_degraded();
                    self.context.add_packets_lost(1);
                }
            }
            Err(err) => {
                error!(error = %err, "spool.reopen.failed");
                self.enter_degraded();
                self.context.add_packets_lost(1);
            }
        }
        self.recovering = false;
    }

    fn enter_degraded(&mut self) {
        if !self.degraded {
            error!("spool.degraded.entered");
            self.degraded = true;
            self.context.set_degraded();
            self.current = None;
        }
    }

    fn maybe_rotate(&mut self) {
        let now = OffsetDateTime::now_utc();
        let due = match self.current.as_ref() {
            Some(fragment) => {
                fragment.size() >= self.options.max_size_bytes
                    || fragment.age(now) >= self.options.max_age
            }
            None => false,
        };
        if due {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        if self.degraded {
            return;
        }
        let now = OffsetDateTime::now_utc();
        if let Some(fragment) = self.current.take() {
            let counters = self.context.counters();
            if let Err(err) = fragment.finalize(&counters, now) {
                warn!(error = %err, "spool.rotate.finalize_failed");
            }
        }
        match FragmentFile::create(&self.dir, &self.context, self.next_sequence, now) {
            Ok(fragment) => {
                debug!(file_sequence = self.next_sequence, "spool.rotate.opened");
                self.next_sequence += 1;
                self.current = Some(fragment);
                self.write_preamble();
            }
            Err(err) => {
                error!(error = %err, "spool.rotate.open_failed");
                self.enter_degraded();
            }
        }
    }

    // Session summary and fragment marker, first records of every fragment.
    fn write_preamble(&mut self) {
        let Some(fragment) = self.current.as_ref() else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        let fragment_info = FragmentInfo {
            fragment_id: fragment.fragment_id(),
            file_sequence: fragment.file_sequence(),
            fragment_start_time: now,
        };
        let (thread_index, newly_registered) = self.context.register_thread();
        let thread_id = current_thread_id();
        let mut bodies = vec![
            PacketBody::SessionInfo(self.context.summary().clone()),
            PacketBody::FragmentInfo(fragment_info),
        ];
        if newly_registered {
            bodies.insert(
                0,
                PacketBody::ThreadInfo(ThreadInfo {
                    thread_index,
                    thread_id,
                    caption: "lantern-spool".into(),
                }),
            );
        }
        for body in bodies {
            let mut packet = Packet::new(body);
            packet.header.sequence = self.context.next_sequence();
            packet.header.timestamp = now;
            packet.header.thread_index = thread_index;
            packet.header.thread_id = thread_id;
            self.append(&packet);
        }
        let rotated = self
            .current
            .as_ref()
            .map(|fragment| fragment.file_sequence() > 0)
            .unwrap_or(false);
        if rotated && !self.metric_definitions.is_empty() {
            let definitions = std::mem::take(&mut self.metric_definitions);
            for packet in &definitions {
                self.append(packet);
            }
            self.metric_definitions = definitions;
        }
    }

    fn flush_current(&mut self) {
        let counters = self.context.counters();
        let now = OffsetDateTime::now_utc();
        let failed = match self.current.as_mut() {
            Some(fragment) => fragment.flush(&counters, now).is_err(),
            None => false,
        };
        if failed {
            warn!("spool.flush.io_failure");
            self.enter_degraded();
        }
    }

    fn finalize_current(&mut self) {
        if let Some(fragment) = self.current.take() {
            let counters = self.context.counters();
            let now = OffsetDateTime::now_utc();
            match fragment.finalize(&counters, now) {
                Ok(path) => info!(path = %path.display(), "spool.finalized"),
                Err(err) => error!(error = %err, "spool.finalize.failed"),
            }
        }
    }

    // Requests that raced past an exit command are dropped, counted, and
    // their waiters woken so nobody blocks on a dead writer.
    fn drain_after_exit(receiver: &Receiver<SpoolRequest>, context: &SessionContext) {
        while let Ok(request) = receiver.try_recv() {
            let lost = request
                .packets
                .iter()
                .filter(|packet| !matches!(packet.body, PacketBody::Command(_)))
                .count() as u64;
            if lost > 0 {
                context.add_packets_lost(lost);
            }
            if let Some(notifier) = request.notifier {
                notifier.notify();
            }
        }
    }
}
