use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use smallvec::SmallVec;
use time::OffsetDateTime;

use super::{SessionStatus, SessionSummary, Severity};

/// Snapshot of the mutable session state, taken when a fragment header is
/// written or rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounters {
    /// Session status at snapshot time.
    pub status: SessionStatus,
    /// Last observed activity, nanoseconds since the unix epoch.
    pub end_time_nanos: i64,
    /// Total log messages recorded.
    pub message_count: u64,
    /// Critical messages recorded.
    pub critical_count: u64,
    /// Error messages recorded.
    pub error_count: u64,
    /// Warning messages recorded.
    pub warning_count: u64,
    /// Information messages recorded.
    pub info_count: u64,
    /// Verbose messages recorded.
    pub verbose_count: u64,
}

// Each context gets a process-unique id so thread-local thread indexes stay
// correct when tests run several agents in one process.
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// Stable process-wide thread ids; std's ThreadId has no stable integer form.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_INDEXES: RefCell<SmallVec<[(u64, u32); 2]>> = RefCell::new(SmallVec::new());
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// A small integer identifying the calling OS thread for packet stamping.
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Shared running state of the live session.
///
/// The summary is immutable; every mutable field is an atomic updated through
/// the methods here, so the publisher, fragment writer, and coordinator all
/// observe a consistent view without a lock.
#[derive(Debug)]
pub struct SessionContext {
    context_id: u64,
    summary: SessionSummary,
    status: AtomicU8,
    end_time_nanos: AtomicI64,
    message_count: AtomicU64,
    critical_count: AtomicU64,
    error_count: AtomicU64,
    warning_count: AtomicU64,
    info_count: AtomicU64,
    verbose_count: AtomicU64,
    next_sequence: AtomicU64,
    next_thread_index: AtomicU32,
    packets_lost: AtomicU64,
    degraded: AtomicBool,
}

impl SessionContext {
    /// Wraps an immutable summary in fresh running state.
    pub fn new(summary: SessionSummary) -> Self {
        let start_nanos = summary.start_time.unix_timestamp_nanos() as i64;
        Self {
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            summary,
            status: AtomicU8::new(SessionStatus::Running.as_u8()),
            end_time_nanos: AtomicI64::new(start_nanos),
            message_count: AtomicU64::new(0),
            critical_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            warning_count: AtomicU64::new(0),
            info_count: AtomicU64::new(0),
            verbose_count: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
            next_thread_index: AtomicU32::new(1),
            packets_lost: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    /// The immutable session description.
    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Current session status.
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Advances the status monotonically; a request to move backwards is
    /// ignored. Returns the status actually in effect afterwards.
    pub fn advance_status(&self, next: SessionStatus) -> SessionStatus {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let advanced = SessionStatus::from_u8(current).advance(next);
            if advanced.as_u8() == current {
                return advanced;
            }
            match self.status.compare_exchange(
                current,
                advanced.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return advanced,
                Err(observed) => current = observed,
            }
        }
    }

    /// Records one log message and moves the end-time heartbeat forward.
    pub fn record_message(&self, severity: Severity, timestamp: OffsetDateTime) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        let counter = match severity {
            Severity::Critical => &self.critical_count,
            Severity::Error => &self.error_count,
            Severity::Warning => &self.warning_count,
            Severity::Information => &self.info_count,
            Severity::Verbose => &self.verbose_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.touch(timestamp);
    }

    /// Moves the end-time heartbeat forward; never backwards.
    pub fn touch(&self, timestamp: OffsetDateTime) {
        let nanos = timestamp.unix_timestamp_nanos() as i64;
        self.end_time_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Allocates the next per-session packet sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns this thread's index, allocating one on first use. The second
    /// element is true exactly once per OS thread, signalling that a
    /// thread-info packet should be emitted.
    pub fn register_thread(&self) -> (u32, bool) {
        THREAD_INDEXES.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some((_, index)) = slots.iter().find(|(id, _)| *id == self.context_id) {
                return (*index, false);
            }
            let index = self.next_thread_index.fetch_add(1, Ordering::Relaxed);
            slots.push((self.context_id, index));
            (index, true)
        })
    }

    /// Adds to the count of packets dropped due to decode or write failures.
    pub fn add_packets_lost(&self, count: u64) {
        self.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    /// Packets dropped so far.
    pub fn packets_lost(&self) -> u64 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    /// Marks the session degraded: the writer lost its file and could not
    /// reopen, so packets are being dropped and counted.
    pub fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    /// True once the writer has entered the degraded state.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Elapsed time between session start and the last heartbeat.
    pub fn duration(&self) -> time::Duration {
        let start = self.summary.start_time.unix_timestamp_nanos() as i64;
        let end = self.end_time_nanos.load(Ordering::Relaxed);
        time::Duration::nanoseconds(end.saturating_sub(start))
    }

    /// Takes a consistent-enough snapshot for a header rewrite. Individual
    /// counters are relaxed loads; the header is advisory between flushes.
    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            status: self.status(),
            end_time_nanos: self.end_time_nanos.load(Ordering::Relaxed),
            message_count: self.message_count.load(Ordering::Relaxed),
            critical_count: self.critical_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            warning_count: self.warning_count.load(Ordering::Relaxed),
            info_count: self.info_count.load(Ordering::Relaxed),
            verbose_count: self.verbose_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;
    use crate::session::ApplicationType;

    fn summary() -> SessionSummary {
        SessionSummary {
            id: Uuid::new_v4(),
            product: "TestP".into(),
            application: "TestA".into(),
            application_version: "1.0".into(),
            application_description: String::new(),
            environment: String::new(),
            promotion_level: String::new(),
            agent_version: "0.3.0".into(),
            host_name: "host".into(),
            user_name: "user".into(),
            os_description: "linux".into(),
            culture: "en-US".into(),
            application_type: ApplicationType::Console,
            start_time: OffsetDateTime::now_utc(),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn counters_track_severities() {
        let ctx = SessionContext::new(summary());
        let now = OffsetDateTime::now_utc();
        ctx.record_message(Severity::Warning, now);
        ctx.record_message(Severity::Warning, now);
        ctx.record_message(Severity::Error, now);
        let counters = ctx.counters();
        assert_eq!(counters.message_count, 3);
        assert_eq!(counters.warning_count, 2);
        assert_eq!(counters.error_count, 1);
        assert_eq!(counters.critical_count, 0);
    }

    #[test]
    fn status_never_regresses() {
        let ctx = SessionContext::new(summary());
        assert_eq!(ctx.advance_status(SessionStatus::Normal), SessionStatus::Normal);
        assert_eq!(
            ctx.advance_status(SessionStatus::Running),
            SessionStatus::Normal
        );
        assert_eq!(
            ctx.advance_status(SessionStatus::Crashed),
            SessionStatus::Crashed
        );
    }

    #[test]
    fn thread_indexes_are_stable_per_thread_and_context() {
        let ctx = Arc::new(SessionContext::new(summary()));
        let (first, new_first) = ctx.register_thread();
        let (again, new_again) = ctx.register_thread();
        assert!(new_first);
        assert!(!new_again);
        assert_eq!(first, again);

        let other = Arc::new(SessionContext::new(summary()));
        let (other_index, fresh) = other.register_thread();
        assert!(fresh);
        assert_eq!(other_index, 1);

        let ctx_clone = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || ctx_clone.register_thread());
        let (spawned_index, spawned_new) = handle.join().unwrap();
        assert!(spawned_new);
        assert_ne!(spawned_index, first);
    }

    #[test]
    fn sequence_is_monotonic() {
        let ctx = SessionContext::new(summary());
        let first = ctx.next_sequence();
        let second = ctx.next_sequence();
        assert!(second > first);
    }
}
