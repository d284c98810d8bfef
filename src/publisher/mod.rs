//! The concurrent packet ingress.
//!
//! `publish` is callable from any thread. Batches are stamped, counted, and
//! fanned out to in-process subscribers under one ingress lock, which makes
//! enqueue order, sequence order, subscriber order, and on-disk order the
//! same total order. `Queued` publishes never wait on I/O; `WaitForCommit`
//! parks the caller on a commit notifier until the spool has synced past the
//! batch.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::Result;
use crate::fragment::spool::{is_spool_thread, CommitNotifier, SpoolRequest};
use crate::packet::{Packet, PacketBody, ThreadInfo};
use crate::session::{current_thread_id, SessionContext};

const MAX_CONSECUTIVE_OBSERVER_ERRORS: u32 = 5;

/// How a publish call relates to durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Enqueue and return; durability follows eventually.
    Queued,
    /// Block until the fragment writer has synced past this batch.
    WaitForCommit,
}

/// In-process packet subscriber.
///
/// Handlers run synchronously inside `publish` and receive batches in commit
/// order; they must not block. A handler that fails enough consecutive
/// deliveries is dropped.
pub trait PacketObserver: Send + Sync {
    /// Receives one stamped batch.
    fn on_packets(&self, packets: &[Packet]) -> Result<()>;
}

/// Hook resolving a user name to a principal, invoked at most once per
/// distinct name per session. An error is swallowed and cached as a negative
/// result.
pub trait ResolveUserPrincipal: Send + Sync {
    /// Returns the principal for `user_name`.
    fn resolve(&self, user_name: &str) -> Result<String>;
}

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct SubscriberEntry {
    id: u64,
    observer: Arc<dyn PacketObserver>,
    consecutive_errors: u32,
}

thread_local! {
    // Set while a resolve hook runs on this thread; a publish from inside
    // the hook skips resolution instead of recursing.
    static IN_RESOLVE: Cell<bool> = const { Cell::new(false) };
}

/// The session's single packet ingress.
pub struct Publisher {
    context: Arc<SessionContext>,
    // The ingress lock defines the total publication order.
    ingress: Mutex<()>,
    sender: Mutex<Option<Sender<SpoolRequest>>>,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_subscriber_id: AtomicU64,
    anonymous: bool,
    resolver: Mutex<Option<Arc<dyn ResolveUserPrincipal>>>,
    principal_cache: Mutex<HashMap<String, Option<String>>>,
    ending: AtomicBool,
    closed: AtomicBool,
}

impl Publisher {
    /// Builds a publisher. `sender` is `None` when session files are
    /// disabled; stamping and fan-out still run.
    pub(crate) fn new(
        context: Arc<SessionContext>,
        sender: Option<Sender<SpoolRequest>>,
        anonymous: bool,
    ) -> Self {
        Self {
            context,
            ingress: Mutex::new(()),
            sender: Mutex::new(sender),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            anonymous,
            resolver: Mutex::new(None),
            principal_cache: Mutex::new(HashMap::new()),
            ending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The session context packets are stamped against.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Installs the user-resolution hook.
    pub fn set_resolver(&self, resolver: Arc<dyn ResolveUserPrincipal>) {
        *self.resolver.lock() = Some(resolver);
    }

    /// Registers a subscriber; it will see every batch published afterwards.
    pub fn subscribe(&self, observer: Arc<dyn PacketObserver>) -> SubscriptionId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(SubscriberEntry {
            id,
            observer,
            consecutive_errors: 0,
        });
        SubscriptionId(id)
    }

    /// Removes a subscriber; a no-op when already dropped.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.subscribers
            .lock()
            .retain(|entry| entry.id != subscription.0);
    }

    /// Once set, later `Queued` publishes become synchronous so final
    /// messages reach disk before the process exits.
    pub(crate) fn mark_ending(&self) {
        self.ending.store(true, Ordering::Release);
    }

    /// After the writer has exited: publishes become no-ops.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Stamps and publishes a batch.
    ///
    /// Never fails: a log call must not break the host application. Internal
    /// problems are logged and surface through status flags.
    pub fn publish(&self, packets: Vec<Packet>, mode: PublishMode) {
        if packets.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut effective_mode = mode;
        if is_spool_thread() {
            // The spool must never park on its own queue.
            effective_mode = PublishMode::Queued;
        } else if self.ending.load(Ordering::Acquire) {
            effective_mode = PublishMode::WaitForCommit;
        }

        let notifier = {
            let _order = self.ingress.lock();
            let outgoing = self.stamp_batch(packets);
            self.fan_out(&outgoing);
            let notifier = match effective_mode {
                PublishMode::Queued => None,
                PublishMode::WaitForCommit => Some(CommitNotifier::new()),
            };
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => {
                    let request = SpoolRequest {
                        packets: outgoing,
                        notifier: notifier.clone(),
                    };
                    if sender.send(request).is_err() {
                        debug!("publisher.enqueue.writer_gone");
                        if let Some(notifier) = &notifier {
                            notifier.notify();
                        }
                    }
                }
                None => {
                    if let Some(notifier) = &notifier {
                        notifier.notify();
                    }
                }
            }
            notifier
        };
        // Park outside the ingress lock so queued publishers never wait on
        // this caller's fsync.
        if let Some(notifier) = notifier {
            notifier.wait();
        }
    }

    fn stamp_batch(&self, packets: Vec<Packet>) -> Vec<Packet> {
        let (thread_index, newly_registered) = self.context.register_thread();
        let thread_id = current_thread_id();
        let mut outgoing = Vec::with_capacity(packets.len() + 1);
        if newly_registered {
            let caption = std::thread::current()
                .name()
                .unwrap_or_default()
                .to_owned();
            let mut info = Packet::new(PacketBody::ThreadInfo(ThreadInfo {
                thread_index,
                thread_id,
                caption,
            }));
            self.stamp_one(&mut info, thread_index, thread_id);
            outgoing.push(info);
        }
        for mut packet in packets {
            self.stamp_one(&mut packet, thread_index, thread_id);
            outgoing.push(packet);
        }
        outgoing
    }

    fn stamp_one(&self, packet: &mut Packet, thread_index: u32, thread_id: u64) {
        if !packet.header.has_timestamp() {
            packet.header.timestamp = OffsetDateTime::now_utc();
        }
        packet.header.sequence = self.context.next_sequence();
        packet.header.thread_index = thread_index;
        packet.header.thread_id = thread_id;

        match &mut packet.body {
            PacketBody::Log(log) => {
                if log.caption.is_empty() {
                    log.caption = log.normalized_caption().to_owned();
                }
                if self.anonymous {
                    log.user_name = None;
                    log.user_principal = None;
                } else if log.user_principal.is_none() {
                    if let Some(user_name) = log.user_name.clone() {
                        log.user_principal = self.resolve_principal(&user_name);
                    }
                }
                self.context
                    .record_message(log.severity, packet.header.timestamp);
            }
            _ => self.context.touch(packet.header.timestamp),
        }
    }

    fn resolve_principal(&self, user_name: &str) -> Option<String> {
        if let Some(cached) = self.principal_cache.lock().get(user_name) {
            return cached.clone();
        }
        if IN_RESOLVE.with(|flag| flag.get()) {
            // The hook published a packet with a user name of its own; do
            // not recurse.
            return None;
        }
        let resolver = self.resolver.lock().clone();
        let resolver = resolver?;
        IN_RESOLVE.with(|flag| flag.set(true));
        let outcome = resolver.resolve(user_name);
        IN_RESOLVE.with(|flag| flag.set(false));
        let resolved = match outcome {
            Ok(principal) => Some(principal),
            Err(err) => {
                warn!(user_name, error = %err, "publisher.resolve_user.failed");
                None
            }
        };
        self.principal_cache
            .lock()
            .insert(user_name.to_owned(), resolved.clone());
        resolved
    }

    fn fan_out(&self, packets: &[Packet]) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|entry| {
            match entry.observer.on_packets(packets) {
                Ok(()) => {
                    entry.consecutive_errors = 0;
                    true
                }
                Err(err) => {
                    entry.consecutive_errors += 1;
                    warn!(
                        subscriber = entry.id,
                        consecutive = entry.consecutive_errors,
                        error = %err,
                        "publisher.subscriber.delivery_failed"
                    );
                    entry.consecutive_errors < MAX_CONSECUTIVE_OBSERVER_ERRORS
                }
            }
        });
    }
}
