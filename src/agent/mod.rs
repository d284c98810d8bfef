//! The coordinator.
//!
//! `Agent::initialize` wires the session context, repository, fragment
//! spool, publisher, metric registry, and monitor together; `end_session`
//! tears them down in order: mark ending, emit the session close and exit
//! command, drain the writer, release the session lock. The process-wide
//! `init`/`global` functions are optional sugar over an explicit handle;
//! every component takes its dependencies as parameters.

pub mod config;

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use config::AgentConfig;

use crate::error::{AgentError, Result};
use crate::fragment::spool::{FragmentSpool, SpoolOptions};
use crate::metrics::MetricRegistry;
use crate::monitor::Monitor;
use crate::packet::{
    Command, CommandPacket, LogMessage, Packet, PacketBody, SessionClose,
};
use crate::publisher::{Publisher, PublishMode, ResolveUserPrincipal};
use crate::repository::{LocalRepository, PruneLimits, RepositoryOptions};
use crate::session::{
    ApplicationType, SessionContext, SessionStatus, SessionSummary, Severity,
};

const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Lifecycle phase of an agent handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Components are live; publish calls flow.
    Running,
    /// `end_session` is flushing the final packets.
    Ending,
    /// The writer has terminated and the session lock is released.
    Ended,
}

/// Answer from an `Initializing` subscriber.
pub enum InitControl {
    /// Continue with the configuration as offered.
    Proceed,
    /// Continue with a replacement configuration.
    ProceedWith(Box<AgentConfig>),
    /// Abort initialization; the agent becomes suppressed.
    Cancel,
}

/// Supplies host facts the core does not detect itself.
pub trait EnvironmentProbe: Send + Sync {
    /// Computer name.
    fn host_name(&self) -> String;
    /// Account the process runs under.
    fn user_name(&self) -> String;
    /// Operating system description.
    fn os_description(&self) -> String;
    /// Locale tag of the process.
    fn culture(&self) -> String;
    /// Detected hosting model.
    fn application_type(&self) -> ApplicationType;
}

/// Probe built from process environment variables only; platform layers
/// provide richer implementations.
pub struct HostProbe;

impl EnvironmentProbe for HostProbe {
    fn host_name(&self) -> String {
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".into())
    }

    fn user_name(&self) -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".into())
    }

    fn os_description(&self) -> String {
        format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
    }

    fn culture(&self) -> String {
        std::env::var("LANG").unwrap_or_else(|_| "en-US".into())
    }

    fn application_type(&self) -> ApplicationType {
        ApplicationType::Unknown
    }
}

/// Ships a finished session to the upstream service. Invoked with the
/// session id and the fragment files composing it.
pub trait Uploader: Send + Sync {
    /// Performs the upload.
    fn upload(&self, session_id: Uuid, fragments: Vec<PathBuf>) -> Result<()>;
}

/// Everything `initialize` needs beyond the configuration.
pub struct InitOptions {
    /// The configuration to run with.
    pub config: AgentConfig,
    /// Host facts provider; defaults to [`HostProbe`].
    pub probe: Option<Arc<dyn EnvironmentProbe>>,
    /// Subscriber consulted before components are built; may cancel or
    /// override the configuration.
    pub initializing: Option<Arc<dyn Fn(&AgentConfig) -> InitControl + Send + Sync>>,
    /// Uploader used when `server.auto_send_sessions` is set.
    pub uploader: Option<Arc<dyn Uploader>>,
    /// User-principal resolution hook.
    pub resolver: Option<Arc<dyn ResolveUserPrincipal>>,
}

impl InitOptions {
    /// Options with just a configuration.
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            probe: None,
            initializing: None,
            uploader: None,
            resolver: None,
        }
    }
}

/// A live agent: the explicit handle every component hangs off.
pub struct Agent {
    config: AgentConfig,
    context: Arc<SessionContext>,
    publisher: Arc<Publisher>,
    repository: Option<Arc<LocalRepository>>,
    spool: Mutex<Option<FragmentSpool>>,
    metrics: Arc<MetricRegistry>,
    monitor: Mutex<Option<Monitor>>,
    uploader: Mutex<Option<Arc<dyn Uploader>>>,
    state: Mutex<AgentState>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

impl Agent {
    /// Builds and starts every component for a new session.
    pub fn initialize(options: InitOptions) -> Result<Arc<Agent>> {
        let InitOptions {
            config,
            probe,
            initializing,
            uploader,
            resolver,
        } = options;
        config.validate()?;
        let config = match initializing.as_ref().map(|hook| hook(&config)) {
            None | Some(InitControl::Proceed) => config,
            Some(InitControl::ProceedWith(updated)) => {
                updated.validate()?;
                *updated
            }
            Some(InitControl::Cancel) => {
                return Err(AgentError::Suppressed(
                    "initialization canceled by subscriber".into(),
                ))
            }
        };

        let probe = probe.unwrap_or_else(|| Arc::new(HostProbe));
        let summary = build_summary(&config, probe.as_ref());
        let session_id = summary.id;
        let context = Arc::new(SessionContext::new(summary));

        let (repository, sender, spool) = if config.session_file.enabled {
            let mut repo_options = RepositoryOptions::for_product(&config.product_name);
            if let Some(folder) = &config.session_file.folder {
                repo_options.base_folder = folder.clone();
            }
            repo_options.prune = prune_limits(&config);
            let repository = Arc::new(LocalRepository::open(repo_options)?);
            repository.acquire_session_lock(session_id)?;
            let spool = FragmentSpool::spawn(
                repository.fragment_directory().to_path_buf(),
                Arc::clone(&context),
                spool_options(&config),
            )?;
            let sender = spool.sender();
            (Some(repository), sender, Some(spool))
        } else {
            (None, None, None)
        };

        let publisher = Arc::new(Publisher::new(
            Arc::clone(&context),
            sender,
            config.publisher.enable_anonymous_mode,
        ));
        if let Some(resolver) = resolver {
            publisher.set_resolver(resolver);
        }

        let metrics = Arc::new(MetricRegistry::new());
        metrics.attach_publisher(Arc::clone(&publisher));

        let monitor = Monitor::spawn(Arc::clone(&metrics), MONITOR_POLL_INTERVAL)?;

        info!(session_id = %session_id, "agent.initialized");
        Ok(Arc::new(Agent {
            config,
            context,
            publisher,
            repository,
            spool: Mutex::new(spool),
            metrics,
            monitor: Mutex::new(Some(monitor)),
            uploader: Mutex::new(uploader),
            state: Mutex::new(AgentState::Running),
        }))
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    /// The configuration in effect.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The shared session state.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// The packet ingress.
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// The local repository; `None` when session files are disabled.
    pub fn repository(&self) -> Option<&Arc<LocalRepository>> {
        self.repository.as_ref()
    }

    /// The metric engine.
    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    /// Registers a monitor source while the agent is running.
    pub fn subscribe_monitor(&self, source: Arc<dyn crate::monitor::MonitorSource>) {
        if let Some(monitor) = self.monitor.lock().as_ref() {
            monitor.subscribe(source);
        }
    }

    /// Convenience log publish; never fails.
    pub fn log(&self, severity: Severity, category: &str, description: &str) {
        let packet = Packet::new(PacketBody::Log(LogMessage::new(
            severity,
            category,
            description,
        )));
        self.publisher.publish(vec![packet], PublishMode::Queued);
    }

    /// Escalates the in-memory status to `Crashed` without ending the
    /// session; subsequent flushes persist it.
    pub fn report_crash(&self, reason: &str) {
        error!(reason, "agent.crash_reported");
        self.context.advance_status(SessionStatus::Crashed);
        self.log(Severity::Critical, "Lantern.Session", reason);
    }

    /// Ends the session: emits the final close packet, drains the writer,
    /// uploads when configured, and releases the session lock.
    ///
    /// `status` must be `Normal` or `Crashed`; transitions never move
    /// backwards. Calling again after the session ended only escalates the
    /// in-memory status.
    pub fn end_session(&self, status: SessionStatus, reason: &str) -> Result<()> {
        if !matches!(status, SessionStatus::Normal | SessionStatus::Crashed) {
            return Err(AgentError::InvalidArgument(
                "end_session status must be Normal or Crashed".into(),
            ));
        }
        {
            let mut state = self.state.lock();
            match *state {
                AgentState::Running => *state = AgentState::Ending,
                AgentState::Ending | AgentState::Ended => {
                    self.context.advance_status(status);
                    return Ok(());
                }
            }
        }
        info!(?status, reason, "agent.end_session");
        self.publisher.mark_ending();
        let final_status = self.context.advance_status(status);

        let close = Packet::new(PacketBody::SessionClose(SessionClose {
            status: final_status,
            reason: reason.to_owned(),
        }));
        let exit = Packet::new(PacketBody::Command(CommandPacket {
            command: Command::ExitMode(final_status),
            reason: reason.to_owned(),
        }));
        self.publisher
            .publish(vec![close, exit], PublishMode::WaitForCommit);

        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.shutdown();
        }
        if let Some(mut spool) = self.spool.lock().take() {
            spool.shutdown();
        }
        self.publisher.mark_closed();

        if self.config.server.enabled && self.config.server.auto_send_sessions {
            self.spawn_uploader();
        }
        if let Some(repository) = &self.repository {
            repository.release_session_lock(self.context.summary().id);
        }
        *self.state.lock() = AgentState::Ended;
        Ok(())
    }

    /// Rolls the active fragment: a close marker, the `CloseFile` command,
    /// and an open marker are committed as one batch, then the call waits
    /// for durability.
    pub fn end_file(&self, reason: &str) -> Result<()> {
        if self.state() != AgentState::Running {
            return Err(AgentError::InvalidArgument(
                "end_file requires a running session".into(),
            ));
        }
        let close_marker = Packet::new(PacketBody::Log(LogMessage::new(
            Severity::Verbose,
            "Lantern.Session",
            &format!("Closing fragment: {reason}"),
        )));
        let command = Packet::new(PacketBody::Command(CommandPacket {
            command: Command::CloseFile,
            reason: reason.to_owned(),
        }));
        let open_marker = Packet::new(PacketBody::Log(LogMessage::new(
            Severity::Verbose,
            "Lantern.Session",
            &format!("Opened next fragment: {reason}"),
        )));
        self.publisher.publish(
            vec![close_marker, command, open_marker],
            PublishMode::WaitForCommit,
        );
        Ok(())
    }

    // Detached upload of the finished session through the seam.
    fn spawn_uploader(&self) {
        let Some(uploader) = self.uploader.lock().clone() else {
            warn!("agent.upload.no_uploader_configured");
            return;
        };
        let Some(repository) = self.repository.clone() else {
            return;
        };
        let session_id = self.context.summary().id;
        let spawned = std::thread::Builder::new()
            .name("lantern-uploader".into())
            .spawn(move || {
                // The index predates the fragments this session wrote.
                repository.refresh(true, crate::repository::SessionScope::All);
                match repository.load_session_files(session_id) {
                    Ok((_, fragments)) => {
                        if let Err(err) = uploader.upload(session_id, fragments) {
                            warn!(session_id = %session_id, error = %err, "agent.upload.failed");
                        }
                    }
                    Err(err) => {
                        warn!(session_id = %session_id, error = %err, "agent.upload.load_failed")
                    }
                }
            });
        if spawned.is_err() {
            warn!("agent.upload.spawn_failed");
        }
    }
}

fn build_summary(config: &AgentConfig, probe: &dyn EnvironmentProbe) -> SessionSummary {
    SessionSummary {
        id: Uuid::new_v4(),
        product: config.product_name.clone(),
        application: config.application_name.clone(),
        application_version: config.application_version.clone(),
        application_description: config.application_description.clone(),
        environment: config.environment.clone(),
        promotion_level: config.promotion_level.clone(),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
        host_name: probe.host_name(),
        user_name: probe.user_name(),
        os_description: probe.os_description(),
        culture: probe.culture(),
        application_type: config
            .publisher
            .application_type
            .unwrap_or_else(|| probe.application_type()),
        start_time: OffsetDateTime::now_utc(),
        properties: config.properties.clone(),
    }
}

fn spool_options(config: &AgentConfig) -> SpoolOptions {
    SpoolOptions {
        max_size_bytes: u64::from(config.session_file.max_size_mb) * 1024 * 1024,
        max_age: time::Duration::hours(i64::from(config.session_file.max_duration_hours)),
        auto_flush_interval: Duration::from_secs(u64::from(
            config.session_file.auto_flush_interval_seconds.max(1),
        )),
    }
}

fn prune_limits(config: &AgentConfig) -> PruneLimits {
    PruneLimits {
        max_bytes: (config.session_file.max_local_disk_usage_mb > 0)
            .then(|| u64::from(config.session_file.max_local_disk_usage_mb) * 1024 * 1024),
        max_age: (config.session_file.max_local_file_age_days > 0).then(|| {
            time::Duration::days(i64::from(config.session_file.max_local_file_age_days))
        }),
    }
}

// ---------------------------------------------------------------------------
// Process-wide convenience registry.

/// Outcome of the process-wide `init`.
pub enum InitResult {
    /// This call built the agent.
    Ready(Arc<Agent>),
    /// An earlier call already built it.
    AlreadyRunning(Arc<Agent>),
    /// Called re-entrantly from the thread running initialization; returned
    /// immediately to avoid self-deadlock.
    InitializerReentry,
    /// A subscriber canceled an earlier init; retry through
    /// `start_session`.
    Suppressed(String),
}

enum GlobalPhase {
    Uninitialized,
    Initializing,
    Ready(Arc<Agent>),
    Suppressed(String),
}

struct GlobalGate {
    phase: StdMutex<GlobalPhase>,
    signal: Condvar,
}

static GATE: OnceLock<GlobalGate> = OnceLock::new();

thread_local! {
    static IS_INITIALIZER: Cell<bool> = const { Cell::new(false) };
}

fn gate() -> &'static GlobalGate {
    GATE.get_or_init(|| GlobalGate {
        phase: StdMutex::new(GlobalPhase::Uninitialized),
        signal: Condvar::new(),
    })
}

/// Process-wide idempotent initialization. Re-entrant calls return
/// immediately; concurrent callers block until the first finishes. A
/// configuration rejection or cancellation leaves the process suppressed,
/// with the original error returned to the caller.
pub fn init(options: InitOptions) -> Result<InitResult> {
    init_inner(options, false)
}

/// Like `init`, but retries after a suppressed initialization.
pub fn start_session(options: InitOptions) -> Result<InitResult> {
    init_inner(options, true)
}

/// The process-wide agent, when one is ready.
pub fn global() -> Option<Arc<Agent>> {
    let gate = gate();
    let phase = gate
        .phase
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match &*phase {
        GlobalPhase::Ready(agent) => Some(Arc::clone(agent)),
        _ => None,
    }
}

fn init_inner(options: InitOptions, allow_retry: bool) -> Result<InitResult> {
    let gate = gate();
    {
        let mut phase = gate
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match &*phase {
                GlobalPhase::Ready(agent) => {
                    return Ok(InitResult::AlreadyRunning(Arc::clone(agent)))
                }
                GlobalPhase::Suppressed(reason) => {
                    if allow_retry {
                        *phase = GlobalPhase::Initializing;
                        break;
                    }
                    let reason = reason.clone();
                    return Ok(InitResult::Suppressed(reason));
                }
                GlobalPhase::Initializing => {
                    if IS_INITIALIZER.with(|flag| flag.get()) {
                        return Ok(InitResult::InitializerReentry);
                    }
                    phase = gate
                        .signal
                        .wait(phase)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                GlobalPhase::Uninitialized => {
                    *phase = GlobalPhase::Initializing;
                    break;
                }
            }
        }
    }

    IS_INITIALIZER.with(|flag| flag.set(true));
    let outcome = Agent::initialize(options);
    IS_INITIALIZER.with(|flag| flag.set(false));

    let mut phase = gate
        .phase
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match outcome {
        Ok(agent) => {
            *phase = GlobalPhase::Ready(Arc::clone(&agent));
            gate.signal.notify_all();
            Ok(InitResult::Ready(agent))
        }
        Err(err) => {
            // The original error is preserved for diagnostics; the process
            // stays suppressed until start_session retries.
            *phase = GlobalPhase::Suppressed(err.to_string());
            gate.signal.notify_all();
            Err(err)
        }
    }
}
