//! # Lantern - Structured Diagnostic Session Logging
//!
//! Lantern is the in-process core of a diagnostic logging and telemetry
//! agent. A running application hands it log messages, metric samples, and
//! session metadata; the agent stamps, batches, and persists them as
//! append-only binary session fragments (`.glf`) on local disk, later
//! shippable to an upstream service through an [`agent::Uploader`] seam.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lantern::agent::{Agent, AgentConfig, InitOptions};
//! use lantern::{SessionStatus, Severity};
//!
//! let agent = Agent::initialize(InitOptions::new(AgentConfig::new("MyProduct", "MyApp")))?;
//! agent.log(Severity::Information, "startup", "application started");
//! agent.end_session(SessionStatus::Normal, "clean shutdown")?;
//! # Ok::<(), lantern::AgentError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Packet layer**: tagged record types with a versioned self-describing
//!   binary codec; readers skip what they do not know.
//! - **Fragment layer**: the `.glf` file format with an in-place-updatable
//!   header, plus the dedicated writer thread that appends and rotates.
//! - **Publisher**: the single concurrent ingress; one total order covers
//!   stamping, subscriber fan-out, and the on-disk stream.
//! - **Repository**: fragment discovery and indexing, per-session
//!   cross-process locks, crashed-session recovery, archive lifecycle.
//! - **Metric engine**: sampled and event metric definitions, per-instance
//!   sample lists, and deterministic value calculation.
//! - **Coordinator**: initialization gate, session end ordering, and the
//!   optional process-wide handle.

pub mod agent;
pub mod error;
pub mod fragment;
pub mod metrics;
pub mod monitor;
pub mod packet;
pub mod publisher;
pub mod repository;
pub mod session;

// Re-export the main public API
pub use crate::agent::{Agent, AgentConfig, AgentState, InitOptions};
pub use crate::error::{AgentError, Result};
pub use crate::packet::{LogMessage, Packet, PacketBody, SampleInterval, SamplingKind, Trend};
pub use crate::publisher::{PacketObserver, Publisher, PublishMode};
pub use crate::repository::{LocalRepository, RepositoryOptions, Session};
pub use crate::session::{SessionStatus, SessionSummary, Severity};
