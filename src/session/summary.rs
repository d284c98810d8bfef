use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Lifecycle state of a session.
///
/// Transitions are monotonic in the order `Running < Normal < Crashed`; a
/// stored status never moves backwards. `Unknown` only appears when a header
/// predates the status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Status byte missing or unrecognized.
    Unknown,
    /// The owning process has not ended the session.
    Running,
    /// The session was closed through `end_session`.
    Normal,
    /// The owning process exited without closing the session.
    Crashed,
}

impl SessionStatus {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Unknown => 0,
            SessionStatus::Running => 1,
            SessionStatus::Normal => 2,
            SessionStatus::Crashed => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionStatus::Running,
            2 => SessionStatus::Normal,
            3 => SessionStatus::Crashed,
            _ => SessionStatus::Unknown,
        }
    }

    /// Applies the monotonic transition rule, returning whichever of the two
    /// states is further along.
    pub fn advance(self, next: SessionStatus) -> SessionStatus {
        self.max(next)
    }
}

/// How the hosting application presents itself to the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApplicationType {
    /// Not detected and not configured.
    #[default]
    Unknown,
    /// Interactive console process.
    Console,
    /// Background service / daemon.
    Service,
    /// Desktop GUI process.
    Windows,
    /// Web application worker.
    AspNet,
}

impl ApplicationType {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ApplicationType::Unknown => 0,
            ApplicationType::Console => 1,
            ApplicationType::Service => 2,
            ApplicationType::Windows => 3,
            ApplicationType::AspNet => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ApplicationType::Console,
            2 => ApplicationType::Service,
            3 => ApplicationType::Windows,
            4 => ApplicationType::AspNet,
            _ => ApplicationType::Unknown,
        }
    }
}

/// Severity of a log message, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// The application cannot continue.
    Critical,
    /// An operation failed.
    Error,
    /// An operation degraded but continued.
    Warning,
    /// Routine information.
    Information,
    /// High-volume diagnostic detail.
    Verbose,
}

impl Severity {
    // Wire values are the classic trace-level bit flags.
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Severity::Critical => 1,
            Severity::Error => 2,
            Severity::Warning => 4,
            Severity::Information => 8,
            Severity::Verbose => 16,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Severity::Critical),
            2 => Ok(Severity::Error),
            4 => Ok(Severity::Warning),
            8 => Ok(Severity::Information),
            16 => Ok(Severity::Verbose),
            other => Err(AgentError::Corruption(format!(
                "unrecognized severity byte {other}"
            ))),
        }
    }
}

/// Immutable description of one session, created at init and shared by the
/// publisher for packet stamping.
///
/// The mutable counterpart (status, counts, end time) lives on
/// [`super::SessionContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique id of this session.
    pub id: Uuid,
    /// Product the application belongs to; also roots the repository path.
    pub product: String,
    /// Application name within the product.
    pub application: String,
    /// Application version string.
    pub application_version: String,
    /// Optional operator-facing description.
    pub application_description: String,
    /// Deployment environment tag (production, staging, ...).
    pub environment: String,
    /// Release promotion level tag (qa, release, ...).
    pub promotion_level: String,
    /// Version of the agent that wrote the session.
    pub agent_version: String,
    /// Host computer name.
    pub host_name: String,
    /// Account the process runs under.
    pub user_name: String,
    /// Operating system description.
    pub os_description: String,
    /// Culture / locale tag of the process.
    pub culture: String,
    /// Kind of hosting application.
    pub application_type: ApplicationType,
    /// Moment the session started.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Caller-supplied properties, copied verbatim from configuration.
    pub properties: BTreeMap<String, String>,
}

impl SessionSummary {
    /// Validates the fields a repository path depends on.
    pub fn validate(&self) -> Result<()> {
        if self.product.trim().is_empty() {
            return Err(AgentError::InvalidArgument(
                "product name must be non-empty".into(),
            ));
        }
        if self.application.trim().is_empty() {
            return Err(AgentError::InvalidArgument(
                "application name must be non-empty".into(),
            ));
        }
        Ok(())
    }
}
