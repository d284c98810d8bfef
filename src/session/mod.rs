//! Session identity and shared running state.
//!
//! A session is one execution of the host process. Its immutable description
//! lives in [`SessionSummary`]; the mutable running state (severity counters,
//! status, end-time heartbeat, packet sequence) lives in [`SessionContext`]
//! and is updated through a single atomic path so every fragment header and
//! the in-memory view agree.

mod context;
mod summary;

pub use context::{SessionContext, SessionCounters};
pub(crate) use context::current_thread_id;
pub use summary::{ApplicationType, SessionStatus, SessionSummary, Severity};
