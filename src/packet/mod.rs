//! Packet model and self-describing binary codec.
//!
//! A packet is the smallest serializable unit flowing through the publisher:
//! log messages, metric samples and definitions, thread registrations,
//! session bookkeeping, and writer commands. On disk every record is a
//! length-prefixed, definition-tagged field list (see [`codec`]), so readers
//! can skip packet types and fields they do not know.

pub mod codec;
pub mod wire;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::session::{SessionStatus, SessionSummary, Severity};

pub(crate) fn timestamp_nanos(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp_nanos() as i64
}

pub(crate) fn timestamp_from_nanos(nanos: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Stamp applied to every packet by the publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHeader {
    /// Per-session monotonic sequence number; gaps indicate loss.
    pub sequence: u64,
    /// Moment the packet was published (or the caller-provided time).
    pub timestamp: OffsetDateTime,
    /// Small per-session index of the publishing thread.
    pub thread_index: u32,
    /// OS thread id of the publishing thread.
    pub thread_id: u64,
}

impl PacketHeader {
    /// A zeroed header; the publisher overwrites every field on publish.
    pub fn unstamped() -> Self {
        Self {
            sequence: 0,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            thread_index: 0,
            thread_id: 0,
        }
    }

    /// True when the caller supplied its own timestamp.
    pub fn has_timestamp(&self) -> bool {
        self.timestamp != OffsetDateTime::UNIX_EPOCH
    }
}

/// One publishable record.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Publisher stamp.
    pub header: PacketHeader,
    /// Typed payload.
    pub body: PacketBody,
}

impl Packet {
    /// Wraps a payload in an unstamped header.
    pub fn new(body: PacketBody) -> Self {
        Self {
            header: PacketHeader::unstamped(),
            body,
        }
    }
}

/// Payloads the agent understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    /// A structured log message.
    Log(LogMessage),
    /// First-publish registration of an OS thread.
    ThreadInfo(ThreadInfo),
    /// A metric definition, emitted ahead of the first sample referencing it.
    MetricDefinition(MetricDefinitionRecord),
    /// One raw sampled-metric observation.
    SampledValue(SampledValueRecord),
    /// One raw event-metric observation.
    EventValue(EventValueRecord),
    /// Session description, emitted once per fragment.
    SessionInfo(SessionSummary),
    /// Marks a fragment boundary inside the stream.
    FragmentInfo(FragmentInfo),
    /// Final packet of a session.
    SessionClose(SessionClose),
    /// Control packet consumed by the fragment writer.
    Command(CommandPacket),
}

impl PacketBody {
    /// Stable wire name of the payload type.
    pub fn type_name(&self) -> &'static str {
        match self {
            PacketBody::Log(_) => "Log.Message",
            PacketBody::ThreadInfo(_) => "Session.ThreadInfo",
            PacketBody::MetricDefinition(_) => "Metric.Definition",
            PacketBody::SampledValue(_) => "Metric.SampledValue",
            PacketBody::EventValue(_) => "Metric.EventValue",
            PacketBody::SessionInfo(_) => "Session.Info",
            PacketBody::FragmentInfo(_) => "Session.FragmentInfo",
            PacketBody::SessionClose(_) => "Session.Close",
            PacketBody::Command(_) => "Session.Command",
        }
    }
}

/// Code location a log message originated from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceLocation {
    /// Fully qualified type name.
    pub class_name: String,
    /// Method or function name.
    pub method_name: String,
    /// Source file path.
    pub file_name: String,
    /// 1-based line number, 0 when unknown.
    pub line_number: u32,
}

/// Captured error attached to a log message.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionInfo {
    /// Error type name.
    pub type_name: String,
    /// Error message.
    pub message: String,
    /// Optional captured backtrace.
    pub stack_trace: Option<String>,
}

/// A structured log message.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    /// Message severity.
    pub severity: Severity,
    /// Logging framework the message came through.
    pub log_system: String,
    /// Dot-delimited subsystem category.
    pub category: String,
    /// Single-line display caption. When empty the first line of the
    /// description is used.
    pub caption: String,
    /// Full message text.
    pub description: String,
    /// Optional structured details payload.
    pub details_xml: Option<String>,
    /// Optional captured error.
    pub exception: Option<ExceptionInfo>,
    /// Optional code location.
    pub source: Option<SourceLocation>,
    /// Acting user, cleared in anonymous mode.
    pub user_name: Option<String>,
    /// Resolved principal for the acting user, filled by the resolve hook.
    pub user_principal: Option<String>,
}

impl LogMessage {
    /// A minimal message with the given severity, category, and text.
    pub fn new(severity: Severity, category: &str, description: &str) -> Self {
        Self {
            severity,
            log_system: "Lantern".into(),
            category: category.into(),
            caption: String::new(),
            description: description.into(),
            details_xml: None,
            exception: None,
            source: None,
            user_name: None,
            user_principal: None,
        }
    }

    /// The caption to display: the explicit caption when set, otherwise the
    /// first line of the description.
    pub fn normalized_caption(&self) -> &str {
        if !self.caption.is_empty() {
            return &self.caption;
        }
        self.description
            .lines()
            .next()
            .map(str::trim_end)
            .unwrap_or("")
    }
}

/// Identity of an OS thread that has published at least one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    /// Per-session index assigned at first publish.
    pub thread_index: u32,
    /// OS thread id.
    pub thread_id: u64,
    /// Thread name when the OS exposes one.
    pub caption: String,
}

/// How a sampled metric's raw values combine into displayable numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingKind {
    /// Delta of running totals between two samples.
    TotalCount,
    /// Delta ratio of running value and base totals.
    TotalFraction,
    /// Each sample is an increment; values accumulate.
    IncrementalCount,
    /// Incremental value over incremental base.
    IncrementalFraction,
    /// Time-weighted average of raw deltas.
    RawCount,
    /// Time-weighted ratio of raw value and base deltas.
    RawFraction,
    /// The raw value is the displayable number.
    NumberOfItems,
}

impl SamplingKind {
    /// True when computing a value needs an earlier baseline sample.
    pub fn requires_baseline(self) -> bool {
        !matches!(self, SamplingKind::NumberOfItems | SamplingKind::IncrementalCount | SamplingKind::IncrementalFraction)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SamplingKind::TotalCount => 0,
            SamplingKind::TotalFraction => 1,
            SamplingKind::IncrementalCount => 2,
            SamplingKind::IncrementalFraction => 3,
            SamplingKind::RawCount => 4,
            SamplingKind::RawFraction => 5,
            SamplingKind::NumberOfItems => 6,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => SamplingKind::TotalCount,
            1 => SamplingKind::TotalFraction,
            2 => SamplingKind::IncrementalCount,
            3 => SamplingKind::IncrementalFraction,
            4 => SamplingKind::RawCount,
            5 => SamplingKind::RawFraction,
            6 => SamplingKind::NumberOfItems,
            _ => return None,
        })
    }
}

/// Spacing of computed metric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleInterval {
    /// Use the raw samples as they arrived.
    Shortest,
    /// Millisecond-spaced values.
    Millisecond,
    /// Second-spaced values.
    Second,
    /// Minute-spaced values.
    Minute,
    /// Hour-spaced values.
    Hour,
    /// Day-spaced values.
    Day,
    /// Week-spaced values.
    Week,
    /// 30-day month-spaced values.
    Month,
}

impl SampleInterval {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SampleInterval::Shortest => 0,
            SampleInterval::Millisecond => 1,
            SampleInterval::Second => 2,
            SampleInterval::Minute => 3,
            SampleInterval::Hour => 4,
            SampleInterval::Day => 5,
            SampleInterval::Week => 6,
            SampleInterval::Month => 7,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => SampleInterval::Shortest,
            1 => SampleInterval::Millisecond,
            2 => SampleInterval::Second,
            3 => SampleInterval::Minute,
            4 => SampleInterval::Hour,
            5 => SampleInterval::Day,
            6 => SampleInterval::Week,
            7 => SampleInterval::Month,
            _ => return None,
        })
    }
}

/// Aggregation applied to one event-metric value column over an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    /// Number of events in the interval.
    Count,
    /// Sum of the column over the interval.
    Sum,
    /// Minimum of the column over the interval.
    Min,
    /// Maximum of the column over the interval.
    Max,
    /// Arithmetic mean of the column over the interval.
    Average,
    /// Events since the start of the calculation range.
    RunningCount,
    /// Column total since the start of the calculation range.
    RunningSum,
}

impl Trend {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Trend::Count => 0,
            Trend::Sum => 1,
            Trend::Min => 2,
            Trend::Max => 3,
            Trend::Average => 4,
            Trend::RunningCount => 5,
            Trend::RunningSum => 6,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Trend::Count,
            1 => Trend::Sum,
            2 => Trend::Min,
            3 => Trend::Max,
            4 => Trend::Average,
            5 => Trend::RunningCount,
            6 => Trend::RunningSum,
            _ => return None,
        })
    }
}

/// One value column of an event metric definition.
#[derive(Debug, Clone, PartialEq)]
pub struct EventValueDefinition {
    /// Column name, unique within the definition.
    pub name: String,
    /// Display unit.
    pub unit_caption: String,
    /// Default aggregation for the column.
    pub default_trend: Trend,
}

/// Wire form of a metric definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinitionRecord {
    /// Definition id.
    pub id: Uuid,
    /// Namespace of the defining subsystem.
    pub metric_type_name: String,
    /// Metric category.
    pub category: String,
    /// Counter name within the category.
    pub counter: String,
    /// True for event metrics, false for sampled metrics.
    pub is_event: bool,
    /// How sampled values combine; `NumberOfItems` for event metrics.
    pub sampling_kind: SamplingKind,
    /// Natural spacing of the metric's samples.
    pub interval: SampleInterval,
    /// Display unit of computed values.
    pub unit_caption: String,
    /// Type name instance names are extracted from, when bound.
    pub bound_type_name: Option<String>,
    /// Member used for instance-name extraction, when bound.
    pub name_member_name: Option<String>,
    /// Value columns of an event metric; empty for sampled metrics.
    pub event_values: Vec<EventValueDefinition>,
}

/// One raw observation of a sampled metric.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledValueRecord {
    /// Metric instance the sample belongs to.
    pub metric_id: Uuid,
    /// Definition of the metric instance.
    pub definition_id: Uuid,
    /// Raw numerator value.
    pub raw_value: f64,
    /// Raw denominator value for fraction kinds.
    pub base_value: Option<f64>,
    /// When the underlying datum was captured.
    pub raw_timestamp: OffsetDateTime,
    /// When the sample entered the agent; never before `raw_timestamp`.
    pub sample_timestamp: OffsetDateTime,
    /// How this sample combines with others.
    pub sampling_kind: SamplingKind,
}

/// One raw observation of an event metric.
#[derive(Debug, Clone, PartialEq)]
pub struct EventValueRecord {
    /// Metric instance the event belongs to.
    pub metric_id: Uuid,
    /// Definition of the metric instance.
    pub definition_id: Uuid,
    /// One number per value column, in definition order.
    pub values: Vec<f64>,
    /// When the event occurred.
    pub event_timestamp: OffsetDateTime,
}

/// Marks the start of a fragment inside the packet stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentInfo {
    /// Id of the fragment being opened.
    pub fragment_id: Uuid,
    /// 0-based position of the fragment within the session.
    pub file_sequence: u32,
    /// Moment the fragment was opened.
    pub fragment_start_time: OffsetDateTime,
}

/// Final packet of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    /// Final session status.
    pub status: SessionStatus,
    /// Operator-facing reason text.
    pub reason: String,
}

/// Writer control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Close the current fragment and open the next.
    CloseFile,
    /// Write the session close, finalize the header, and stop the writer.
    ExitMode(SessionStatus),
}

/// A control packet consumed (not persisted) by the fragment writer.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPacket {
    /// The command to execute.
    pub command: Command,
    /// Why the command was issued.
    pub reason: String,
}
