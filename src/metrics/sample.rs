use time::OffsetDateTime;

use crate::error::{AgentError, Result};
use crate::packet::SamplingKind;

/// One raw observation of a sampled metric, as stored on the metric
/// instance. Appended in non-decreasing `sample_timestamp` order.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSample {
    /// Raw numerator value.
    pub raw_value: f64,
    /// Raw denominator for fraction kinds.
    pub base_value: Option<f64>,
    /// When the underlying datum was captured.
    pub raw_timestamp: OffsetDateTime,
    /// When the sample entered the agent.
    pub sample_timestamp: OffsetDateTime,
    /// Per-metric sequence of the sample.
    pub sequence: u64,
    /// How this sample combines with others.
    pub sampling_kind: SamplingKind,
}

impl SampledSample {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.raw_timestamp > self.sample_timestamp {
            return Err(AgentError::InvalidArgument(
                "raw timestamp is after the sample timestamp".into(),
            ));
        }
        Ok(())
    }
}

/// One raw event-metric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSample {
    /// One number per value column, in definition order.
    pub values: Vec<f64>,
    /// When the event occurred.
    pub timestamp: OffsetDateTime,
    /// Per-metric sequence of the event.
    pub sequence: u64,
}
