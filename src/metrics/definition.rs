use uuid::Uuid;

use super::bind::NameBinding;
use crate::error::{AgentError, Result};
use crate::packet::{
    EventValueDefinition, MetricDefinitionRecord, SampleInterval, SamplingKind,
};

/// Payload distinguishing sampled from event metrics.
///
/// Shared fields live on [`MetricDefinition`]; the variant carries what only
/// one family needs, and selects the value-computation path.
#[derive(Debug, Clone)]
pub enum MetricKind {
    /// Periodically sampled numeric metric.
    Sampled {
        /// How raw samples combine into values.
        sampling_kind: SamplingKind,
    },
    /// Discrete events carrying a tuple of values.
    Event {
        /// Ordered value columns; immutable after registration.
        values: Vec<EventValueDefinition>,
    },
}

/// Immutable description of one metric.
///
/// One definition exists per `(category, counter)`; every field is fixed at
/// registration.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    /// Definition id.
    pub id: Uuid,
    /// Namespace of the defining subsystem.
    pub metric_type_name: String,
    /// Metric category.
    pub category: String,
    /// Counter name within the category.
    pub counter: String,
    /// Sampled or event payload.
    pub kind: MetricKind,
    /// Natural spacing of samples.
    pub interval: SampleInterval,
    /// Display unit of computed values.
    pub unit_caption: String,
    /// Optional instance-name extraction schema.
    pub binding: Option<NameBinding>,
}

impl MetricDefinition {
    /// Describes a sampled metric.
    pub fn sampled(
        metric_type_name: impl Into<String>,
        category: impl Into<String>,
        counter: impl Into<String>,
        sampling_kind: SamplingKind,
        interval: SampleInterval,
        unit_caption: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric_type_name: metric_type_name.into(),
            category: category.into(),
            counter: counter.into(),
            kind: MetricKind::Sampled { sampling_kind },
            interval,
            unit_caption: unit_caption.into(),
            binding: None,
        }
    }

    /// Describes an event metric. Value-column names must be unique.
    pub fn event(
        metric_type_name: impl Into<String>,
        category: impl Into<String>,
        counter: impl Into<String>,
        interval: SampleInterval,
        values: Vec<EventValueDefinition>,
    ) -> Result<Self> {
        for (position, value) in values.iter().enumerate() {
            if values[..position].iter().any(|other| other.name == value.name) {
                return Err(AgentError::InvalidArgument(format!(
                    "duplicate event value name '{}'",
                    value.name
                )));
            }
        }
        Ok(Self {
            id: Uuid::new_v4(),
            metric_type_name: metric_type_name.into(),
            category: category.into(),
            counter: counter.into(),
            kind: MetricKind::Event { values },
            interval,
            unit_caption: String::new(),
            binding: None,
        })
    }

    /// Attaches an instance-name extraction schema.
    pub fn with_binding(mut self, binding: NameBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// The uniqueness key.
    pub fn key(&self) -> (&str, &str) {
        (&self.category, &self.counter)
    }

    /// True for event metrics.
    pub fn is_event(&self) -> bool {
        matches!(self.kind, MetricKind::Event { .. })
    }

    /// The sampling kind; event metrics report `NumberOfItems`.
    pub fn sampling_kind(&self) -> SamplingKind {
        match &self.kind {
            MetricKind::Sampled { sampling_kind } => *sampling_kind,
            MetricKind::Event { .. } => SamplingKind::NumberOfItems,
        }
    }

    /// Value columns of an event metric; empty for sampled metrics.
    pub fn event_values(&self) -> &[EventValueDefinition] {
        match &self.kind {
            MetricKind::Sampled { .. } => &[],
            MetricKind::Event { values } => values,
        }
    }

    /// True when another registration attempt describes the same metric.
    /// Definitions are immutable after first publish, so any difference is a
    /// caller error.
    pub(crate) fn shape_matches(&self, other: &MetricDefinition) -> bool {
        self.metric_type_name == other.metric_type_name
            && self.category == other.category
            && self.counter == other.counter
            && self.interval == other.interval
            && self.is_event() == other.is_event()
            && self.sampling_kind() == other.sampling_kind()
            && self.event_values() == other.event_values()
    }

    /// The wire form, published ahead of the first sample.
    pub fn to_record(&self) -> MetricDefinitionRecord {
        MetricDefinitionRecord {
            id: self.id,
            metric_type_name: self.metric_type_name.clone(),
            category: self.category.clone(),
            counter: self.counter.clone(),
            is_event: self.is_event(),
            sampling_kind: self.sampling_kind(),
            interval: self.interval,
            unit_caption: self.unit_caption.clone(),
            bound_type_name: self
                .binding
                .as_ref()
                .map(|binding| binding.bound_type_name.clone()),
            name_member_name: self
                .binding
                .as_ref()
                .map(|binding| binding.member_name.clone()),
            event_values: self.event_values().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Trend;

    #[test]
    fn duplicate_event_value_names_are_rejected() {
        let values = vec![
            EventValueDefinition {
                name: "duration".into(),
                unit_caption: "ms".into(),
                default_trend: Trend::Average,
            },
            EventValueDefinition {
                name: "duration".into(),
                unit_caption: "ms".into(),
                default_trend: Trend::Max,
            },
        ];
        assert!(MetricDefinition::event("app", "Requests", "timing", SampleInterval::Second, values)
            .is_err());
    }

    #[test]
    fn shape_match_ignores_id() {
        let a = MetricDefinition::sampled(
            "process",
            "Process.Memory",
            "working_set",
            SamplingKind::NumberOfItems,
            SampleInterval::Second,
            "bytes",
        );
        let b = MetricDefinition::sampled(
            "process",
            "Process.Memory",
            "working_set",
            SamplingKind::NumberOfItems,
            SampleInterval::Second,
            "bytes",
        );
        assert_ne!(a.id, b.id);
        assert!(a.shape_matches(&b));
        let c = MetricDefinition::sampled(
            "process",
            "Process.Memory",
            "working_set",
            SamplingKind::TotalCount,
            SampleInterval::Second,
            "bytes",
        );
        assert!(!a.shape_matches(&c));
    }
}
