use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::definition::MetricDefinition;
use super::sample::{EventSample, SampledSample};
use super::values::{self, MetricValueCollection};
use crate::error::{AgentError, Result};
use crate::packet::{
    EventValueRecord, Packet, PacketBody, SampledValueRecord, SampleInterval, Trend,
};
use crate::publisher::{Publisher, PublishMode};

// State shared by the registry, its collections, and their metrics: where
// sample packets go, and the session start used to clamp raw-kind windows.
#[derive(Default)]
pub(crate) struct EngineShared {
    publisher: Mutex<Option<Arc<Publisher>>>,
    session_start: Mutex<Option<OffsetDateTime>>,
}

impl EngineShared {
    fn publish(&self, body: PacketBody) {
        if let Some(publisher) = self.publisher.lock().clone() {
            publisher.publish(vec![Packet::new(body)], PublishMode::Queued);
        }
    }

    fn session_start(&self) -> OffsetDateTime {
        self.session_start
            .lock()
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

struct SampleStore {
    sampled: Vec<SampledSample>,
    events: Vec<EventSample>,
}

/// One metric instance: a definition applied to an optional instance name,
/// owning an always-sorted sample list.
pub struct Metric {
    id: Uuid,
    definition: Arc<MetricDefinition>,
    instance_name: Option<String>,
    samples: Mutex<SampleStore>,
    next_sequence: AtomicU64,
    shared: Arc<EngineShared>,
}

impl Metric {
    fn new(
        definition: Arc<MetricDefinition>,
        instance_name: Option<String>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition,
            instance_name,
            samples: Mutex::new(SampleStore {
                sampled: Vec::new(),
                events: Vec::new(),
            }),
            next_sequence: AtomicU64::new(1),
            shared,
        }
    }

    /// Metric instance id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The definition this instance belongs to.
    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    /// Instance name; `None` is the default instance.
    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    /// Records one raw sampled observation and publishes it.
    ///
    /// `raw_timestamp` defaults to `sample_timestamp`; it must not be later.
    pub fn record_sample(
        &self,
        raw_value: f64,
        base_value: Option<f64>,
        raw_timestamp: Option<OffsetDateTime>,
        sample_timestamp: OffsetDateTime,
    ) -> Result<()> {
        if self.definition.is_event() {
            return Err(AgentError::InvalidArgument(
                "event metric cannot record sampled values".into(),
            ));
        }
        let sample = SampledSample {
            raw_value,
            base_value,
            raw_timestamp: raw_timestamp.unwrap_or(sample_timestamp),
            sample_timestamp,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            sampling_kind: self.definition.sampling_kind(),
        };
        sample.validate()?;
        {
            let mut store = self.samples.lock();
            // Keep the list ordered by sample time even when callers hand
            // in historical data.
            let position = store
                .sampled
                .partition_point(|existing| existing.sample_timestamp <= sample.sample_timestamp);
            store.sampled.insert(position, sample.clone());
        }
        self.shared.publish(PacketBody::SampledValue(SampledValueRecord {
            metric_id: self.id,
            definition_id: self.definition.id,
            raw_value: sample.raw_value,
            base_value: sample.base_value,
            raw_timestamp: sample.raw_timestamp,
            sample_timestamp: sample.sample_timestamp,
            sampling_kind: sample.sampling_kind,
        }));
        Ok(())
    }

    /// Records one event observation and publishes it. `values` must match
    /// the definition's value columns in count and order.
    pub fn record_event(&self, values: Vec<f64>, timestamp: OffsetDateTime) -> Result<()> {
        let columns = self.definition.event_values();
        if columns.is_empty() {
            return Err(AgentError::InvalidArgument(
                "sampled metric cannot record events".into(),
            ));
        }
        if values.len() != columns.len() {
            return Err(AgentError::InvalidArgument(format!(
                "event carries {} values but the definition declares {}",
                values.len(),
                columns.len()
            )));
        }
        let event = EventSample {
            values,
            timestamp,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        {
            let mut store = self.samples.lock();
            let position = store
                .events
                .partition_point(|existing| existing.timestamp <= event.timestamp);
            store.events.insert(position, event.clone());
        }
        self.shared.publish(PacketBody::EventValue(EventValueRecord {
            metric_id: self.id,
            definition_id: self.definition.id,
            values: event.values.clone(),
            event_timestamp: event.timestamp,
        }));
        Ok(())
    }

    /// Snapshot of the raw sampled observations.
    pub fn sampled_snapshot(&self) -> Vec<SampledSample> {
        self.samples.lock().sampled.clone()
    }

    /// Snapshot of the raw event observations.
    pub fn event_snapshot(&self) -> Vec<EventSample> {
        self.samples.lock().events.clone()
    }

    /// Computes the displayable series for a sampled metric.
    pub fn calculate_values(
        &self,
        interval: SampleInterval,
        intervals: u32,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<MetricValueCollection> {
        if self.definition.is_event() {
            return Err(AgentError::InvalidArgument(
                "use calculate_event_values for event metrics".into(),
            ));
        }
        let samples = self.sampled_snapshot();
        values::calculate_sampled_values(
            &samples,
            self.definition.sampling_kind(),
            &self.definition.unit_caption,
            interval,
            intervals,
            start,
            end,
            self.shared.session_start(),
        )
    }

    /// Computes the displayable series for one value column of an event
    /// metric, using the column's default trend unless overridden.
    pub fn calculate_event_values(
        &self,
        value_name: &str,
        trend: Option<Trend>,
        interval: SampleInterval,
        intervals: u32,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<MetricValueCollection> {
        let columns = self.definition.event_values();
        let column = columns
            .iter()
            .position(|candidate| candidate.name == value_name)
            .ok_or_else(|| {
                AgentError::InvalidArgument(format!("unknown event value '{value_name}'"))
            })?;
        let trend = trend.unwrap_or(columns[column].default_trend);
        let events = self.event_snapshot();
        values::calculate_event_values(
            &events,
            column,
            trend,
            &columns[column].unit_caption,
            interval,
            intervals,
            start,
            end,
        )
    }
}

struct Instances {
    by_name: HashMap<Option<String>, usize>,
    ordered: Vec<Arc<Metric>>,
}

/// All instances of one metric definition.
///
/// `add_or_get` is the lock-guarded get-or-create path; the accessors return
/// `None` for missing keys instead of failing.
pub struct MetricCollection {
    definition: Arc<MetricDefinition>,
    instances: Mutex<Instances>,
    definition_published: AtomicBool,
    shared: Arc<EngineShared>,
}

impl MetricCollection {
    fn new(definition: MetricDefinition, shared: Arc<EngineShared>) -> Self {
        Self {
            definition: Arc::new(definition),
            instances: Mutex::new(Instances {
                by_name: HashMap::new(),
                ordered: Vec::new(),
            }),
            definition_published: AtomicBool::new(false),
            shared,
        }
    }

    /// The shared definition.
    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    /// Gets or creates the instance for `instance_name` (`None` for the
    /// default instance).
    pub fn add_or_get(&self, instance_name: Option<&str>) -> Arc<Metric> {
        let key = instance_name.map(str::to_owned);
        let mut instances = self.instances.lock();
        if let Some(position) = instances.by_name.get(&key) {
            return Arc::clone(&instances.ordered[*position]);
        }
        // The definition precedes the first sample in the stream.
        if !self.definition_published.swap(true, Ordering::AcqRel) {
            self.shared
                .publish(PacketBody::MetricDefinition(self.definition.to_record()));
        }
        let metric = Arc::new(Metric::new(
            Arc::clone(&self.definition),
            key.clone(),
            Arc::clone(&self.shared),
        ));
        debug!(
            category = %self.definition.category,
            counter = %self.definition.counter,
            instance = instance_name.unwrap_or("<default>"),
            "metrics.instance.created"
        );
        instances.ordered.push(Arc::clone(&metric));
        let position = instances.ordered.len() - 1;
        instances.by_name.insert(key, position);
        metric
    }

    /// Gets or creates the instance named by the definition's binding
    /// applied to `instance`. No binding or a failed extraction yields no
    /// metric.
    pub fn add_or_get_bound(&self, instance: &dyn Any) -> Option<Arc<Metric>> {
        let binding = self.definition.binding.as_ref()?;
        let name = binding.extract(instance)?;
        Some(self.add_or_get(Some(&name)))
    }

    /// Instance by name; `None` key addresses the default instance.
    pub fn by_name(&self, instance_name: Option<&str>) -> Option<Arc<Metric>> {
        let key = instance_name.map(str::to_owned);
        let instances = self.instances.lock();
        instances
            .by_name
            .get(&key)
            .map(|position| Arc::clone(&instances.ordered[*position]))
    }

    /// Instance by metric id.
    pub fn by_id(&self, metric_id: Uuid) -> Option<Arc<Metric>> {
        let instances = self.instances.lock();
        instances
            .ordered
            .iter()
            .find(|metric| metric.id() == metric_id)
            .cloned()
    }

    /// Instance by creation order.
    pub fn by_index(&self, index: usize) -> Option<Arc<Metric>> {
        self.instances.lock().ordered.get(index).cloned()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.lock().ordered.len()
    }

    /// True when no instance exists yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct RegistryInner {
    by_key: HashMap<(String, String), usize>,
    by_id: HashMap<Uuid, usize>,
    ordered: Vec<Arc<MetricCollection>>,
}

/// The metric engine root: one collection per registered definition.
pub struct MetricRegistry {
    shared: Arc<EngineShared>,
    inner: Mutex<RegistryInner>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// An empty registry. Without an attached publisher, samples stay
    /// in-memory only.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EngineShared::default()),
            inner: Mutex::new(RegistryInner {
                by_key: HashMap::new(),
                by_id: HashMap::new(),
                ordered: Vec::new(),
            }),
        }
    }

    /// Routes definition and sample packets through the session publisher.
    pub(crate) fn attach_publisher(&self, publisher: Arc<Publisher>) {
        let session_start = publisher.context().summary().start_time;
        *self.shared.publisher.lock() = Some(publisher);
        *self.shared.session_start.lock() = Some(session_start);
    }

    /// Registers a definition, or returns the existing collection when the
    /// `(category, counter)` key is already taken by a matching shape. A
    /// mismatched shape is a caller error: definitions are immutable after
    /// first publish.
    pub fn register(&self, definition: MetricDefinition) -> Result<Arc<MetricCollection>> {
        let key = (definition.category.clone(), definition.counter.clone());
        let mut inner = self.inner.lock();
        if let Some(position) = inner.by_key.get(&key) {
            let existing = &inner.ordered[*position];
            if !existing.definition().shape_matches(&definition) {
                return Err(AgentError::InvalidArgument(format!(
                    "metric {}::{} is already registered with a different shape",
                    key.0, key.1
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let id = definition.id;
        let collection = Arc::new(MetricCollection::new(definition, Arc::clone(&self.shared)));
        inner.ordered.push(Arc::clone(&collection));
        let position = inner.ordered.len() - 1;
        inner.by_key.insert(key, position);
        inner.by_id.insert(id, position);
        Ok(collection)
    }

    /// Collection by `(category, counter)`.
    pub fn by_key(&self, category: &str, counter: &str) -> Option<Arc<MetricCollection>> {
        let inner = self.inner.lock();
        inner
            .by_key
            .get(&(category.to_owned(), counter.to_owned()))
            .map(|position| Arc::clone(&inner.ordered[*position]))
    }

    /// Collection by definition id.
    pub fn by_id(&self, definition_id: Uuid) -> Option<Arc<MetricCollection>> {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(&definition_id)
            .map(|position| Arc::clone(&inner.ordered[*position]))
    }

    /// Collection by registration order.
    pub fn by_index(&self, index: usize) -> Option<Arc<MetricCollection>> {
        self.inner.lock().ordered.get(index).cloned()
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.inner.lock().ordered.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
