#![allow(missing_docs)]

use lantern::metrics::{MetricDefinition, MetricRegistry, NameBinding};
use lantern::packet::EventValueDefinition;
use lantern::{AgentError, SampleInterval, SamplingKind, Trend};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

fn t(seconds: i64) -> OffsetDateTime {
    datetime!(2024-05-01 12:00:00 UTC) + Duration::seconds(seconds)
}

#[test]
fn total_count_fixture_produces_documented_series() {
    // Definition with sample_type=TotalCount; samples (t=0, raw=10),
    // (t=1, raw=25), (t=2, raw=40). One-second calculation over [0, 2]:
    // the first point has no baseline before the range and reports the
    // documented default of zero; the remaining points are deltas.
    let registry = MetricRegistry::new();
    let collection = registry
        .register(MetricDefinition::sampled(
            "test",
            "Fixture",
            "total_count",
            SamplingKind::TotalCount,
            SampleInterval::Second,
            "ops",
        ))
        .unwrap();
    let metric = collection.add_or_get(None);
    for (seconds, raw) in [(0, 10.0), (1, 25.0), (2, 40.0)] {
        metric.record_sample(raw, None, None, t(seconds)).unwrap();
    }

    let series = metric
        .calculate_values(SampleInterval::Second, 1, t(0), t(2))
        .unwrap();
    let points: Vec<(OffsetDateTime, f64)> =
        series.values.iter().map(|v| (v.timestamp, v.value)).collect();
    assert_eq!(
        points,
        vec![(t(0), 0.0), (t(1), 15.0), (t(2), 15.0)]
    );
}

#[test]
fn value_count_matches_the_interval_formula() {
    let registry = MetricRegistry::new();
    let collection = registry
        .register(MetricDefinition::sampled(
            "test",
            "Fixture",
            "items",
            SamplingKind::NumberOfItems,
            SampleInterval::Second,
            "",
        ))
        .unwrap();
    let metric = collection.add_or_get(None);
    for seconds in 0..=60 {
        metric
            .record_sample(seconds as f64, None, None, t(seconds))
            .unwrap();
    }
    for (intervals, expected) in [(1u32, 61usize), (5, 13), (30, 3), (60, 2)] {
        let series = metric
            .calculate_values(SampleInterval::Second, intervals, t(0), t(60))
            .unwrap();
        assert_eq!(series.values.len(), expected, "intervals={intervals}");
    }
}

struct Order {
    id: u64,
}

#[test]
fn bound_event_metric_reuses_instances_by_extracted_name() {
    // NameMemberName="id": the accessor schema replaces reflection. Two
    // objects with id 42 share an instance; id 43 creates a new one.
    let registry = MetricRegistry::new();
    let definition = MetricDefinition::event(
        "test",
        "Orders",
        "timing",
        SampleInterval::Second,
        vec![EventValueDefinition {
            name: "duration".into(),
            unit_caption: "ms".into(),
            default_trend: Trend::Average,
        }],
    )
    .unwrap()
    .with_binding(NameBinding::for_type::<Order>("Order", "id", |order| {
        order.id.to_string()
    }));
    let collection = registry.register(definition).unwrap();

    let first = collection.add_or_get_bound(&Order { id: 42 }).unwrap();
    let same = collection.add_or_get_bound(&Order { id: 42 }).unwrap();
    let other = collection.add_or_get_bound(&Order { id: 43 }).unwrap();
    assert_eq!(first.id(), same.id());
    assert_ne!(first.id(), other.id());

    // A foreign object extracts no name and produces no metric.
    assert!(collection.add_or_get_bound(&12u32).is_none());
}

#[test]
fn event_trends_shape_the_derived_series() {
    let registry = MetricRegistry::new();
    let definition = MetricDefinition::event(
        "test",
        "Requests",
        "latency",
        SampleInterval::Second,
        vec![
            EventValueDefinition {
                name: "duration".into(),
                unit_caption: "ms".into(),
                default_trend: Trend::Average,
            },
            EventValueDefinition {
                name: "bytes".into(),
                unit_caption: "b".into(),
                default_trend: Trend::Sum,
            },
        ],
    )
    .unwrap();
    let collection = registry.register(definition).unwrap();
    let metric = collection.add_or_get(None);
    metric.record_event(vec![10.0, 100.0], t(1)).unwrap();
    metric.record_event(vec![30.0, 200.0], t(1)).unwrap();
    metric.record_event(vec![50.0, 400.0], t(2)).unwrap();

    let average = metric
        .calculate_event_values("duration", None, SampleInterval::Second, 1, t(0), t(2))
        .unwrap();
    let averages: Vec<f64> = average.values.iter().map(|v| v.value).collect();
    assert_eq!(averages, vec![0.0, 20.0, 50.0]);

    let totals = metric
        .calculate_event_values("bytes", None, SampleInterval::Second, 1, t(0), t(2))
        .unwrap();
    let sums: Vec<f64> = totals.values.iter().map(|v| v.value).collect();
    assert_eq!(sums, vec![0.0, 300.0, 400.0]);

    let running = metric
        .calculate_event_values(
            "bytes",
            Some(Trend::RunningSum),
            SampleInterval::Second,
            1,
            t(0),
            t(2),
        )
        .unwrap();
    let running_sums: Vec<f64> = running.values.iter().map(|v| v.value).collect();
    assert_eq!(running_sums, vec![0.0, 300.0, 700.0]);
}

#[test]
fn zero_base_delta_surfaces_a_data_collection_error() {
    let registry = MetricRegistry::new();
    let collection = registry
        .register(MetricDefinition::sampled(
            "test",
            "Fixture",
            "fraction",
            SamplingKind::TotalFraction,
            SampleInterval::Second,
            "%",
        ))
        .unwrap();
    let metric = collection.add_or_get(None);
    metric.record_sample(10.0, Some(5.0), None, t(0)).unwrap();
    metric.record_sample(20.0, Some(5.0), None, t(1)).unwrap();

    let err = metric
        .calculate_values(SampleInterval::Second, 1, t(0), t(1))
        .unwrap_err();
    assert!(matches!(err, AgentError::DataCollection(_)));
    // Samples survive the failed calculation.
    assert_eq!(metric.sampled_snapshot().len(), 2);
}

#[test]
fn shortest_interval_emits_bracket_extrapolations() {
    let registry = MetricRegistry::new();
    let collection = registry
        .register(MetricDefinition::sampled(
            "test",
            "Fixture",
            "shortest",
            SamplingKind::NumberOfItems,
            SampleInterval::Second,
            "",
        ))
        .unwrap();
    let metric = collection.add_or_get(None);
    for (seconds, raw) in [(0, 1.0), (1, 2.0), (3, 3.0), (5, 4.0), (8, 5.0)] {
        metric.record_sample(raw, None, None, t(seconds)).unwrap();
    }

    let series = metric
        .calculate_values(SampleInterval::Shortest, 1, t(2), t(6))
        .unwrap();
    // In range: t=3 and t=5; extrapolated brackets at t=2 and t=6.
    let in_range = 2;
    assert!(series.values.len() <= in_range + 2);
    assert_eq!(series.values.len(), 4);
    assert_eq!(series.values.first().unwrap().timestamp, t(2));
    assert_eq!(series.values.last().unwrap().timestamp, t(6));
    assert_eq!(series.values.last().unwrap().value, 5.0);
}

#[test]
fn calculation_is_deterministic() {
    let registry = MetricRegistry::new();
    let collection = registry
        .register(MetricDefinition::sampled(
            "test",
            "Fixture",
            "det",
            SamplingKind::TotalCount,
            SampleInterval::Second,
            "",
        ))
        .unwrap();
    let metric = collection.add_or_get(None);
    for seconds in 0..30 {
        metric
            .record_sample((seconds * seconds) as f64, None, None, t(seconds))
            .unwrap();
    }
    let first = metric
        .calculate_values(SampleInterval::Second, 3, t(0), t(29))
        .unwrap();
    let second = metric
        .calculate_values(SampleInterval::Second, 3, t(0), t(29))
        .unwrap();
    assert_eq!(first, second);
}
