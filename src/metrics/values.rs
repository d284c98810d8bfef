//! Sampled- and event-metric value calculation.
//!
//! Converts raw sample lists into regularly-spaced, displayable series for a
//! `(interval, intervals, start, end)` request. Pure functions of their
//! inputs: same samples, same request, same output.
//!
//! The original implementation walked backwards for the baseline but read
//! the sample at the pre-walk index; here the walking index is used, so the
//! baseline is genuinely the most recent sample at or before `target - Δ`.

use time::{Duration, OffsetDateTime};

use super::sample::{EventSample, SampledSample};
use crate::error::{AgentError, Result};
use crate::packet::{SampleInterval, SamplingKind, Trend};

/// One computed, time-aligned datapoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    /// Target time of the datapoint.
    pub timestamp: OffsetDateTime,
    /// Computed value.
    pub value: f64,
}

/// A regularly-spaced computed series.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValueCollection {
    /// Requested spacing.
    pub interval: SampleInterval,
    /// Display unit inherited from the definition.
    pub unit_caption: String,
    /// The datapoints, one per target time (plus bracket extrapolations for
    /// `Shortest`).
    pub values: Vec<MetricValue>,
}

/// Spacing between target times for one interval step.
fn interval_duration(interval: SampleInterval, intervals: u32) -> Result<Duration> {
    let base = match interval {
        SampleInterval::Shortest => {
            return Err(AgentError::InvalidArgument(
                "Shortest has no fixed spacing".into(),
            ))
        }
        SampleInterval::Millisecond => Duration::milliseconds(1),
        SampleInterval::Second => Duration::seconds(1),
        SampleInterval::Minute => Duration::minutes(1),
        SampleInterval::Hour => Duration::hours(1),
        SampleInterval::Day => Duration::days(1),
        SampleInterval::Week => Duration::days(7),
        SampleInterval::Month => Duration::days(30),
    };
    if intervals == 0 {
        return Err(AgentError::InvalidArgument(
            "interval multiplier must be at least 1".into(),
        ));
    }
    Ok(base * intervals as i32)
}

// How far past a target time a raw sample may sit and still be used for it.
fn tolerance(interval: SampleInterval) -> Duration {
    match interval {
        SampleInterval::Shortest => Duration::ZERO,
        SampleInterval::Millisecond => Duration::nanoseconds(100),
        SampleInterval::Second => Duration::milliseconds(10),
        SampleInterval::Minute => Duration::seconds(2),
        SampleInterval::Hour => Duration::minutes(1),
        SampleInterval::Day => Duration::minutes(30),
        SampleInterval::Week => Duration::hours(12),
        SampleInterval::Month => Duration::days(2),
    }
}

struct CalcContext<'a> {
    samples: &'a [SampledSample],
    // Inclusive prefix sums for the incremental kinds.
    prefix_raw: Vec<f64>,
    prefix_base: Vec<f64>,
    session_start: OffsetDateTime,
}

impl<'a> CalcContext<'a> {
    fn new(samples: &'a [SampledSample], session_start: OffsetDateTime) -> Self {
        let mut prefix_raw = Vec::with_capacity(samples.len());
        let mut prefix_base = Vec::with_capacity(samples.len());
        let mut raw_total = 0.0;
        let mut base_total = 0.0;
        for sample in samples {
            raw_total += sample.raw_value;
            base_total += sample.base_value.unwrap_or(0.0);
            prefix_raw.push(raw_total);
            prefix_base.push(base_total);
        }
        Self {
            samples,
            prefix_raw,
            prefix_base,
            session_start,
        }
    }

    fn compute(
        &self,
        kind: SamplingKind,
        baseline: Option<usize>,
        current: usize,
    ) -> Result<f64> {
        // A baseline that is not strictly older than the current sample is
        // no baseline at all.
        let baseline = baseline.filter(|b| *b < current);
        let cur = &self.samples[current];
        match kind {
            SamplingKind::NumberOfItems => Ok(cur.raw_value),
            SamplingKind::IncrementalCount => Ok(self.prefix_raw[current]),
            SamplingKind::IncrementalFraction => {
                let value = self.prefix_raw[current];
                let base = self.prefix_base[current];
                fraction(value, base)
            }
            SamplingKind::TotalCount => match baseline {
                Some(b) => Ok(cur.raw_value - self.samples[b].raw_value),
                None => Ok(0.0),
            },
            SamplingKind::TotalFraction => match baseline {
                Some(b) => {
                    let base_sample = &self.samples[b];
                    let value_delta = cur.raw_value - base_sample.raw_value;
                    let base_delta =
                        cur.base_value.unwrap_or(0.0) - base_sample.base_value.unwrap_or(0.0);
                    fraction(value_delta, base_delta)
                }
                None => Ok(0.0),
            },
            SamplingKind::RawCount => match baseline {
                Some(b) => Ok(self.time_weighted_raw(b, current)),
                None => Ok(0.0),
            },
            SamplingKind::RawFraction => match baseline {
                Some(b) => {
                    let value = self.time_weighted_raw(b, current);
                    let base = self.time_weighted_base(b, current);
                    fraction(value, base)
                }
                None => Ok(0.0),
            },
        }
    }

    // Average of the raw values over [baseline, current], each value
    // weighted by how long it held, with the window clamped to start no
    // earlier than the session itself.
    fn time_weighted_raw(&self, baseline: usize, current: usize) -> f64 {
        self.time_weighted(baseline, current, |sample| sample.raw_value)
    }

    fn time_weighted_base(&self, baseline: usize, current: usize) -> f64 {
        self.time_weighted(baseline, current, |sample| sample.base_value.unwrap_or(0.0))
    }

    fn time_weighted(
        &self,
        baseline: usize,
        current: usize,
        value_of: impl Fn(&SampledSample) -> f64,
    ) -> f64 {
        let span_start = self.samples[baseline]
            .sample_timestamp
            .max(self.session_start);
        let span_end = self.samples[current].sample_timestamp;
        if span_end <= span_start {
            return value_of(&self.samples[current]);
        }
        let total_span = (span_end - span_start).as_seconds_f64();
        let mut weighted = 0.0;
        for index in baseline..current {
            let segment_start = self.samples[index].sample_timestamp.max(span_start);
            let segment_end = self.samples[index + 1].sample_timestamp.min(span_end);
            if segment_end > segment_start {
                weighted +=
                    value_of(&self.samples[index]) * (segment_end - segment_start).as_seconds_f64();
            }
        }
        weighted / total_span
    }
}

fn fraction(value: f64, base: f64) -> Result<f64> {
    if base == 0.0 {
        if value == 0.0 {
            Ok(0.0)
        } else {
            Err(AgentError::DataCollection(
                "zero base delta with a non-zero value delta".into(),
            ))
        }
    } else {
        Ok(value / base)
    }
}

/// Computes a regularly-spaced series from raw samples.
///
/// Samples must be ordered by `sample_timestamp` (the metric keeps them that
/// way). `session_start` bounds the time-weighted window of the raw kinds.
/// Underlying samples are never modified: a `DataCollection` error leaves
/// them intact for a retry with different parameters.
#[allow(clippy::too_many_arguments)]
pub fn calculate_sampled_values(
    samples: &[SampledSample],
    kind: SamplingKind,
    unit_caption: &str,
    interval: SampleInterval,
    intervals: u32,
    start: OffsetDateTime,
    end: OffsetDateTime,
    session_start: OffsetDateTime,
) -> Result<MetricValueCollection> {
    if end < start {
        return Err(AgentError::InvalidArgument(
            "calculation end precedes start".into(),
        ));
    }
    if interval == SampleInterval::Shortest {
        return calculate_shortest(samples, kind, unit_caption, start, end, session_start);
    }
    let delta = interval_duration(interval, intervals)?;
    let tol = tolerance(interval);
    let context = CalcContext::new(samples, session_start);

    let span_nanos = (end - start).whole_nanoseconds();
    let delta_nanos = delta.whole_nanoseconds();
    let points = (span_nanos / delta_nanos) as u64 + 1;

    let mut values = Vec::with_capacity(points as usize);
    let mut previous: Option<f64> = None;
    for point in 0..points {
        let target = start + delta * point as i32;
        let cutoff = target + tol;
        // The best fit is the last raw sample not past the tolerance
        // window; earlier samples inside the same window are dropped.
        let fit = samples.partition_point(|sample| sample.sample_timestamp < cutoff);
        let value = if fit == 0 {
            // Nothing fits this target: reissue the previous value.
            previous.unwrap_or(0.0)
        } else {
            let current = fit - 1;
            let baseline_cutoff = target - delta;
            let baseline_fit =
                samples.partition_point(|sample| sample.sample_timestamp <= baseline_cutoff);
            let baseline = baseline_fit.checked_sub(1);
            context.compute(kind, baseline, current)?
        };
        values.push(MetricValue {
            timestamp: target,
            value,
        });
        previous = Some(value);
    }
    Ok(MetricValueCollection {
        interval,
        unit_caption: unit_caption.to_owned(),
        values,
    })
}

// Shortest interval: raw samples as-is within [start, end], with synthetic
// bracket samples extrapolated at the range edges when out-of-range samples
// exist on that side.
fn calculate_shortest(
    samples: &[SampledSample],
    kind: SamplingKind,
    unit_caption: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
    session_start: OffsetDateTime,
) -> Result<MetricValueCollection> {
    let context = CalcContext::new(samples, session_start);
    let first_in = samples.partition_point(|sample| sample.sample_timestamp < start);
    let past_end = samples.partition_point(|sample| sample.sample_timestamp <= end);

    let mut values = Vec::new();
    if first_in < past_end {
        let first_sample = &samples[first_in];
        if first_sample.sample_timestamp > start && first_in >= 1 {
            // Extrapolate at the range start from the samples before it.
            let before = first_in - 1;
            let prior_baseline = before.checked_sub(1);
            if !kind.requires_baseline() || prior_baseline.is_some() {
                values.push(MetricValue {
                    timestamp: start,
                    value: context.compute(kind, prior_baseline, before)?,
                });
            }
        }
        for index in first_in..past_end {
            let baseline = index.checked_sub(1);
            values.push(MetricValue {
                timestamp: samples[index].sample_timestamp,
                value: context.compute(kind, baseline, index)?,
            });
        }
        let last_in = past_end - 1;
        if samples[last_in].sample_timestamp < end && past_end < samples.len() {
            values.push(MetricValue {
                timestamp: end,
                value: context.compute(kind, Some(last_in), past_end)?,
            });
        }
    }
    Ok(MetricValueCollection {
        interval: SampleInterval::Shortest,
        unit_caption: unit_caption.to_owned(),
        values,
    })
}

/// Aggregates one event-metric value column over regular intervals.
///
/// `Count`/`Sum` report 0 for an empty interval; `Min`/`Max`/`Average`
/// carry the previous value forward; the running trends accumulate from the
/// range start.
pub fn calculate_event_values(
    events: &[EventSample],
    column: usize,
    trend: Trend,
    unit_caption: &str,
    interval: SampleInterval,
    intervals: u32,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<MetricValueCollection> {
    if end < start {
        return Err(AgentError::InvalidArgument(
            "calculation end precedes start".into(),
        ));
    }
    let delta = interval_duration(interval, intervals)?;

    let span_nanos = (end - start).whole_nanoseconds();
    let delta_nanos = delta.whole_nanoseconds();
    let points = (span_nanos / delta_nanos) as u64 + 1;

    let mut values = Vec::with_capacity(points as usize);
    let mut previous = 0.0f64;
    let mut running_count = 0u64;
    let mut running_sum = 0.0f64;
    let mut cursor = 0usize;
    // Events before the range still advance the cursor but never the
    // running totals.
    while cursor < events.len() && events[cursor].timestamp < start - delta {
        cursor += 1;
    }
    for point in 0..points {
        let target = start + delta * point as i32;
        let window_start = target - delta;
        let mut window: Vec<f64> = Vec::new();
        while cursor < events.len() && events[cursor].timestamp <= target {
            let event = &events[cursor];
            if event.timestamp > window_start {
                let column_value = event.values.get(column).copied().ok_or_else(|| {
                    AgentError::InvalidArgument(format!(
                        "event lacks value column {column}"
                    ))
                })?;
                window.push(column_value);
                if event.timestamp >= start {
                    running_count += 1;
                    running_sum += column_value;
                }
            }
            cursor += 1;
        }
        let value = match trend {
            Trend::Count => window.len() as f64,
            Trend::Sum => window.iter().sum(),
            Trend::Min => window
                .iter()
                .copied()
                .reduce(f64::min)
                .unwrap_or(previous),
            Trend::Max => window
                .iter()
                .copied()
                .reduce(f64::max)
                .unwrap_or(previous),
            Trend::Average => {
                if window.is_empty() {
                    previous
                } else {
                    window.iter().sum::<f64>() / window.len() as f64
                }
            }
            Trend::RunningCount => running_count as f64,
            Trend::RunningSum => running_sum,
        };
        values.push(MetricValue {
            timestamp: target,
            value,
        });
        previous = value;
    }
    Ok(MetricValueCollection {
        interval,
        unit_caption: unit_caption.to_owned(),
        values,
    })
}
