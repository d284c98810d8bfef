//! The metric aggregation engine.
//!
//! Definitions describe metrics ([`MetricDefinition`], one per
//! `(category, counter)`); collections map instance names to [`Metric`]
//! instances with a lock-guarded get-or-create; the value engine in
//! [`values`] turns raw sample lists into regularly-spaced displayable
//! series. Bound metrics derive their instance name from a caller-supplied
//! accessor schema ([`NameBinding`]) rather than reflection.

mod bind;
mod collection;
mod definition;
mod sample;
pub mod values;

pub use bind::NameBinding;
pub use collection::{Metric, MetricCollection, MetricRegistry};
pub use definition::{MetricDefinition, MetricKind};
pub use sample::{EventSample, SampledSample};
pub use values::{MetricValue, MetricValueCollection};
