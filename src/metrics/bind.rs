use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Derives a metric instance name from a caller-supplied object.
///
/// The schema is declared as a value: the caller provides the accessor
/// function together with descriptive metadata, so no runtime reflection is
/// involved. Extraction failure yields no metric, never an error; the first
/// failure per binding is logged.
#[derive(Clone)]
pub struct NameBinding {
    /// Type name the binding expects, recorded for diagnostics.
    pub bound_type_name: String,
    /// Member the accessor reads, recorded for diagnostics.
    pub member_name: String,
    accessor: Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>,
    warned: Arc<AtomicBool>,
}

impl std::fmt::Debug for NameBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameBinding")
            .field("bound_type_name", &self.bound_type_name)
            .field("member_name", &self.member_name)
            .finish()
    }
}

impl NameBinding {
    /// Wraps an accessor function with its descriptive metadata.
    pub fn new(
        bound_type_name: impl Into<String>,
        member_name: impl Into<String>,
        accessor: impl Fn(&dyn Any) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            bound_type_name: bound_type_name.into(),
            member_name: member_name.into(),
            accessor: Arc::new(accessor),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Convenience constructor for a typed accessor; downcasting failure is
    /// an extraction failure.
    pub fn for_type<T: 'static>(
        bound_type_name: impl Into<String>,
        member_name: impl Into<String>,
        accessor: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        Self::new(bound_type_name, member_name, move |instance: &dyn Any| {
            instance.downcast_ref::<T>().map(&accessor)
        })
    }

    /// Extracts the instance name, logging the first failure only.
    pub fn extract(&self, instance: &dyn Any) -> Option<String> {
        let name = (self.accessor)(instance);
        if name.is_none() && !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                bound_type = %self.bound_type_name,
                member = %self.member_name,
                "metrics.bind.extraction_failed"
            );
        }
        name
    }
}
