use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Error;

/// Receives notifications about the client's operation.
///
/// Observers are called synchronously: `warn` may run on the thread calling into the client (for errors such as a
/// stat pattern failing to expand) or on the forwarder thread (for connection errors). Implementations should return
/// quickly and must not panic.
pub trait Observer: Send + Sync {
    /// Called for every anomaly: stat patterns that cannot be expanded, unsupported stat kinds, and connection
    /// failures.
    fn warn(&self, _error: &Error) {}

    /// Called each time a connection to the aggregator is established.
    fn nominal(&self) {}
}

impl<T: Observer + ?Sized> Observer for Arc<T> {
    fn warn(&self, error: &Error) {
        (**self).warn(error);
    }

    fn nominal(&self) {
        (**self).nominal();
    }
}

/// The set of registered observers.
#[derive(Clone)]
pub(crate) struct Observers {
    observers: Arc<[Arc<dyn Observer>]>,
}

impl Default for Observers {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Observers {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers: observers.into() }
    }

    pub fn warn(&self, error: &Error) {
        warn!(%error, "statsd client warning.");
        for observer in self.observers.iter() {
            observer.warn(error);
        }
    }

    pub fn nominal(&self) {
        debug!("Connection to statsd aggregator established.");
        for observer in self.observers.iter() {
            observer.nominal();
        }
    }
}
