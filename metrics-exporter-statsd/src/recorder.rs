use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use metrics::{Counter, CounterFn, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;

use crate::{client::StatsdClient, error::Error};

/// A recorder that sends metrics through a [`StatsdClient`].
///
/// The name of a metric's key is used as the basename, and its labels as the values for the stat patterns. Only counter
/// increments and gauges are supported: absolute counter values and histograms are reported to the observers as
/// unsupported and otherwise ignored.
pub struct StatsdRecorder {
    client: StatsdClient,
    gauges: RwLock<HashMap<Key, Arc<GaugeHandle>>>,
}

impl StatsdRecorder {
    pub(crate) fn new(client: StatsdClient) -> Self {
        StatsdRecorder { client, gauges: RwLock::new(HashMap::new()) }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &StatsdClient {
        &self.client
    }
}

impl Recorder for StatsdRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CounterHandle { client: self.client.clone(), key: key.clone() }))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        if let Some(existing) = self.gauges.read().get(key) {
            return Gauge::from_arc(Arc::clone(existing));
        }

        // Gauges sharing a key share their value, since only absolute values are sent.
        let handle = Arc::clone(self.gauges.write().entry(key.clone()).or_insert_with(|| {
            Arc::new(GaugeHandle { client: self.client.clone(), key: key.clone(), value: AtomicU64::new(0) })
        }));
        Gauge::from_arc(handle)
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        self.client.warn(&Error::UnsupportedStatKind { kind: "histogram".to_string() });
        Histogram::noop()
    }
}

struct CounterHandle {
    client: StatsdClient,
    key: Key,
}

impl CounterFn for CounterHandle {
    fn increment(&self, value: u64) {
        self.client.counter(self.key.name(), &self.key, value);
    }

    fn absolute(&self, _: u64) {
        self.client.warn(&Error::UnsupportedStatKind { kind: "absolute counter".to_string() });
    }
}

struct GaugeHandle {
    client: StatsdClient,
    key: Key,
    value: AtomicU64,
}

impl GaugeHandle {
    /// Applies `f` to the current value, and sends the result.
    fn update<F>(&self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let updated = f(f64::from_bits(current));
            match self.value.compare_exchange_weak(current, updated.to_bits(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.client.gauge(self.key.name(), &self.key, updated);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use metrics::{Key, Label, Metadata, Recorder as _};

    use crate::{error::Error, Observer, StatsdBuilder};

    #[derive(Default)]
    struct UnsupportedKinds(AtomicUsize);

    impl Observer for UnsupportedKinds {
        fn warn(&self, error: &Error) {
            if matches!(error, Error::UnsupportedStatKind { .. }) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn metadata() -> Metadata<'static> {
        Metadata::new(module_path!(), metrics::Level::INFO, Some(module_path!()))
    }

    #[test]
    fn histograms_and_absolute_counters_are_unsupported() {
        let observer = Arc::new(UnsupportedKinds::default());
        let recorder = StatsdBuilder::default()
            .with_remote_address("127.0.0.1", 1)
            .with_observer(Arc::clone(&observer))
            .build_recorder()
            .unwrap();

        let key = Key::from_parts("myapp.latency", vec![Label::new("host", "host001")]);
        recorder.register_histogram(&key, &metadata()).record(1.0);
        recorder.register_counter(&key, &metadata()).absolute(5);

        assert_eq!(observer.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn gauges_share_value_per_key() {
        let recorder = StatsdBuilder::default().with_remote_address("127.0.0.1", 1).build_recorder().unwrap();

        let key = Key::from_name("myapp.connections");
        let first = recorder.register_gauge(&key, &metadata());
        let second = recorder.register_gauge(&key, &metadata());
        first.set(3.0);
        second.increment(2.0);

        assert_eq!(recorder.gauges.read().len(), 1);
        let value = recorder.gauges.read()[&key].value.load(Ordering::Relaxed);
        assert_eq!(f64::from_bits(value), 5.0);
    }
}
