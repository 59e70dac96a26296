use std::{collections::BTreeMap, sync::Arc};

use crossbeam_channel::{Sender, TrySendError};
use mio::Waker;
use quanta::{Clock, Instant};
use tracing::trace;

use crate::{
    error::{Error, TransportError},
    forwarder::Shared,
    observer::Observers,
    pattern::{expand, Labels},
    queue::DataPoint,
    state::ConnectionStatus,
    writer::{MetricValue, StatKind},
};

struct Inner {
    tx: Sender<DataPoint>,
    waker: Waker,
    shared: Arc<Shared>,
    stat_map: BTreeMap<String, Vec<String>>,
    observers: Observers,
    clock: Clock,
}

impl Inner {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            trace!(error = %e, "Failed to wake forwarder.");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.close();
        self.wake();
    }
}

/// Client for sending stats to a statsd aggregator over TCP.
///
/// Each emitted basename is looked up in the configured stat map, and one stat is sent per pattern registered for it.
/// Emitting never blocks and never fails: stats are handed off to a background forwarder, which holds them in a bounded
/// queue while it is not connected, and reconnects on its own after any error. Problems are reported to the
/// registered [`Observer`][crate::Observer]s.
///
/// The client is cheap to clone. When the last clone is dropped, the forwarder keeps sending what is queued for up to a
/// second if it is connected, and then stops.
#[derive(Clone)]
pub struct StatsdClient {
    inner: Arc<Inner>,
}

impl StatsdClient {
    pub(crate) fn new(
        tx: Sender<DataPoint>,
        waker: Waker,
        shared: Arc<Shared>,
        stat_map: BTreeMap<String, Vec<String>>,
        observers: Observers,
        clock: Clock,
    ) -> Self {
        StatsdClient { inner: Arc::new(Inner { tx, waker, shared, stat_map, observers, clock }) }
    }

    /// Emits a counter for every pattern registered for `basename`.
    pub fn counter<L, V>(&self, basename: &str, labels: &L, value: V)
    where
        L: Labels + ?Sized,
        V: Into<MetricValue>,
    {
        self.blast(StatKind::Counter, basename, labels, value.into());
    }

    /// Emits a gauge for every pattern registered for `basename`.
    pub fn gauge<L, V>(&self, basename: &str, labels: &L, value: V)
    where
        L: Labels + ?Sized,
        V: Into<MetricValue>,
    {
        self.blast(StatKind::Gauge, basename, labels, value.into());
    }

    /// Emits a stat whose kind is given by name, either `counter` or `gauge`.
    ///
    /// Any other kind is reported to the observers, and nothing is sent.
    pub fn emit<L, V>(&self, kind: &str, basename: &str, labels: &L, value: V)
    where
        L: Labels + ?Sized,
        V: Into<MetricValue>,
    {
        match kind.parse::<StatKind>() {
            Ok(kind) => self.blast(kind, basename, labels, value.into()),
            Err(e) => self.warn(&e),
        }
    }

    fn blast<L>(&self, kind: StatKind, basename: &str, labels: &L, value: MetricValue)
    where
        L: Labels + ?Sized,
    {
        let patterns = match self.inner.stat_map.get(basename) {
            Some(patterns) => patterns,
            None => return,
        };

        let timestamp = self.inner.clock.now();
        let mut sent = false;
        for pattern in patterns {
            let stat_name = match expand(pattern, basename, labels) {
                Ok(stat_name) => stat_name,
                Err(e) => {
                    self.warn(&e.into());
                    continue;
                }
            };

            match self.inner.tx.try_send(DataPoint::new(kind, stat_name, value, timestamp)) {
                Ok(()) => sent = true,
                Err(TrySendError::Full(_)) => {
                    trace!(basename, "Forwarder channel full, dropping point.");
                    self.inner.shared.track_dropped();
                }
                Err(TrySendError::Disconnected(_)) => {
                    trace!(basename, "Forwarder stopped, dropping point.");
                    self.inner.shared.track_dropped();
                }
            }
        }

        if sent {
            self.inner.wake();
        }
    }

    pub(crate) fn warn(&self, error: &Error) {
        self.inner.observers.warn(error);
    }

    /// Number of connections established so far.
    pub fn connects(&self) -> u64 {
        self.inner.shared.status().connects
    }

    /// Number of connection attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.inner.shared.status().attempts
    }

    /// The error that took down the last connection, or [`TransportError::NeverConnected`] before the first one.
    ///
    /// Returns `None` while connected.
    pub fn last_error(&self) -> Option<Arc<TransportError>> {
        self.inner.shared.status().last_error
    }

    /// When data was last written to the aggregator, if ever.
    pub fn last_write_time(&self) -> Option<Instant> {
        self.inner.shared.status().last_write
    }

    /// Whether the client is connected and sending stats as they are emitted.
    pub fn is_nominal(&self) -> bool {
        self.status() == ConnectionStatus::Nominal
    }

    /// Current state of the connection to the aggregator.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.shared.status().state
    }

    /// Number of points dropped so far, either because the queue was over its bounds or because the forwarder could not
    /// keep up.
    pub fn dropped_points(&self) -> u64 {
        self.inner.shared.dropped()
    }
}
