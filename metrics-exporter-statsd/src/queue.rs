use std::{collections::VecDeque, time::Duration};

use quanta::Instant;

use crate::writer::{MetricValue, StatKind};

/// A single stat awaiting transmission.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DataPoint {
    pub kind: StatKind,
    pub stat_name: String,
    pub value: MetricValue,
    pub timestamp: Instant,
}

impl DataPoint {
    pub fn new(kind: StatKind, stat_name: String, value: MetricValue, timestamp: Instant) -> Self {
        Self { kind, stat_name, value, timestamp }
    }
}

/// Destination for points drained from a [`DeliveryQueue`].
pub(crate) trait PointSink {
    /// Returns `true` if the sink can take another point right now.
    fn is_writable(&self) -> bool;

    /// Takes ownership of the next point.
    fn send(&mut self, point: DataPoint);
}

/// Bounded FIFO of data points waiting for a connection.
///
/// The queue is bounded both by the number of points it holds and by the age of the oldest point. New points are
/// dropped, never old ones: a point is rejected when the queue is full, or when it is at least `max_age` younger than
/// the point at the head of the queue. Only the head is compared, so points further back are never evicted here; they
/// leave the queue by being sent.
pub(crate) struct DeliveryQueue {
    points: VecDeque<DataPoint>,
    max_points: usize,
    max_age: Duration,
}

impl DeliveryQueue {
    pub fn new(max_points: usize, max_age: Duration) -> Self {
        Self { points: VecDeque::new(), max_points, max_age }
    }

    /// Appends `point` to the queue, unless either bound rejects it.
    ///
    /// Returns `true` if the point was queued.
    pub fn enqueue(&mut self, point: DataPoint) -> bool {
        if self.points.len() >= self.max_points {
            return false;
        }

        if let Some(head) = self.points.front() {
            if point.timestamp.saturating_duration_since(head.timestamp) >= self.max_age {
                return false;
            }
        }

        self.points.push_back(point);
        true
    }

    /// Hands points to `sink`, oldest first, for as long as it stays writable.
    pub fn drain_into<S>(&mut self, sink: &mut S)
    where
        S: PointSink + ?Sized,
    {
        while sink.is_writable() {
            match self.points.pop_front() {
                Some(point) => sink.send(point),
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
