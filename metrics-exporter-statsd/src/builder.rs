use std::{io, sync::Arc, time::Duration};

use mio::{Poll, Waker};
use quanta::Clock;
use thiserror::Error;
use tracing::debug;

use crate::{
    client::StatsdClient,
    config::{ClientConfig, ConfigError},
    forwarder::{Forwarder, ForwarderConfiguration, Shared, WAKER},
    observer::{Observer, Observers},
    recorder::StatsdRecorder,
};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Errors that could occur while building or installing a statsd client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Failed to create the poller used by the forwarder.
    #[error("failed to create poller: {0}")]
    Io(#[from] io::Error),

    /// Failed to spawn the forwarder thread.
    #[error("failed to spawn background thread for forwarder")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install exporter as global recorder")]
    FailedToInstall,
}

/// Builder for a statsd client.
pub struct StatsdBuilder {
    config: ClientConfig,
    reconnect_delay: Duration,
    channel_capacity: usize,
    observers: Vec<Arc<dyn Observer>>,
    clock: Clock,
}

impl StatsdBuilder {
    /// Creates a builder from an existing configuration.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error will be returned describing the first problem found.
    pub fn from_config(config: ClientConfig) -> Result<Self, BuildError> {
        config.validate()?;
        Ok(StatsdBuilder { config, ..Default::default() })
    }

    /// Set the address of the statsd aggregator.
    ///
    /// The host is resolved again at every connection attempt.
    ///
    /// Defaults to `127.0.0.1:8125`.
    #[must_use]
    pub fn with_remote_address<H>(mut self, host: H, port: u16) -> Self
    where
        H: Into<String>,
    {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Set the maximum number of points held while disconnected.
    ///
    /// Once the queue holds this many points, new points are dropped. A value of zero drops every point emitted while
    /// disconnected.
    ///
    /// Defaults to 1000.
    #[must_use]
    pub fn with_max_queue_points(mut self, max_queue_points: usize) -> Self {
        self.config.max_queue_points = max_queue_points;
        self
    }

    /// Set the maximum age of the points held while disconnected.
    ///
    /// New points are dropped once they are at least this much younger than the oldest point in the queue.
    ///
    /// Defaults to 2 seconds.
    #[must_use]
    pub fn with_max_queue_age(mut self, max_queue_age: Duration) -> Self {
        self.config.max_queue_age_ms = u64::try_from(max_queue_age.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Register the stat patterns to emit for `basename`.
    ///
    /// Replaces any patterns previously registered for it.
    #[must_use]
    pub fn with_stat<B, I, P>(mut self, basename: B, patterns: I) -> Self
    where
        B: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.config.stat_map.insert(basename.into(), patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Set how long to wait after a connection error before trying again.
    ///
    /// Delays longer than a day are clamped to a day.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the capacity of the channel between the client and its forwarder.
    ///
    /// Points emitted while the channel is full are dropped. The capacity is at least 1: a capacity of zero is raised
    /// to 1.
    ///
    /// Defaults to 1024.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Register an observer.
    ///
    /// Any number of observers can be registered, and all of them are notified of every event.
    #[must_use]
    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Set the clock used to timestamp points and to time reconnection attempts.
    ///
    /// Mostly useful for testing with a mocked clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the client.
    ///
    /// The forwarder thread is spawned and starts connecting right away.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or if the poller or the forwarder thread cannot be created, an error will be
    /// returned.
    pub fn build(self) -> Result<StatsdClient, BuildError> {
        self.config.validate()?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let (tx, rx) = crossbeam_channel::bounded(self.channel_capacity.max(1));

        let shared = Arc::new(Shared::new());
        let observers = Observers::new(self.observers);

        let forwarder_config = ForwarderConfiguration {
            host: self.config.host.clone(),
            port: self.config.port,
            max_queue_points: self.config.max_queue_points,
            max_queue_age: self.config.max_queue_age(),
            reconnect_delay: self.reconnect_delay,
        };
        debug!(host = %forwarder_config.host, port = forwarder_config.port, "Starting statsd forwarder.");

        let forwarder =
            Forwarder::new(forwarder_config, poll, rx, self.clock.clone(), Arc::clone(&shared), observers.clone());

        std::thread::Builder::new()
            .name("metrics-exporter-statsd-forwarder".to_string())
            .spawn(move || forwarder.run())
            .map_err(|_| BuildError::Backend)?;

        Ok(StatsdClient::new(tx, waker, shared, self.config.stat_map, observers, self.clock))
    }

    /// Builds the client and wraps it in a recorder.
    ///
    /// The recorder must be manually installed by the caller.
    ///
    /// # Errors
    ///
    /// See [`StatsdBuilder::build`].
    pub fn build_recorder(self) -> Result<StatsdRecorder, BuildError> {
        self.build().map(StatsdRecorder::new)
    }

    /// Builds the recorder and installs it as the global recorder.
    ///
    /// # Errors
    ///
    /// See [`StatsdBuilder::build`]. An error is also returned if a global recorder is already installed.
    pub fn install(self) -> Result<(), BuildError> {
        let recorder = self.build_recorder()?;

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            config: ClientConfig::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            observers: Vec::new(),
            clock: Clock::new(),
        }
    }
}
