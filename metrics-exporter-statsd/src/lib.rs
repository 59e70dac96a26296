//! A resilient client for sending counters and gauges to a [statsd][statsd] aggregator over TCP.
//!
//! [statsd]: https://github.com/statsd/statsd
//!
//! # Usage
//!
//! Stats are emitted by basename, together with a set of labels. Each basename maps to any number of stat patterns,
//! which are expanded into the names actually sent:
//!
//! ```no_run
//! # use metrics_exporter_statsd::StatsdBuilder;
//! // First, create a builder, and register the patterns to emit for each basename.
//! //
//! // `%_name` expands to the basename, and any other `%token` to the value of the label called `token`.
//! let client = StatsdBuilder::default()
//!     .with_remote_address("127.0.0.1", 8125)
//!     .with_stat("myapp.requests", ["%_name", "%_name.byhost.%host"])
//!     .build()
//!     .expect("failed to build client");
//!
//! // This sends `myapp.requests:1|c` and `myapp.requests.byhost.host001:1|c`.
//! client.counter("myapp.requests", &[("host", "host001")], 1);
//!
//! // Basenames with no registered patterns are ignored.
//! client.gauge("myapp.unmapped", &(), 42);
//! ```
//!
//! The client can also be wrapped in a [`metrics`] recorder, in which case the name of each metric's key is used as
//! the basename, and its labels as the labels:
//!
//! ```no_run
//! # use metrics_exporter_statsd::StatsdBuilder;
//! StatsdBuilder::default()
//!     .with_stat("myapp.requests", ["%_name.bymethod.%method"])
//!     .install()
//!     .expect("failed to install recorder");
//!
//! metrics::counter!("myapp.requests", "method" => "GET").increment(1);
//! ```
//!
//! # Features
//!
//! ## Fire and forget
//!
//! Emitting a stat never blocks and never fails. Stats are handed off to a background thread, which owns the
//! connection to the aggregator. Problems such as connection errors or stat patterns that cannot be expanded are
//! reported to the [`Observer`]s registered on the builder, and logged through [`tracing`][tracing].
//!
//! ## Reconnection
//!
//! Whenever the connection fails or is closed by the aggregator, the client waits for a fixed delay, and then connects
//! again, forever.
//!
//! ## Bounded queueing
//!
//! While disconnected, stats are held in a queue, and sent in order once connected again. The queue is bounded by the
//! number of stats it holds and by the age of the oldest one: once either bound is reached, new stats are dropped.
//!
//! ## Configuration
//!
//! Besides the builder methods, a client can be configured from a [`ClientConfig`]. With the `serde` feature enabled,
//! the configuration can be deserialized.
//!
//! [tracing]: https://docs.rs/tracing

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, StatsdBuilder};

mod client;
pub use self::client::StatsdClient;

mod config;
pub use self::config::{ClientConfig, ConfigError, BACKEND_STATSD, TRANSPORT_TCP};

mod error;
pub use self::error::{Error, TransportError};

mod forwarder;

mod observer;
pub use self::observer::Observer;

pub mod pattern;

mod queue;

mod recorder;
pub use self::recorder::StatsdRecorder;

mod state;
pub use self::state::ConnectionStatus;

mod writer;
pub use self::writer::{MetricValue, StatKind};
