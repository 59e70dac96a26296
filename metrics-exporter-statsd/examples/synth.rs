use std::{thread, time::Duration};

use metrics_exporter_statsd::{Error, Observer, StatsdBuilder};
use tracing::{info, warn};

struct LoggingObserver;

impl Observer for LoggingObserver {
    fn warn(&self, error: &Error) {
        warn!(%error, "Client reported a problem.");
    }

    fn nominal(&self) {
        info!("Client connected.");
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let host = std::env::var("STATSD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

    let client = StatsdBuilder::default()
        .with_remote_address(host, 8125)
        .with_stat("synth.requests", ["%_name", "%_name.byhost.%host", "%_name.bymethod.%method"])
        .with_stat("synth.inflight", ["%_name.byhost.%host"])
        .with_observer(LoggingObserver)
        .build()
        .expect("failed to build statsd client");

    let methods = ["GET", "PUT", "DELETE"];

    // Emit a few stats every second, forever.
    for tick in 0usize.. {
        let method = methods[tick % methods.len()];
        client.counter("synth.requests", &[("host", "host001"), ("method", method)], 1);
        client.gauge("synth.inflight", &[("host", "host001")], tick % 10);

        if tick % 10 == 0 {
            info!(
                attempts = client.attempts(),
                connects = client.connects(),
                dropped = client.dropped_points(),
                status = ?client.status(),
                "Client status."
            );
        }

        thread::sleep(Duration::from_secs(1));
    }
}
