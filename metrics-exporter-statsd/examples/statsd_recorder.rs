use std::{thread, time::Duration};

use metrics::{counter, gauge};
use metrics_exporter_statsd::StatsdBuilder;

fn main() {
    tracing_subscriber::fmt::init();

    let host = std::env::var("STATSD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

    StatsdBuilder::default()
        .with_remote_address(host, 8125)
        .with_stat("tcp_server_loops", ["%_name", "%_name.bysystem.%system"])
        .with_stat("lucky_iterations", ["%_name"])
        .install()
        .expect("failed to install statsd recorder");

    let server_loops = counter!("tcp_server_loops", "system" => "foo");
    let lucky_iterations = gauge!("lucky_iterations");

    // Loop over and over, pretending to do some work.
    for iteration in 0u64.. {
        server_loops.increment(1);

        if iteration % 4 == 0 {
            lucky_iterations.decrement(1.0);
        } else {
            lucky_iterations.increment(1.0);
        }

        thread::sleep(Duration::from_secs(1));
    }
}
