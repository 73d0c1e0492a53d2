//! Tracing subscriber setup for hosts embedding the bridge.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directive for a `WFBRIDGE_LOG` level name.
fn directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("wfbridge={level}")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `WFBRIDGE_LOG` picks the crate level.
/// `LOG_FORMAT=json` switches to JSON lines. A subscriber that is already
/// installed is left alone.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directive(std::env::var("WFBRIDGE_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
