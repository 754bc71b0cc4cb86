//! Tracing setup for worker processes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "HATCHWAY_LOG";

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `HATCHWAY_LOG` picks the level for
/// this crate (default `info`). `LOG_FORMAT=json` switches to JSON lines.
/// Calling twice is harmless; the second call is ignored.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var(LOG_ENV).ok().as_deref()))
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

fn default_filter(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    // Per-frame codec traces stay off unless asked for explicitly.
    if level == "trace" {
        format!("hatchway={level}")
    } else {
        format!("hatchway={level},hatchway::bridge::codec=off")
    }
}
