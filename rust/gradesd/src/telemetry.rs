//! Log setup. stdout carries the IPC protocol, so every log line goes to stderr.
//!
//! - `GRADESD_LOG` is an `EnvFilter` directive (default `gradesd=info`).
//! - `LOG_FORMAT=json` switches to structured JSON lines.

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("GRADESD_LOG").unwrap_or_else(|_| EnvFilter::new("gradesd=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.init(),
    }
}
