//! Process-wide `tracing` initialization, shared by every binary in the
//! workspace. Mirrors the teacher's `at_telemetry::logging::init_logging`
//! entry point, minus the Datadog/OpenTelemetry exporter — see
//! `DESIGN.md` for why the ambient logging stack stops at `tracing` here.

/// Installs a `tracing-subscriber` fmt layer. `default_level` is used when
/// `RUST_LOG` is unset.
pub fn init(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
