#![cfg_attr(test, allow(clippy::unwrap_used))]

mod capturing_writer;
mod err_with_sources;

use anyhow::{Context, Result};
use tracing::{Subscriber, subscriber::DefaultGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::ParseError, fmt, layer::SubscriberExt as _,
    util::SubscriberInitExt,
};

pub use capturing_writer::CapturingWriter;
pub use err_with_sources::{ErrorWithSources, err_with_src};

/// Registers a global subscriber that logs to stdout.
///
/// `directives` follow the [`EnvFilter`] syntax, e.g. `info,tuntap=debug`.
pub fn setup_global_subscriber(directives: &str, stdout_json: bool) -> Result<()> {
    let filter = try_filter(directives).context("Failed to parse directives")?;

    let subscriber = Registry::default().with(match stdout_json {
        true => fmt::layer()
            .json()
            .flatten_event(true)
            .with_thread_names(true)
            .with_filter(filter)
            .boxed(),
        false => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_filter(filter)
            .boxed(),
    });
    init(subscriber)?;

    Ok(())
}

pub fn init(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy crates.
    ///
    /// For debugging, it is useful to set a catch-all log like `debug`.
    /// The netlink crates log every message they exchange with the kernel which is very likely not what you want to see.
    ///
    /// By prepending this directive to the active log filter, a simple directive like `debug` actually produces useful logs.
    /// If necessary, you can still activate logs from these crates by restating them in your directive with a lower filter, i.e. `netlink_proto=debug`.
    const IRRELEVANT_CRATES: &str = "netlink_proto=warn,netlink_sys=warn,rtnetlink=info";

    let env_filter = if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)?
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))?
    };

    Ok(env_filter)
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

/// Initialises a logger for the current thread that keeps everything it logs in memory.
pub fn capture(directives: &str) -> (CapturingWriter, DefaultGuard) {
    let writer = CapturingWriter::default();

    let guard = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_ansi(false)
        .with_env_filter(directives)
        .set_default();

    (writer, guard)
}

pub fn test_global(directives: &str) {
    init(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(directives)
            .finish(),
    )
    .ok();
}
