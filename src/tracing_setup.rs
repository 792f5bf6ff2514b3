// file: src/tracing_setup.rs
// description: structured logging configuration and tracing initialization
// reference: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Transport crates log every frame at debug; keep them at warn unless
/// `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "reqwest", "hyper_util", "rustls"];

fn default_directives(log_level: &str) -> String {
    let mut directives = vec![format!("auction_live={log_level}")];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.push("warn".to_string());
    directives.join(",")
}

/// Installs the global subscriber. Output goes to stderr since the console
/// presenter owns stdout.
pub fn setup_tracing(log_level: &str, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(log_level)))
        .unwrap_or_else(|_| EnvFilter::new("auction_live=info,warn"));

    let fmt_layer = if json_logs {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NONE)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
