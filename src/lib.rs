pub mod config;
pub mod pipeline;
pub mod session;

#[cfg(test)]
mod phi_audit;

pub use config::PipelineConfig;
pub use session::{IngestSummary, RawDocument, ReportSession, SessionError};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over `filter`;
/// `None` falls back to the crate default. A second call is a no-op.
pub fn init_tracing(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(config::default_log_filter())));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
