//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, one line per event.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Installs the global subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed, in which
/// case the existing one is kept.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_keeps_existing_subscriber() {
        // Other tests in the process may have installed one already.
        let _ = init_tracing(LogFormat::Json);
        assert!(!init_tracing(LogFormat::Text));
    }
}
