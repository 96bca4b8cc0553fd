//! Logging setup shared by the server and client binaries.

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `level` seeds the default filter (overridable via `RUST_LOG`); `json`
/// switches to newline-delimited JSON output for log shippers.
pub fn init(level: &str, json: bool) -> Result<()> {
    let level = match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" | "" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        other => bail!("unknown log level: {other}"),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_rejected() {
        assert!(init("loud", false).is_err());
    }
}
