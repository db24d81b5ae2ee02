//! Provide tracing, tailored to this daemon.
//!
//! At startup the binary calls [`init`] with the configured log level to
//! install a tracing subscriber. The rest of the program can include
//! `use crate::tracing::prelude::*` for convenient access to the `trace!()`,
//! `debug!()`, `info!()`, `warn!()`, and `error!()` macros.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Install the stdout subscriber.
///
/// The configured level (`debug|info|warn|error|crit`) sets the default
/// directive; `RUST_LOG` overrides it entirely. Unknown levels fall back to
/// `info` rather than failing the boot.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(log_level).into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn level_filter(name: &str) -> LevelFilter {
    match name.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        // "crit" is the historical name for the highest severity
        "error" | "crit" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        assert_eq!(level_filter("debug"), LevelFilter::DEBUG);
        assert_eq!(level_filter("INFO"), LevelFilter::INFO);
        assert_eq!(level_filter("crit"), LevelFilter::ERROR);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }
}
