//! # Node Logging
//!
//! Every escrow transition the ledger performs (listing, deposits,
//! approvals, payout, refunds, reverted calls) is emitted as a `tracing`
//! event. This module installs the subscriber that renders them, either as
//! readable lines for a developer watching a devnet or as JSON lines for
//! shipping to a log store.
//!
//! Output goes to stderr. The `init` and `version` subcommands print their
//! results on stdout, which keeps them scriptable.

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Colored lines with source locations.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// `"json"` in any case selects [`LogFormat::Json`]; anything else falls
    /// back to [`LogFormat::Pretty`], so a typo in `KEYSTONE_LOG_FORMAT`
    /// never stops the node from starting.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_str_lossy(s))
    }
}

/// Filter used by `run` when `RUST_LOG` is unset: ledger and node events at
/// info, per-request HTTP spans at debug.
pub const DEFAULT_DIRECTIVES: &str = "keystone_node=info,keystone_contracts=info,tower_http=debug";

/// Installs the global subscriber. Must run once, before the ledger is
/// deployed, or the deployment events are lost.
///
/// `RUST_LOG` takes precedence over `directives`. Per-listing traces, for
/// example, need `RUST_LOG=keystone_contracts=debug`.
pub fn init_logging(directives: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    tracing::debug!(?format, "log subscriber installed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats_leniently() {
        assert_eq!(LogFormat::from_str_lossy("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_str_lossy("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str_lossy("xml"), LogFormat::Pretty);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn default_directives_parse() {
        assert!(DEFAULT_DIRECTIVES
            .split(',')
            .all(|d| d.parse::<tracing_subscriber::filter::Directive>().is_ok()));
    }
}
