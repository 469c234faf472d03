//! Structured logging initialisation.
//!
//! Two output formats are supported:
//! - [`LogFormat::Human`]: readable lines for a terminal.
//! - [`LogFormat::Json`]: newline-delimited JSON for log aggregation.
//!
//! `RUST_LOG` overrides the configured level at start-up. The filter sits
//! behind a reload layer, so [`LogControl`] can switch logging on, off or
//! to new directives while the node runs.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::error::NodeError;

/// Selects the output format for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {:?} (expected human or json)", other)),
        }
    }
}

/// Runtime switch for the installed log filter.
#[derive(Clone, Debug)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    /// Replace the filter with `directives`, e.g. `"debug"` or
    /// `"info,waypoint_p2p=trace,libp2p_gossipsub=debug"`.
    pub fn enable(&self, directives: &str) -> Result<(), NodeError> {
        let filter = EnvFilter::try_new(directives).map_err(|e| NodeError::Logging {
            reason: format!("invalid filter {:?}: {}", directives, e),
        })?;
        self.reload(filter)
    }

    /// Silence all output.
    pub fn disable(&self) -> Result<(), NodeError> {
        self.reload(EnvFilter::new("off"))
    }

    /// The filter currently in effect.
    pub fn current(&self) -> Option<String> {
        self.handle.with_current(|f| f.to_string()).ok()
    }

    fn reload(&self, filter: EnvFilter) -> Result<(), NodeError> {
        self.handle.reload(filter).map_err(|e| NodeError::Logging {
            reason: e.to_string(),
        })
    }
}

/// Initialise the global tracing subscriber.
///
/// Fails if a global subscriber has already been set.
pub fn init_logging(format: LogFormat, level: &str) -> Result<LogControl, NodeError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);

    let installed = match format {
        LogFormat::Human => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };
    installed.map_err(|e| NodeError::Logging {
        reason: e.to_string(),
    })?;

    Ok(LogControl { handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Human".parse::<LogFormat>(), Ok(LogFormat::Human));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_control_reload() {
        let (layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        let control = LogControl { handle };

        control.enable("debug").unwrap();
        assert_eq!(control.current().as_deref(), Some("debug"));

        control.disable().unwrap();
        assert_eq!(control.current().as_deref(), Some("off"));

        assert!(matches!(
            control.enable("waypoint_p2p=loudest"),
            Err(NodeError::Logging { .. })
        ));
        drop(layer);
    }
}
