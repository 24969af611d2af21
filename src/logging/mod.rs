//! Logging configuration via [`tracing`] crate.

use std::{collections::BTreeMap, fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{self, writer::BoxMakeWriter},
    layer::{Layer, Layered, SubscriberExt},
    registry::Registry,
    util::{SubscriberInitExt, TryInitError},
};

type LoggingRegistry = Layered<Vec<Box<dyn Layer<Registry> + Send + Sync>>, Registry>;

/// Error type used in logging configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggingError {
    /// Log destination I/O error.
    #[error("Log destination I/O error: {0}")]
    Io(#[from] io::Error),
    /// Global subscriber is already installed.
    #[error("Unable to install global log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Logging configuration.
///
/// With no subscribers configured, a single subscriber with default settings is used.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingConfig {
    /// List of subscribers defined in configuration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<LoggingSubscriberConfig>,
}

impl LoggingConfig {
    /// Create registry subscriber from configuration.
    ///
    /// Returned guards flush buffered log lines when dropped, and must be kept alive for as long
    /// as logging is needed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the subscribers cannot be initialized.
    pub fn make_registry(&self) -> Result<(LoggingRegistry, Vec<WorkerGuard>), LoggingError> {
        let fallback = [LoggingSubscriberConfig::default()];
        let subscribers = if self.subscribers.is_empty() {
            &fallback[..]
        } else {
            &self.subscribers[..]
        };
        let (layers, guards) = subscribers.iter().try_fold(
            (
                Vec::with_capacity(subscribers.len()),
                Vec::with_capacity(subscribers.len()),
            ),
            |(mut layers, mut guards), sub_cfg| {
                let (layer, guard) = sub_cfg.make_layer()?;
                layers.push(layer);
                guards.push(guard);
                Ok::<_, LoggingError>((layers, guards))
            },
        )?;
        Ok((Registry::default().with(layers), guards))
    }

    /// Install configured subscribers as the global default.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the subscribers cannot be initialized, or if a global subscriber
    /// has already been installed.
    pub fn init(&self) -> Result<Vec<WorkerGuard>, LoggingError> {
        let (registry, guards) = self.make_registry()?;
        registry.try_init()?;
        Ok(guards)
    }
}

/// Individual logging subscriber configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingSubscriberConfig {
    /// Overall format for logging output.
    #[serde(default, flatten)]
    pub format: LoggingFormat,
    /// Minimum severity level to include in output.
    #[serde(default)]
    pub level: LoggingLevel,
    /// Custom minimum severity levels for span targets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, LoggingLevel>,
    /// Use ANSI escape sequences for output colors and formatting.
    #[serde(default)]
    pub color: bool,
    /// Print event target.
    #[serde(default = "crate::util::default_true")]
    pub print_target: bool,
    /// Print thread name.
    #[serde(default)]
    pub print_thread: bool,
    /// Write buffer configuration for a non-blocking writer.
    #[serde(default)]
    pub buffer: LoggingBufferConfig,
    /// Log destination configuration.
    #[serde(default)]
    pub output: LoggingDestination,
}

impl Default for LoggingSubscriberConfig {
    fn default() -> Self {
        Self {
            format: LoggingFormat::default(),
            level: LoggingLevel::default(),
            targets: BTreeMap::new(),
            color: false,
            print_target: true,
            print_thread: false,
            buffer: LoggingBufferConfig::default(),
            output: LoggingDestination::default(),
        }
    }
}

impl LoggingSubscriberConfig {
    /// Make [`tracing_subscriber::Layer`] from subscriber configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if log destination cannot be opened.
    pub fn make_layer<T>(
        &self,
    ) -> Result<(Box<dyn Layer<T> + Send + Sync>, WorkerGuard), LoggingError>
    where
        T: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let (writer, guard) = self.output.make_writer(self.buffer.make_builder())?;
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.color)
            .with_target(self.print_target)
            .with_thread_names(self.print_thread);
        let layer = match self.format {
            LoggingFormat::Full => layer.boxed(),
            LoggingFormat::Compact => layer.compact().boxed(),
            LoggingFormat::Pretty => layer.pretty().boxed(),
            LoggingFormat::Json {
                flatten_metadata,
                current_span,
            } => layer
                .json()
                .flatten_event(flatten_metadata)
                .with_current_span(current_span)
                .boxed(),
        };
        let filter = Targets::new()
            .with_targets(self.targets.clone())
            .with_default(LevelFilter::from(self.level));
        Ok((layer.with_filter(filter).boxed(), guard))
    }
}

/// Format for logging output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase", tag = "format")]
pub enum LoggingFormat {
    /// Span context followed by log message.
    #[default]
    Full,
    /// Span names are hidden.
    Compact,
    /// Verbose multiline format, for development.
    Pretty,
    /// Newline-delimited JSON objects.
    Json {
        /// Flatten event metadata fields into object.
        #[serde(default)]
        flatten_metadata: bool,
        /// Add current span name to object.
        #[serde(default)]
        current_span: bool,
    },
}

/// Minumum event severity for log output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingLevel {
    /// Disables logging altogether.
    #[serde(alias = "off", alias = "disabled", alias = "DISABLED")]
    Off,
    /// Write "error" level only.
    #[serde(alias = "error", alias = "err", alias = "ERR")]
    Error,
    /// Write "warn" and more severe levels.
    #[serde(alias = "warn", alias = "warning", alias = "WARNING")]
    Warn,
    /// Write "info" and more severe levels.
    #[serde(alias = "info")]
    #[default]
    Info,
    /// Write "debug" and more severe levels.
    #[serde(alias = "debug")]
    Debug,
    /// Write everything.
    #[serde(alias = "trace")]
    Trace,
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::Off => LevelFilter::OFF,
            LoggingLevel::Error => LevelFilter::ERROR,
            LoggingLevel::Warn => LevelFilter::WARN,
            LoggingLevel::Info => LevelFilter::INFO,
            LoggingLevel::Debug => LevelFilter::DEBUG,
            LoggingLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Configuration for a non-blocking writer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingBufferConfig {
    /// Maximum buffered lines to store.
    ///
    /// See [`tracing_appender::non_blocking::NonBlockingBuilder::buffered_lines_limit`].
    #[serde(default = "LoggingBufferConfig::default_lines")]
    pub lines: usize,
    /// Drop lines that do not fit in the buffer instead of blocking.
    #[serde(default = "crate::util::default_true")]
    pub lossy: bool,
}

impl Default for LoggingBufferConfig {
    fn default() -> Self {
        Self {
            lines: Self::default_lines(),
            lossy: true,
        }
    }
}

impl LoggingBufferConfig {
    /// Default value for [`Self::lines`].
    #[must_use]
    #[inline]
    fn default_lines() -> usize {
        128_000
    }

    /// Construct a builder for non-blocking writer.
    #[must_use]
    pub fn make_builder(&self) -> NonBlockingBuilder {
        NonBlockingBuilder::default()
            .buffered_lines_limit(self.lines)
            .lossy(self.lossy)
            .thread_name("poolbroker-log")
    }
}

/// Logging output destination configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LoggingDestination {
    /// Output to standard output.
    #[default]
    #[serde(alias = "out")]
    StdOut,
    /// Output to standard error.
    #[serde(alias = "err")]
    StdErr,
    /// Append to file.
    File {
        /// Path to file.
        path: String,
    },
}

impl LoggingDestination {
    /// Make [`tracing_subscriber::fmt::writer::BoxMakeWriter`] from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if output file cannot be opened.
    pub fn make_writer(
        &self,
        buf_builder: NonBlockingBuilder,
    ) -> Result<(BoxMakeWriter, WorkerGuard), LoggingError> {
        let (writer, guard) = match self {
            Self::StdOut => buf_builder.finish(io::stdout()),
            Self::StdErr => buf_builder.finish(io::stderr()),
            Self::File { path } => {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)?;
                buf_builder.finish(file)
            }
        };
        Ok((BoxMakeWriter::new(writer), guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    #[test]
    fn subscribers_from_yaml() {
        let config = BrokerConfig::builder()
            .with_yaml_str(
                r#"
logging:
  subscribers:
    - format: json
      current_span: true
      level: debug
      targets:
        poolbroker_pools: trace
      output:
        type: stderr
    - format: compact
      level: WARNING
"#,
            )
            .build()
            .unwrap();
        let subs = &config.logging.subscribers;
        assert_eq!(subs.len(), 2);
        assert_eq!(
            subs[0].format,
            LoggingFormat::Json {
                flatten_metadata: false,
                current_span: true,
            }
        );
        assert_eq!(subs[0].level, LoggingLevel::Debug);
        assert_eq!(
            subs[0].targets.get("poolbroker_pools"),
            Some(&LoggingLevel::Trace)
        );
        assert_eq!(subs[0].output, LoggingDestination::StdErr);
        assert_eq!(subs[1].format, LoggingFormat::Compact);
        assert_eq!(subs[1].level, LoggingLevel::Warn);
        assert_eq!(subs[1].output, LoggingDestination::StdOut);
    }

    #[test]
    fn empty_config_builds_fallback_subscriber() {
        let (_registry, guards) = LoggingConfig::default().make_registry().unwrap();
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn missing_log_directory_is_reported() {
        let config = LoggingConfig {
            subscribers: vec![LoggingSubscriberConfig {
                output: LoggingDestination::File {
                    path: "/nonexistent/poolbroker/test.log".into(),
                },
                ..LoggingSubscriberConfig::default()
            }],
        };
        assert!(matches!(config.make_registry(), Err(LoggingError::Io(_))));
    }
}
