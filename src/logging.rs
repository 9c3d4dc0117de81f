//! Log output of the pipeline.
//!
//! Components log through the `tracing` macros with structured fields
//! (`machine_id`, `module_id`, `queue`, `unit`, `step`). Data inconsistencies that
//! point at a logic defect are logged at `error` level with `fatal = true`, so that
//! operators can alert on that single field.
//!
//! `RUST_LOG` takes precedence over `application.log_level`.
//!
//! ```no_run
//! use cnc_pipeline::{config::PipelineConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(machine_id = 7, "acquisition started");
//! # Ok(())
//! # }
//! ```

use crate::config::PipelineConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Layout of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured; for a developer watching one machine
    Pretty,
    /// One line per event; the service default
    Compact,
    /// One JSON object per event, for the log collector
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown log format '{other}' (pretty, compact or json)")),
        }
    }
}

/// What the subscriber writes besides the event itself.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Most verbose level written when `RUST_LOG` is unset
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// Log span closings with their busy time (analysis steps run in spans)
    pub span_timings: bool,
    /// Source file and line of the event
    pub source_location: bool,
    /// Thread id
    pub thread_ids: bool,
    /// Thread name; acquisition threads are named after their unit
    pub thread_names: bool,
    /// Colours, honoured by the pretty layout only
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            span_timings: false,
            source_location: false,
            thread_ids: false,
            thread_names: true,
            ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings from the `[application]` section.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Default settings at `level`.
    pub fn at_level(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Use `format`.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span closings.
    pub fn with_span_timings(mut self, enabled: bool) -> Self {
        self.span_timings = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }
}

/// Install the subscriber described by the `[application]` section.
pub fn init_from_config(config: &PipelineConfig) -> Result<(), String> {
    init(LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// When a subscriber is already installed (a second call, or a test harness)
/// the existing one is kept and `Ok(())` is returned.
pub fn init(settings: LogSettings) -> Result<(), String> {
    let spans = if settings.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_span_events(spans)
        .with_file(settings.source_location)
        .with_line_number(settings.source_location)
        .with_thread_ids(settings.thread_ids)
        .with_thread_names(settings.thread_names);

    let layer = match settings.format {
        OutputFormat::Pretty => base.pretty().with_ansi(settings.ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(layer.with_filter(settings.filter()))
        .try_init();
    match installed {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(format!("cannot install the log subscriber: {e}")),
    }
}

/// Level named in the configuration, case-insensitive.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level.trim())
        .map_err(|_| format!("unknown log level '{level}' (trace, debug, info, warn or error)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("INFO"), Ok(Level::INFO));
        assert_eq!(parse_log_level(" Debug "), Ok(Level::DEBUG));
        assert!(parse_log_level("fatal").is_err());
    }

    #[test]
    fn test_settings_from_application_section() {
        let mut config = PipelineConfig::default();
        config.application.log_level = "warn".to_string();
        config.application.log_format = "JSON".to_string();

        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::WARN);
        assert_eq!(settings.format, OutputFormat::Json);
        assert!(settings.thread_names);

        config.application.log_format = "xml".to_string();
        assert!(LogSettings::from_config(&config).is_err());
    }

    #[test]
    fn test_builder() {
        let settings = LogSettings::at_level(Level::DEBUG)
            .with_format(OutputFormat::Pretty)
            .with_span_timings(true);
        assert_eq!(settings.format, OutputFormat::Pretty);
        assert!(settings.span_timings);
        assert_eq!(settings.level, Level::DEBUG);
    }
}
