//! Pipeline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/cnc_pipeline.toml` by default)
//! 2. environment variables prefixed with `CNC_PIPELINE_`, nested keys separated by `__`
//!    (for example `CNC_PIPELINE_CACHE__MAX_GAP=90s`)
//!
//! Every key has a default, so an empty file yields a runnable (if unit-less)
//! configuration. Durations use the humantime notation (`"2m"`, `"30s"`, `"100ms"`).
//!
//! # Example
//! ```no_run
//! use cnc_pipeline::config::PipelineConfig;
//!
//! let config = PipelineConfig::load()?;
//! config.validate().map_err(cnc_pipeline::error::PipelineError::Configuration)?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), cnc_pipeline::error::PipelineError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppResult;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/cnc_pipeline.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CNC_PIPELINE_";

static QUEUE_NAME_PART: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z0-9_.]*$").unwrap()
});

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Queue bus settings
    #[serde(default)]
    pub queue: QueueSettings,
    /// Queue import loop settings
    #[serde(default)]
    pub import: ImportSettings,
    /// Consolidation cache settings
    #[serde(default)]
    pub cache: CacheSettings,
    /// Acquisition watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    /// Analysis scheduler settings
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Acquisition unit definitions
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Queue bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue name prefix
    #[serde(default = "default_queue_prefix")]
    pub prefix: String,
    /// Directory of the persistent queues
    #[serde(default = "default_queue_directory")]
    pub directory: PathBuf,
    /// Keep queue content across restarts
    #[serde(default)]
    pub persistent: bool,
    /// Open the consumer side of the queues receive-only
    #[serde(default)]
    pub receive_only: bool,
    /// Number of consumed records after which a persistent queue is compacted
    #[serde(default = "default_vacuum_threshold")]
    pub vacuum_threshold: usize,
    /// OS identity used for queue file access (current identity when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: default_queue_prefix(),
            directory: default_queue_directory(),
            persistent: false,
            receive_only: false,
            vacuum_threshold: default_vacuum_threshold(),
            run_as: None,
        }
    }
}

/// Queue import loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Maximum number of records peeked at once
    #[serde(default = "default_fetch_data_number")]
    pub fetch_data_number: usize,
    /// Minimum number of records before a young batch is processed
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
    /// Age after which a batch is processed whatever its size
    #[serde(default = "default_process_after", with = "humantime_serde")]
    pub process_after: Duration,
    /// Sleep once the queues are drained
    #[serde(default = "default_import_sleep", with = "humantime_serde")]
    pub sleep: Duration,
    /// Period between two short breaks
    #[serde(default = "default_break_frequency", with = "humantime_serde")]
    pub break_frequency: Duration,
    /// Length of a short break
    #[serde(default = "default_break_time", with = "humantime_serde")]
    pub break_time: Duration,
    /// Attempts for a batch failing with a transient error
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sleep between two attempts
    #[serde(default = "default_retry_sleep", with = "humantime_serde")]
    pub retry_sleep: Duration,
    /// Maximum period without visiting the machine-mode queue
    #[serde(default = "default_visit_machine_modes_every", with = "humantime_serde")]
    pub visit_machine_modes_every: Duration,
    /// Age after which secondary values are skipped (0 disables)
    #[serde(default = "default_skip_old_secondary_after", with = "humantime_serde")]
    pub skip_old_secondary_after: Duration,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            fetch_data_number: default_fetch_data_number(),
            min_batch: default_min_batch(),
            process_after: default_process_after(),
            sleep: default_import_sleep(),
            break_frequency: default_break_frequency(),
            break_time: default_break_time(),
            max_attempts: default_max_attempts(),
            retry_sleep: default_retry_sleep(),
            visit_machine_modes_every: default_visit_machine_modes_every(),
            skip_old_secondary_after: default_skip_old_secondary_after(),
        }
    }
}

/// Consolidation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum gap between two samples of an open segment
    #[serde(default = "default_max_gap", with = "humantime_serde")]
    pub max_gap: Duration,
    /// Maximum gap between two alarm scans
    #[serde(default = "default_max_gap", with = "humantime_serde")]
    pub max_alarm_gap: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_gap: default_max_gap(),
            max_alarm_gap: default_max_gap(),
        }
    }
}

/// Acquisition watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Watchdog tick period
    #[serde(default = "default_watchdog_frequency", with = "humantime_serde")]
    pub frequency: Duration,
    /// Silence after which a unit is considered not responding
    #[serde(default = "default_not_responding_timeout", with = "humantime_serde")]
    pub not_responding_timeout: Duration,
    /// Restart faulted units
    #[serde(default = "default_true")]
    pub restart: bool,
    /// Maximum wait for a faulted unit to stop before its restart
    #[serde(default = "default_restart_timeout", with = "humantime_serde")]
    pub restart_timeout: Duration,
    /// Sleep between stopping and restarting a unit
    #[serde(default = "default_sleep_before_restart", with = "humantime_serde")]
    pub sleep_before_restart: Duration,
    /// Sleep before the process-wide exit when a restart is impossible
    #[serde(default = "default_sleep_before_force_exit", with = "humantime_serde")]
    pub sleep_before_force_exit: Duration,
    /// Request the process-wide exit when a unit cannot be restarted
    #[serde(default)]
    pub force_exit_on_failed_restart: bool,
    /// Graceful close timeout during shutdown, before kill or detach
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            frequency: default_watchdog_frequency(),
            not_responding_timeout: default_not_responding_timeout(),
            restart: true,
            restart_timeout: default_restart_timeout(),
            sleep_before_restart: default_sleep_before_restart(),
            sleep_before_force_exit: default_sleep_before_force_exit(),
            force_exit_on_failed_restart: false,
            stop_timeout: default_stop_timeout(),
        }
    }
}

/// Time budget of one analysis step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Time after which the step is interrupted
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,
    /// Time the step is guaranteed before it may be asked to yield
    #[serde(with = "humantime_serde")]
    pub min_time: Duration,
}

impl BudgetConfig {
    /// Budget from seconds.
    pub const fn from_secs(max: u64, min: u64) -> Self {
        Self {
            max_time: Duration::from_secs(max),
            min_time: Duration::from_secs(min),
        }
    }
}

/// Per-step time budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBudgets {
    /// Processing-reason-slots budget
    #[serde(default = "default_reason_slots_budget")]
    pub processing_reason_slots: BudgetConfig,
    /// Detection budget
    #[serde(default = "default_detection_budget")]
    pub detection: BudgetConfig,
    /// Auto-sequence budget
    #[serde(default = "default_auto_sequence_budget")]
    pub auto_sequence: BudgetConfig,
    /// Machine-state-template budget
    #[serde(default = "default_machine_state_template_budget")]
    pub machine_state_template: BudgetConfig,
    /// Budget of every other step
    #[serde(default = "default_step_budget")]
    pub default: BudgetConfig,
}

impl Default for StepBudgets {
    fn default() -> Self {
        Self {
            processing_reason_slots: default_reason_slots_budget(),
            detection: default_detection_budget(),
            auto_sequence: default_auto_sequence_budget(),
            machine_state_template: default_machine_state_template_budget(),
            default: default_step_budget(),
        }
    }
}

/// Analysis scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Back-off when an iteration found no backlog
    #[serde(default = "default_idle_sleep", with = "humantime_serde")]
    pub idle_sleep: Duration,
    /// Budget of each catch-up step
    #[serde(default = "default_catch_up_max_time", with = "humantime_serde")]
    pub catch_up_max_time: Duration,
    /// Period of the normal+low pending-modification pass
    #[serde(default = "default_low_frequency", with = "humantime_serde")]
    pub low_frequency: Duration,
    /// Period of the all-priorities pending-modification pass
    #[serde(default = "default_very_low_frequency", with = "humantime_serde")]
    pub very_low_frequency: Duration,
    /// Window of the first reason-slot pass in producing mode
    #[serde(default = "default_recent_window", with = "humantime_serde")]
    pub reason_slots_recent_window: Duration,
    /// Per-step budgets
    #[serde(default)]
    pub budgets: StepBudgets,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            idle_sleep: default_idle_sleep(),
            catch_up_max_time: default_catch_up_max_time(),
            low_frequency: default_low_frequency(),
            very_low_frequency: default_very_low_frequency(),
            reason_slots_recent_window: default_recent_window(),
            budgets: StepBudgets::default(),
        }
    }
}

/// How an acquisition unit is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Dedicated OS thread in this process
    Thread,
    /// Child OS process
    Process,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Thread => write!(f, "thread"),
            ExecutionMode::Process => write!(f, "process"),
        }
    }
}

/// Acquisition unit definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Machine identifier
    pub machine_id: u32,
    /// Module identifier (0 for the main module)
    #[serde(default)]
    pub module_id: u32,
    /// Execution mode
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    /// In-process driver name (thread mode)
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Program to launch (process mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Program arguments (process mode)
    #[serde(default)]
    pub args: Vec<String>,
    /// Acquisition period of the in-process driver
    #[serde(default = "default_acquisition_period", with = "humantime_serde")]
    pub period: Duration,
    /// Override of the watchdog not-responding timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub not_responding_timeout: Option<Duration>,
    /// Whether this unit is started
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl UnitConfig {
    /// In-process mock unit, mostly for tests and demos.
    pub fn mock(machine_id: u32, module_id: u32) -> Self {
        Self {
            machine_id,
            module_id,
            mode: ExecutionMode::Thread,
            driver: default_driver(),
            command: None,
            args: Vec::new(),
            period: default_acquisition_period(),
            not_responding_timeout: None,
            enabled: true,
        }
    }

    /// Child-process unit.
    pub fn process(machine_id: u32, module_id: u32, command: &str, args: &[&str]) -> Self {
        Self {
            mode: ExecutionMode::Process,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::mock(machine_id, module_id)
        }
    }
}

// Default value functions
fn default_name() -> String {
    "CNC Pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_queue_prefix() -> String {
    "Single".to_string()
}

fn default_queue_directory() -> PathBuf {
    PathBuf::from("data/queues")
}

fn default_vacuum_threshold() -> usize {
    1000
}

fn default_fetch_data_number() -> usize {
    60
}

fn default_min_batch() -> usize {
    1
}

fn default_process_after() -> Duration {
    Duration::from_secs(60)
}

fn default_import_sleep() -> Duration {
    Duration::from_secs(2)
}

fn default_break_frequency() -> Duration {
    Duration::from_secs(2)
}

fn default_break_time() -> Duration {
    Duration::from_millis(100)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_sleep() -> Duration {
    Duration::from_secs(5)
}

fn default_visit_machine_modes_every() -> Duration {
    Duration::from_secs(8)
}

fn default_skip_old_secondary_after() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_max_gap() -> Duration {
    Duration::from_secs(60)
}

fn default_watchdog_frequency() -> Duration {
    Duration::from_secs(120)
}

fn default_not_responding_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_restart_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sleep_before_restart() -> Duration {
    Duration::from_secs(30)
}

fn default_sleep_before_force_exit() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_sleep() -> Duration {
    Duration::from_secs(2)
}

fn default_catch_up_max_time() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_low_frequency() -> Duration {
    Duration::from_secs(60)
}

fn default_very_low_frequency() -> Duration {
    Duration::from_secs(600)
}

fn default_recent_window() -> Duration {
    Duration::from_secs(8 * 3600)
}

fn default_reason_slots_budget() -> BudgetConfig {
    BudgetConfig::from_secs(30, 30)
}

fn default_detection_budget() -> BudgetConfig {
    BudgetConfig::from_secs(40, 20)
}

fn default_auto_sequence_budget() -> BudgetConfig {
    BudgetConfig::from_secs(20, 10)
}

fn default_machine_state_template_budget() -> BudgetConfig {
    BudgetConfig::from_secs(180, 60)
}

fn default_step_budget() -> BudgetConfig {
    BudgetConfig::from_secs(30, 10)
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Thread
}

fn default_driver() -> String {
    "mock".to_string()
}

fn default_acquisition_period() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment variables apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Layered providers used by [`PipelineConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.queue.prefix.is_empty() || !QUEUE_NAME_PART.is_match(&self.queue.prefix) {
            return Err(format!(
                "Invalid queue prefix '{}'. Use letters, digits, '_' or '.'",
                self.queue.prefix
            ));
        }

        if self.import.fetch_data_number == 0 {
            return Err("import.fetch_data_number must be at least 1".to_string());
        }
        if self.import.max_attempts == 0 {
            return Err("import.max_attempts must be at least 1".to_string());
        }
        if self.watchdog.frequency.is_zero() {
            return Err("watchdog.frequency must not be zero".to_string());
        }

        // Units must be unique per (machine, module)
        let mut keys = HashSet::new();
        for unit in &self.units {
            if !keys.insert((unit.machine_id, unit.module_id)) {
                return Err(format!(
                    "Duplicate acquisition unit: machine {} module {}",
                    unit.machine_id, unit.module_id
                ));
            }
            if unit.mode == ExecutionMode::Process
                && unit.command.as_deref().map_or(true, str::is_empty)
            {
                return Err(format!(
                    "Process unit machine {} module {} has no command",
                    unit.machine_id, unit.module_id
                ));
            }
        }

        Ok(())
    }

    /// Units to start
    pub fn enabled_units(&self) -> Vec<&UnitConfig> {
        self.units.iter().filter(|unit| unit.enabled).collect()
    }

    /// Distinct machines among the enabled units, in ascending order
    pub fn machine_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.enabled_units().iter().map(|u| u.machine_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Whether a queue suffix only uses characters allowed in queue names.
pub fn is_valid_queue_suffix(suffix: &str) -> bool {
    QUEUE_NAME_PART.is_match(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue.prefix, "Single");
        assert!(!config.queue.persistent);
        assert!(!config.queue.receive_only);
        assert_eq!(config.cache.max_gap, Duration::from_secs(60));
        assert_eq!(config.watchdog.frequency, Duration::from_secs(120));
        assert_eq!(config.watchdog.sleep_before_restart, Duration::from_secs(30));
        assert_eq!(config.import.fetch_data_number, 60);
        assert_eq!(
            config.analysis.budgets.detection,
            BudgetConfig::from_secs(40, 20)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "pipeline.toml",
                r#"
                [application]
                name = "Shop floor"
                log_level = "debug"

                [cache]
                max_gap = "90s"

                [[units]]
                machine_id = 7

                [[units]]
                machine_id = 8
                module_id = 2
                mode = "process"
                command = "acquire"
                args = ["--machine", "8"]
                not_responding_timeout = "5m"
                "#,
            )?;
            jail.set_env("CNC_PIPELINE_WATCHDOG__RESTART", "false");

            let config = PipelineConfig::load_from("pipeline.toml")
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.application.name, "Shop floor");
            assert_eq!(config.cache.max_gap, Duration::from_secs(90));
            assert_eq!(config.cache.max_alarm_gap, Duration::from_secs(60));
            assert!(!config.watchdog.restart);
            assert_eq!(config.units.len(), 2);
            assert_eq!(config.units[0].mode, ExecutionMode::Thread);
            assert_eq!(config.units[1].mode, ExecutionMode::Process);
            assert_eq!(
                config.units[1].not_responding_timeout,
                Some(Duration::from_secs(300))
            );
            assert_eq!(config.machine_ids(), vec![7, 8]);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_shipped_configuration_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = PipelineConfig::load_from(path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.units.len(), 3);
        assert_eq!(config.machine_ids(), vec![1, 2]);
        assert_eq!(config.analysis.catch_up_max_time, Duration::from_secs(24 * 3600));

        let dumped = toml::to_string_pretty(&config).unwrap();
        assert!(dumped.contains("[[units]]"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = PipelineConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_units() {
        let config = PipelineConfig {
            units: vec![UnitConfig::mock(1, 0), UnitConfig::mock(1, 0)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_process_unit_requires_command() {
        let mut unit = UnitConfig::mock(3, 0);
        unit.mode = ExecutionMode::Process;
        let config = PipelineConfig {
            units: vec![unit],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("no command"));
    }

    #[test]
    fn test_queue_prefix_validation() {
        let mut config = PipelineConfig::default();
        config.queue.prefix = "bad/prefix".to_string();
        assert!(config.validate().is_err());
        assert!(is_valid_queue_suffix("Value2"));
        assert!(!is_valid_queue_suffix("a-b"));
    }
}
