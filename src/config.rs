use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Top-level configuration for slicetrace.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Kernel trace session configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Slice reconstruction tuning.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Where emitted slices go.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Kernel trace session properties.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Name of the kernel logger session. Default: "NT Kernel Logger".
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Per-buffer size in KiB. Default: 256.
    #[serde(default = "default_buffer_kib")]
    pub buffer_kib: u32,

    /// Minimum number of session buffers. Default: 12.
    #[serde(default = "default_min_buffers")]
    pub min_buffers: u32,

    /// Maximum number of session buffers. Default: 48.
    #[serde(default = "default_max_buffers")]
    pub max_buffers: u32,

    /// How often buffers are flushed to the consumer. Default: 1s.
    #[serde(default = "default_flush_period", with = "humantime_serde")]
    pub flush_period: Duration,

    /// Subscribe to thread lifecycle events. Required for pid attribution.
    #[serde(default = "default_true")]
    pub enable_thread_provider: bool,

    /// Subscribe to context switch events. Required for any output.
    #[serde(default = "default_true")]
    pub enable_cswitch_provider: bool,
}

/// Slice reconstruction tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Reset the tid to pid table when it would grow past this many
    /// entries. Unset or 0 disables the cap.
    #[serde(default)]
    pub tid_table_soft_cap: Option<usize>,

    /// Number of per-core slots to pre-size. Default: detected parallelism.
    #[serde(default)]
    pub expected_cpus: Option<usize>,

    /// Initial capacity of the tid to pid table. Default: 4096.
    #[serde(default = "default_expected_threads")]
    pub expected_threads: usize,
}

/// Slice output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON object per slice on stdout.
    Jsonl,
    /// Per-process on-CPU totals printed at stop.
    #[default]
    Summary,
    /// Discard slices; only diagnostics are reported.
    None,
}

/// Output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Number of processes listed by the summary output. Default: 20.
    #[serde(default = "default_summary_top")]
    pub summary_top: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_name() -> String {
    "NT Kernel Logger".to_string()
}

fn default_buffer_kib() -> u32 {
    256
}

fn default_min_buffers() -> u32 {
    12
}

fn default_max_buffers() -> u32 {
    48
}

fn default_flush_period() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_expected_threads() -> usize {
    4096
}

fn default_summary_top() -> usize {
    20
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            trace: TraceConfig::default(),
            aggregator: AggregatorConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            buffer_kib: default_buffer_kib(),
            min_buffers: default_min_buffers(),
            max_buffers: default_max_buffers(),
            flush_period: default_flush_period(),
            enable_thread_provider: true,
            enable_cswitch_provider: true,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            tid_table_soft_cap: None,
            expected_cpus: None,
            expected_threads: default_expected_threads(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            summary_top: default_summary_top(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        self.trace.validate()
    }
}

impl TraceConfig {
    /// Validate session properties. A disabled thread provider is allowed
    /// but every slice will then carry the unknown pid.
    pub fn validate(&self) -> Result<()> {
        if self.session_name.is_empty() {
            bail!("trace.session_name is required");
        }

        if self.buffer_kib == 0 {
            bail!("trace.buffer_kib must be positive");
        }

        if self.min_buffers == 0 {
            bail!("trace.min_buffers must be positive");
        }

        if self.min_buffers > self.max_buffers {
            bail!(
                "trace.min_buffers ({}) must not exceed trace.max_buffers ({})",
                self.min_buffers,
                self.max_buffers
            );
        }

        if self.flush_period.is_zero() {
            bail!("trace.flush_period must be positive");
        }

        // The kernel session flush timer counts whole seconds.
        if self.flush_period.subsec_nanos() != 0 {
            bail!(
                "trace.flush_period must be a whole number of seconds, got {}",
                humantime_serde::re::humantime::format_duration(self.flush_period)
            );
        }

        if !self.enable_cswitch_provider {
            bail!("trace.enable_cswitch_provider must be true");
        }

        if !self.enable_thread_provider {
            warn!("thread provider disabled, all slices will carry the unknown pid");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.trace.session_name, "NT Kernel Logger");
        assert_eq!(cfg.trace.buffer_kib, 256);
        assert_eq!(cfg.trace.min_buffers, 12);
        assert_eq!(cfg.trace.max_buffers, 48);
        assert_eq!(cfg.trace.flush_period, Duration::from_secs(1));
        assert!(cfg.trace.enable_thread_provider);
        assert!(cfg.trace.enable_cswitch_provider);
        assert_eq!(cfg.aggregator.tid_table_soft_cap, None);
        assert_eq!(cfg.output.format, OutputFormat::Summary);
        assert_eq!(cfg.output.summary_top, 20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.trace.buffer_kib, 256);
        assert_eq!(cfg.aggregator.expected_threads, 4096);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
log_level: debug
trace:
  session_name: slicetrace-test
  buffer_kib: 64
  min_buffers: 4
  max_buffers: 8
  flush_period: 2s
  enable_thread_provider: false
aggregator:
  tid_table_soft_cap: 100000
  expected_cpus: 128
output:
  format: jsonl
  summary_top: 5
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.trace.session_name, "slicetrace-test");
        assert_eq!(cfg.trace.flush_period, Duration::from_secs(2));
        assert!(!cfg.trace.enable_thread_provider);
        assert!(cfg.trace.enable_cswitch_provider);
        assert_eq!(cfg.aggregator.tid_table_soft_cap, Some(100_000));
        assert_eq!(cfg.aggregator.expected_cpus, Some(128));
        assert_eq!(cfg.output.format, OutputFormat::Jsonl);
        assert_eq!(cfg.output.summary_top, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_output_format_rejected() {
        let res: std::result::Result<Config, _> = serde_yaml::from_str("output:\n  format: xml\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_zero_buffer_size_rejected() {
        let mut cfg = Config::default();
        cfg.trace.buffer_kib = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("buffer_kib"));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let mut cfg = Config::default();
        cfg.trace.min_buffers = 64;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_buffers"));
    }

    #[test]
    fn test_zero_flush_period_rejected() {
        let mut cfg = Config::default();
        cfg.trace.flush_period = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sub_second_flush_period_rejected() {
        let mut cfg = Config::default();
        cfg.trace.flush_period = Duration::from_millis(1_500);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"));
        assert!(err.to_string().contains("1s 500ms"));

        cfg.trace.flush_period = Duration::from_secs(3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_cswitch_provider_required() {
        let mut cfg = Config::default();
        cfg.trace.enable_cswitch_provider = false;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("enable_cswitch_provider"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/slicetrace.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
