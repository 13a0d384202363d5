//! Leak Checker Configuration
//!
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `LEAKCHECK_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LEAKCHECK_USE_REGISTERS` | Scan captured register blocks ("true"/"false") | true |
//! | `LEAKCHECK_USE_STACKS` | Scan live thread stacks | true |
//! | `LEAKCHECK_USE_TLS` | Scan thread-local storage ranges | true |
//! | `LEAKCHECK_USE_ALLOCATOR_CACHE` | Scan per-thread allocator caches | true |
//! | `LEAKCHECK_USE_GLOBALS` | Scan writable data of loaded modules | true |
//! | `LEAKCHECK_USE_ROOT_REGIONS` | Scan registered root regions | true |
//! | `LEAKCHECK_FRONTIER_RESERVE` | Extra frontier capacity reserved per episode | 64 |
//! | `LEAKCHECK_SUSPEND_SIGNAL` | Signal used to park threads (Linux only) | SIGPWR (30) |
//! | `LEAKCHECK_SUSPEND_TIMEOUT_MS` | How long to wait for one thread to park before skipping it | 2000 |
//! | `LEAKCHECK_FATAL` | Fatal error policy (abort/panic) | abort |
//!
//! # Example
//!
//! ```rust,ignore
//! use leakcheck_runtime::config::LeakCheckConfig;
//!
//! // Load from environment with defaults
//! let config = LeakCheckConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = LeakCheckConfig::builder()
//!     .use_globals(false)
//!     .frontier_reserve(1024)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::fatal::FatalPolicy;

/// SIGPWR on Linux; the conventional stop signal for conservative collectors.
pub const DEFAULT_SUSPEND_SIGNAL: i32 = 30;

/// Default wait for a signalled thread to park.
pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Which classes of roots are fed into the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Scan each suspended thread's captured register block.
    pub use_registers: bool,
    /// Scan each suspended thread's stack from its stack pointer up.
    pub use_stacks: bool,
    /// Scan each thread's TLS range.
    pub use_tls: bool,
    /// Scan each thread's allocator cache range.
    pub use_allocator_cache: bool,
    /// Scan writable data sections of every loaded module.
    pub use_globals: bool,
    /// Scan explicitly registered root regions.
    pub use_root_regions: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            use_registers: true,
            use_stacks: true,
            use_tls: true,
            use_allocator_cache: true,
            use_globals: true,
            use_root_regions: true,
        }
    }
}

/// Platform layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Signal delivered to threads to park them. Ignored outside Linux.
    pub suspend_signal: i32,
    /// How long a signalled thread may take to park before it is left
    /// running and the episode is marked degraded. Ignored outside Linux.
    pub suspend_timeout: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            suspend_signal: DEFAULT_SUSPEND_SIGNAL,
            suspend_timeout: DEFAULT_SUSPEND_TIMEOUT,
        }
    }
}

/// Complete leak checker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakCheckConfig {
    /// Root classes.
    pub scan: ScanConfig,

    /// Platform layer settings.
    pub platform: PlatformConfig,

    /// Extra frontier slots reserved before the world is stopped, on top of
    /// one slot per tracked allocation.
    pub frontier_reserve: usize,

    /// How fatal conditions terminate.
    pub fatal: FatalPolicy,
}

impl Default for LeakCheckConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            platform: PlatformConfig::default(),
            frontier_reserve: 64,
            fatal: FatalPolicy::Abort,
        }
    }
}

impl LeakCheckConfig {
    /// Create a new builder for LeakCheckConfig.
    pub fn builder() -> LeakCheckConfigBuilder {
        LeakCheckConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or unparseable keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("LEAKCHECK_USE_REGISTERS") {
            config.scan.use_registers = val;
        }
        if let Some(val) = parse_env_bool("LEAKCHECK_USE_STACKS") {
            config.scan.use_stacks = val;
        }
        if let Some(val) = parse_env_bool("LEAKCHECK_USE_TLS") {
            config.scan.use_tls = val;
        }
        if let Some(val) = parse_env_bool("LEAKCHECK_USE_ALLOCATOR_CACHE") {
            config.scan.use_allocator_cache = val;
        }
        if let Some(val) = parse_env_bool("LEAKCHECK_USE_GLOBALS") {
            config.scan.use_globals = val;
        }
        if let Some(val) = parse_env_bool("LEAKCHECK_USE_ROOT_REGIONS") {
            config.scan.use_root_regions = val;
        }

        if let Some(val) = parse_env_usize("LEAKCHECK_FRONTIER_RESERVE") {
            config.frontier_reserve = val;
        }

        if let Some(val) = parse_env_i32("LEAKCHECK_SUSPEND_SIGNAL") {
            if is_valid_suspend_signal(val) {
                config.platform.suspend_signal = val;
            }
        }

        if let Some(val) = parse_env_u64("LEAKCHECK_SUSPEND_TIMEOUT_MS") {
            if val > 0 {
                config.platform.suspend_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(val) = env::var("LEAKCHECK_FATAL") {
            if let Some(policy) = FatalPolicy::from_str(&val) {
                config.fatal = policy;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_suspend_signal(self.platform.suspend_signal) {
            return Err(ConfigError::InvalidValue {
                field: "platform.suspend_signal".into(),
                message: format!(
                    "{} cannot be used (must be a standard signal 1..=31, not SIGKILL or SIGSTOP)",
                    self.platform.suspend_signal
                ),
            });
        }

        if self.platform.suspend_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "platform.suspend_timeout".into(),
                message: "must be greater than zero".into(),
            });
        }

        let scan = &self.scan;
        if !(scan.use_registers
            || scan.use_stacks
            || scan.use_tls
            || scan.use_allocator_cache
            || scan.use_globals
            || scan.use_root_regions)
        {
            return Err(ConfigError::InvalidValue {
                field: "scan".into(),
                message: "at least one root class must be enabled".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for LeakCheckConfig.
#[derive(Debug, Clone, Default)]
pub struct LeakCheckConfigBuilder {
    config: LeakCheckConfig,
}

impl LeakCheckConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable register scanning.
    pub fn use_registers(mut self, enabled: bool) -> Self {
        self.config.scan.use_registers = enabled;
        self
    }

    /// Enable or disable stack scanning.
    pub fn use_stacks(mut self, enabled: bool) -> Self {
        self.config.scan.use_stacks = enabled;
        self
    }

    /// Enable or disable TLS scanning.
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.config.scan.use_tls = enabled;
        self
    }

    /// Enable or disable allocator cache scanning.
    pub fn use_allocator_cache(mut self, enabled: bool) -> Self {
        self.config.scan.use_allocator_cache = enabled;
        self
    }

    /// Enable or disable global data scanning.
    pub fn use_globals(mut self, enabled: bool) -> Self {
        self.config.scan.use_globals = enabled;
        self
    }

    /// Enable or disable root region scanning.
    pub fn use_root_regions(mut self, enabled: bool) -> Self {
        self.config.scan.use_root_regions = enabled;
        self
    }

    /// Set the extra frontier capacity.
    pub fn frontier_reserve(mut self, slots: usize) -> Self {
        self.config.frontier_reserve = slots;
        self
    }

    /// Set the Linux suspend signal.
    pub fn suspend_signal(mut self, signal: i32) -> Self {
        self.config.platform.suspend_signal = signal;
        self
    }

    /// Set how long to wait for each thread to park.
    pub fn suspend_timeout(mut self, timeout: Duration) -> Self {
        self.config.platform.suspend_timeout = timeout;
        self
    }

    /// Set the fatal error policy.
    pub fn fatal(mut self, policy: FatalPolicy) -> Self {
        self.config.fatal = policy;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<LeakCheckConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> LeakCheckConfig {
        self.config
    }
}

/// SIGKILL (9) and SIGSTOP (19) cannot be handled. Realtime signals are
/// not accepted.
fn is_valid_suspend_signal(signal: i32) -> bool {
    (1..=31).contains(&signal) && signal != 9 && signal != 19
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as u64.
fn parse_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as i32.
fn parse_env_i32(name: &str) -> Option<i32> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LeakCheckConfig::default();
        assert!(config.scan.use_registers);
        assert!(config.scan.use_stacks);
        assert!(config.scan.use_tls);
        assert!(config.scan.use_allocator_cache);
        assert!(config.scan.use_globals);
        assert!(config.scan.use_root_regions);
        assert_eq!(config.frontier_reserve, 64);
        assert_eq!(config.platform.suspend_signal, DEFAULT_SUSPEND_SIGNAL);
        assert_eq!(config.platform.suspend_timeout, DEFAULT_SUSPEND_TIMEOUT);
        assert_eq!(config.fatal, FatalPolicy::Abort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LeakCheckConfig::builder()
            .use_globals(false)
            .use_tls(false)
            .frontier_reserve(1024)
            .fatal(FatalPolicy::Panic)
            .build()
            .unwrap();

        assert!(!config.scan.use_globals);
        assert!(!config.scan.use_tls);
        assert!(config.scan.use_stacks);
        assert_eq!(config.frontier_reserve, 1024);
        assert_eq!(config.fatal, FatalPolicy::Panic);
    }

    #[test]
    fn test_validation_uncatchable_signal() {
        assert!(LeakCheckConfig::builder().suspend_signal(9).build().is_err());
        assert!(LeakCheckConfig::builder().suspend_signal(19).build().is_err());
        assert!(LeakCheckConfig::builder().suspend_signal(0).build().is_err());
        assert!(LeakCheckConfig::builder().suspend_signal(34).build().is_err());
        assert!(LeakCheckConfig::builder().suspend_signal(10).build().is_ok());
    }

    #[test]
    fn test_validation_zero_suspend_timeout() {
        let err = LeakCheckConfig::builder()
            .suspend_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("platform.suspend_timeout"));

        let config = LeakCheckConfig::builder()
            .suspend_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        assert_eq!(config.platform.suspend_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_validation_all_roots_disabled() {
        let result = LeakCheckConfig::builder()
            .use_registers(false)
            .use_stacks(false)
            .use_tls(false)
            .use_allocator_cache(false)
            .use_globals(false)
            .use_root_regions(false)
            .build();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("scan"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "platform.suspend_signal".into(),
            message: "must be catchable".into(),
        };
        assert!(err.to_string().contains("platform.suspend_signal"));
        assert!(err.to_string().contains("must be catchable"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("LEAKCHECK_FRONTIER_RESERVE");
        env::remove_var("LEAKCHECK_FATAL");

        let config = LeakCheckConfig::from_env();
        assert_eq!(config.frontier_reserve, 64);
        assert_eq!(config.fatal, FatalPolicy::Abort);
    }
}
