//! Runtime configuration
//!
//! Compile-time defaults with environment overrides and a builder for
//! programmatic setup.
//!
//! # Example
//!
//! ```ignore
//! use squall_runtime::RuntimeConfig;
//!
//! // Defaults + SQUALL_* env overrides
//! let config = RuntimeConfig::from_env();
//!
//! // Or explicit
//! let config = RuntimeConfig::new()
//!     .threads(4)
//!     .use_caller(false)
//!     .name("kv-io");
//! ```

use squall_core::env::{env_get, env_get_bool, env_get_str};
use squall_core::error::RuntimeError;

/// Default fiber stack size: 128 KiB of virtual space, lazily backed
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default connect timeout when no per-fd timeout is set
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Upper bound on events drained per idle wake
pub const MAX_EVENT_BATCH: usize = 256;

/// Maximum readiness-wait block; bounds how stale a new front timer or
/// shutdown flag can get even if a tickle is lost
pub const MAX_IDLE_TIMEOUT_MS: u64 = 5000;

/// Runtime configuration with builder pattern
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of participating threads (including the caller if
    /// `use_caller` is set)
    pub threads: usize,
    /// Run the scheduler loop on the thread that calls `start()` too
    pub use_caller: bool,
    /// Name prefix for worker threads and log lines
    pub name: String,
    /// Pin workers to CPUs
    pub pin_cores: bool,
    /// Base logical core for affinity: worker i pins to
    /// `(core_offset + i * core_stride) % num_cores`
    pub core_offset: usize,
    /// 1 = dense, 2 = skip hyperthread siblings
    pub core_stride: usize,
    /// Virtual stack size per fiber
    pub stack_size: usize,
    /// Default `connect` timeout when the fd has none set
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with `SQUALL_*` environment overrides
    ///
    /// - `SQUALL_THREADS` - participating thread count
    /// - `SQUALL_USE_CALLER` - caller thread joins the scheduler (0/1)
    /// - `SQUALL_NAME` - thread/log name prefix
    /// - `SQUALL_PIN_CORES` - enable CPU affinity (0/1)
    /// - `SQUALL_CORE_OFFSET` - base logical core
    /// - `SQUALL_CORE_STRIDE` - 1 or 2
    /// - `SQUALL_STACK_SIZE` - fiber stack bytes
    /// - `SQUALL_CONNECT_TIMEOUT_MS` - default connect timeout
    pub fn from_env() -> Self {
        Self {
            threads: env_get("SQUALL_THREADS", 1),
            use_caller: env_get_bool("SQUALL_USE_CALLER", true),
            name: env_get_str("SQUALL_NAME", "squall"),
            pin_cores: env_get_bool("SQUALL_PIN_CORES", true),
            core_offset: env_get("SQUALL_CORE_OFFSET", 0),
            core_stride: env_get("SQUALL_CORE_STRIDE", 1),
            stack_size: env_get("SQUALL_STACK_SIZE", DEFAULT_STACK_SIZE),
            connect_timeout_ms: env_get("SQUALL_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    /// Explicit defaults, no environment involved
    pub fn new() -> Self {
        Self {
            threads: 1,
            use_caller: true,
            name: "squall".to_string(),
            pin_cores: true,
            core_offset: 0,
            core_stride: 1,
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    // Builder methods

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.use_caller = yes;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn pin_cores(mut self, yes: bool) -> Self {
        self.pin_cores = yes;
        self
    }

    pub fn core_offset(mut self, offset: usize) -> Self {
        self.core_offset = offset;
        self
    }

    pub fn core_stride(mut self, stride: usize) -> Self {
        self.core_stride = stride;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Validate ranges
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.threads == 0 {
            return Err(RuntimeError::InvalidConfig("threads must be >= 1"));
        }
        if self.threads > 256 {
            return Err(RuntimeError::InvalidConfig("threads must be <= 256"));
        }
        if self.core_stride != 1 && self.core_stride != 2 {
            return Err(RuntimeError::InvalidConfig("core_stride must be 1 or 2"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("stack_size must be >= 16KB"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::new().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .threads(4)
            .use_caller(false)
            .name("kv-io")
            .core_offset(2)
            .core_stride(2);

        assert_eq!(config.threads, 4);
        assert!(!config.use_caller);
        assert_eq!(config.name, "kv-io");
        assert_eq!(config.core_offset, 2);
        assert_eq!(config.core_stride, 2);
    }

    #[test]
    fn test_validation_rejects() {
        assert!(RuntimeConfig::new().threads(0).validate().is_err());
        assert!(RuntimeConfig::new().threads(1000).validate().is_err());
        assert!(RuntimeConfig::new().core_stride(3).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
    }
}
