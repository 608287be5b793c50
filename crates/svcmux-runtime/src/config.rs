//! Dispatch configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use svcmux_runtime::config::{DispatchConfig, DispatchMode};
//!
//! // Use defaults with env overrides
//! let config = DispatchConfig::from_env();
//!
//! // Or customize programmatically
//! let config = DispatchConfig::from_env().mode(DispatchMode::SingleThreaded);
//! ```

use log::warn;
use svcmux_core::error::{DispatchError, Result};

use crate::env::{env_get, env_get_str};

/// Smallest worker stack we accept when one is configured explicitly.
const MIN_WORKER_STACK: usize = 16 * 1024;

/// How ready descriptors are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Dedicated worker per busy connection descriptor, created lazily.
    Auto,

    /// Everything is served inline on the dispatch thread; no workers are
    /// ever created. Baseline mode for debugging and constrained targets.
    SingleThreaded,
}

impl DispatchMode {
    /// Parse a mode name. Accepts `auto`/`mt` and `single`/`st`/`none`
    /// (case-insensitive).
    pub fn parse(name: &str) -> Option<DispatchMode> {
        match name.to_lowercase().as_str() {
            "auto" | "mt" => Some(DispatchMode::Auto),
            "single" | "st" | "none" => Some(DispatchMode::SingleThreaded),
            _ => None,
        }
    }
}

/// Dispatcher configuration with builder-style setters.
///
/// The mode is fixed once the loop starts; switch it only between runs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Service mode.
    pub mode: DispatchMode,
    /// Worker thread stack size in bytes; 0 means the OS default.
    pub worker_stack: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DispatchConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SVCMUX_MODE` - `auto` (default) or `single`
    /// - `SVCMUX_WORKER_STACK` - worker stack size in bytes (0 = OS default)
    pub fn from_env() -> Self {
        let raw_mode = env_get_str("SVCMUX_MODE", "auto");
        let mode = DispatchMode::parse(&raw_mode).unwrap_or_else(|| {
            warn!("SVCMUX_MODE={} not recognized, using auto", raw_mode);
            DispatchMode::Auto
        });
        Self {
            mode,
            worker_stack: env_get("SVCMUX_WORKER_STACK", 0),
        }
    }

    /// Set the service mode.
    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the worker stack size in bytes (0 = OS default).
    pub fn worker_stack(mut self, bytes: usize) -> Self {
        self.worker_stack = bytes;
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.worker_stack != 0 && self.worker_stack < MIN_WORKER_STACK {
            return Err(DispatchError::InvalidConfig(
                "worker stack below 16 KiB",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_variants() {
        assert_eq!(DispatchMode::parse("auto"), Some(DispatchMode::Auto));
        assert_eq!(DispatchMode::parse("MT"), Some(DispatchMode::Auto));
        assert_eq!(
            DispatchMode::parse("single"),
            Some(DispatchMode::SingleThreaded)
        );
        assert_eq!(
            DispatchMode::parse("none"),
            Some(DispatchMode::SingleThreaded)
        );
        assert_eq!(DispatchMode::parse("garbage"), None);
    }

    #[test]
    fn test_validate_rejects_tiny_stack() {
        let config = DispatchConfig::from_env().worker_stack(4096);
        assert!(config.validate().is_err());

        let config = DispatchConfig::from_env().worker_stack(0);
        assert!(config.validate().is_ok());

        let config = DispatchConfig::from_env().worker_stack(256 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("SVCMUX_MODE", "single");
        let config = DispatchConfig::from_env();
        assert_eq!(config.mode, DispatchMode::SingleThreaded);
        std::env::remove_var("SVCMUX_MODE");
    }
}
