//! Service configuration via `dxl.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strata_concurrency::AcquirePolicy;
use strata_core::error::{DxlError, Result};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "dxl.toml";

/// Default capacity of a scan message buffer (1 MiB)
pub const DEFAULT_SCAN_BUFFER_CAPACITY: usize = 1024 * 1024;

/// DXL service configuration loaded from `dxl.toml`.
///
/// # Example
///
/// ```toml
/// data_lock_enabled = false
/// lock_acquisition = "blocking"
/// admin_lock_timeout_ms = 5000
/// scan_buffer_capacity = 1048576
/// trace_timing = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxlConfig {
    /// Take the data lock around DML in addition to the schema lock
    #[serde(default)]
    pub data_lock_enabled: bool,
    /// `"blocking"` or `"interruptible"`
    #[serde(default = "default_lock_acquisition")]
    pub lock_acquisition: String,
    /// Timeout for administrative lock acquisition, in milliseconds
    #[serde(default = "default_admin_lock_timeout_ms")]
    pub admin_lock_timeout_ms: u64,
    /// Capacity of message buffers allocated for scans
    #[serde(default = "default_scan_buffer_capacity")]
    pub scan_buffer_capacity: usize,
    /// Log per-operation durations
    #[serde(default)]
    pub trace_timing: bool,
}

fn default_lock_acquisition() -> String {
    "blocking".to_string()
}

fn default_admin_lock_timeout_ms() -> u64 {
    5000
}

fn default_scan_buffer_capacity() -> usize {
    DEFAULT_SCAN_BUFFER_CAPACITY
}

impl Default for DxlConfig {
    fn default() -> Self {
        Self {
            data_lock_enabled: false,
            lock_acquisition: default_lock_acquisition(),
            admin_lock_timeout_ms: default_admin_lock_timeout_ms(),
            scan_buffer_capacity: default_scan_buffer_capacity(),
            trace_timing: false,
        }
    }
}

impl DxlConfig {
    /// Parse `lock_acquisition` into an [`AcquirePolicy`].
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not `"blocking"` or `"interruptible"`.
    pub fn acquire_policy(&self) -> Result<AcquirePolicy> {
        match self.lock_acquisition.as_str() {
            "blocking" => Ok(AcquirePolicy::Blocking),
            "interruptible" => Ok(AcquirePolicy::Interruptible),
            other => Err(DxlError::Config {
                message: format!(
                    "invalid lock_acquisition '{}', expected \"blocking\" or \"interruptible\"",
                    other
                ),
            }),
        }
    }

    /// Administrative lock timeout
    pub fn admin_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_lock_timeout_ms)
    }

    /// Check every field
    pub fn validate(&self) -> Result<()> {
        self.acquire_policy()?;
        if self.scan_buffer_capacity == 0 {
            return Err(DxlError::Config {
                message: "scan_buffer_capacity must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# DXL service configuration
#
# Take the data lock around DML as well as the schema lock (default: false)
data_lock_enabled = false

# Lock acquisition: "blocking" (default) or "interruptible"
#   "interruptible" lets a session's interrupt token abort a wait
lock_acquisition = "blocking"

# Timeout for administrative lock acquisition, in milliseconds
admin_lock_timeout_ms = 5000

# Capacity of scan message buffers, in bytes (default: 1 MiB)
scan_buffer_capacity = 1048576

# Log per-operation durations at debug level (default: false)
trace_timing = false
"#
    }

    /// Parse config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or a value is invalid.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DxlConfig = toml::from_str(content).map_err(|e| DxlError::Config {
            message: format!("failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DxlError::Config {
            message: format!("failed to read config file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&content).map_err(|e| DxlError::Config {
            message: format!("{} ({})", e, path.display()),
        })
    }

    /// Write the default config file if none exists.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to a file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| DxlError::Config {
            message: format!("failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_toml_parses_to_default() {
        let config = DxlConfig::from_toml_str(DxlConfig::default_toml()).unwrap();
        assert_eq!(config, DxlConfig::default());
    }

    #[test]
    fn test_empty_is_default() {
        let config = DxlConfig::from_toml_str("").unwrap();
        assert_eq!(config.scan_buffer_capacity, DEFAULT_SCAN_BUFFER_CAPACITY);
        assert_eq!(config.admin_lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.acquire_policy().unwrap(), AcquirePolicy::Blocking);
    }

    #[test]
    fn test_interruptible() {
        let config = DxlConfig::from_toml_str("lock_acquisition = \"interruptible\"").unwrap();
        assert_eq!(config.acquire_policy().unwrap(), AcquirePolicy::Interruptible);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            DxlConfig::from_toml_str("lock_acquisition = \"spin\""),
            Err(DxlError::Config { .. })
        ));
        assert!(DxlConfig::from_toml_str("scan_buffer_capacity = 0").is_err());
        assert!(DxlConfig::from_toml_str("data_lock_enabled = 3").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        DxlConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(DxlConfig::from_file(&path).unwrap(), DxlConfig::default());

        let config = DxlConfig {
            data_lock_enabled: true,
            trace_timing: true,
            ..DxlConfig::default()
        };
        config.write_to_file(&path).unwrap();
        assert_eq!(DxlConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DxlConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert_eq!(err.error_code(), "Config");
    }
}
