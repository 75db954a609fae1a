//! Framework configuration types.

use offload_core::MAX_KEY_HEX_LEN;

/// Configuration for an acceleration framework instance.
///
/// Controls task pool sizing, submission validation, and how crypto keys are
/// resolved and dumped.
#[derive(Debug, Clone)]
pub struct AccelConfig {
    /// Number of task objects pre-allocated per worker channel.
    pub task_pool_capacity: usize,
    /// Required alignment, in bytes, of both dualcast destinations.
    pub dualcast_alignment: usize,
    /// Maximum accepted length of a hex-encoded key, in characters.
    pub max_key_hex_len: usize,
    /// Replace hex key material with a placeholder in configuration dumps.
    pub redact_key_material: bool,
    /// Reject default-module key creation when encrypt and decrypt are
    /// routed to different modules, instead of only warning.
    pub strict_crypto_routing: bool,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            task_pool_capacity: 2048,
            dualcast_alignment: 4096,
            max_key_hex_len: MAX_KEY_HEX_LEN,
            redact_key_material: false,
            strict_crypto_routing: false,
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_tracing`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accel_config_defaults() {
        let config = AccelConfig::default();
        assert_eq!(config.task_pool_capacity, 2048);
        assert_eq!(config.dualcast_alignment, 4096);
        assert_eq!(config.max_key_hex_len, 1024);
        assert!(!config.redact_key_material);
        assert!(!config.strict_crypto_routing);
    }

    #[test]
    fn log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.filter, "info");
        assert!(!config.json);
    }
}
