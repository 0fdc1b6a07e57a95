use std::sync::OnceLock;

use crate::codec::{SurrogatePolicy, TextCodec, TextMode};

/// Environment variable naming the default text mode.
pub const ENV_STRING_CODING: &str = "SQLITE_BRIDGE_STRING_CODING";
/// Environment variable enabling the legacy truncating surrogate policy.
pub const ENV_LEGACY_SURROGATES: &str = "SQLITE_BRIDGE_LEGACY_SURROGATES";

/// Process-wide bridge settings, snapshotted by each connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Mode used by callers that do not pick one per call.
    pub default_mode: TextMode,
    pub surrogate_policy: SurrogatePolicy,
    /// Pages copied per backup/restore step.
    pub backup_step_pages: i32,
    /// Busy retries tolerated by restore before the status is surfaced.
    pub restore_busy_retries: u32,
    pub restore_retry_sleep_ms: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_mode: TextMode::StringCesu8,
            surrogate_policy: SurrogatePolicy::Strict,
            backup_step_pages: 100,
            restore_busy_retries: 3,
            restore_retry_sleep_ms: 100,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup(ENV_STRING_CODING) {
            match TextMode::from_name(&name) {
                Some(mode) => config.default_mode = mode,
                None => tracing::warn!(
                    value = %name,
                    "unknown {}, keeping {:?}",
                    ENV_STRING_CODING,
                    config.default_mode
                ),
            }
        }
        if let Some(flag) = lookup(ENV_LEGACY_SURROGATES) {
            if matches!(flag.trim(), "1" | "true" | "TRUE" | "yes") {
                config.surrogate_policy = SurrogatePolicy::Truncate;
            }
        }
        config
    }

    pub fn codec(&self) -> TextCodec {
        TextCodec::new(self.surrogate_policy)
    }
}

static GLOBAL: OnceLock<BridgeConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use.
pub fn global() -> &'static BridgeConfig {
    GLOBAL.get_or_init(BridgeConfig::from_env)
}

/// Install the process-wide configuration. Returns `false` when it was
/// already initialized.
pub fn install(config: BridgeConfig) -> bool {
    GLOBAL.set(config).is_ok()
}
