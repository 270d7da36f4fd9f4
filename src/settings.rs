use arc_swap::ArcSwap;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::keys::DEFAULT_PREFIX;
use crate::record_store::Ttl;

/// Base name of the optional settings file (`SideEffect.toml`, `SideEffect.yaml`, ...).
pub const SETTINGS_FILE: &str = "SideEffect";

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "SIDE_EFFECT";

/// Standing configuration for side-effect guards.
///
/// Every field can be set in `SideEffect.toml` or through `SIDE_EFFECT_*`
/// environment variables, e.g. `SIDE_EFFECT_CLEAR_SIDE_EFFECTS=all`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SideEffectSettings {
    /// TTL applied when a guard does not set one. `0` persists until cleared.
    #[serde(default = "default_ttl_hours")]
    pub default_ttl_hours: Option<f64>,
    /// Clear directive consulted on every guarded call:
    /// `all`, `<name>`, `<name>:*` or `<prefix>*`.
    #[serde(default)]
    pub clear_side_effects: Option<String>,
    /// Namespace for marker and result keys.
    #[serde(default = "default_side_effect_prefix")]
    pub side_effect_prefix: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

fn default_ttl_hours() -> Option<f64> {
    Some(1.0)
}

fn default_side_effect_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Default for SideEffectSettings {
    fn default() -> Self {
        Self {
            default_ttl_hours: default_ttl_hours(),
            clear_side_effects: None,
            side_effect_prefix: default_side_effect_prefix(),
            redis_url: default_redis_url(),
        }
    }
}

impl SideEffectSettings {
    /// Loads `SideEffect.*` from the working directory (optional) and applies
    /// `SIDE_EFFECT_*` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::with_name(SETTINGS_FILE).required(false)))
    }

    /// Loads from an explicit file path, still applying environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from(path.as_ref())))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let s = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.side_effect_prefix.trim().is_empty() {
            return Err(ConfigError::Message(
                "side_effect_prefix must not be empty".to_string(),
            ));
        }
        if let Some(hours) = self.default_ttl_hours {
            if !hours.is_finite() || hours < 0.0 {
                return Err(ConfigError::Message(format!(
                    "default_ttl_hours must be a non-negative number, got {}",
                    hours
                )));
            }
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Ttl {
        Ttl::from_hours(self.default_ttl_hours)
    }

    /// The clear directive, ignoring blank values.
    pub fn clear_directive(&self) -> Option<&str> {
        self.clear_side_effects
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}

/// Shared, hot-swappable settings.
///
/// Guards read the current snapshot on every call, so a directive stored here
/// takes effect on the next invocation without rebuilding anything.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<SideEffectSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: SideEffectSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<SideEffectSettings> {
        self.inner.load_full()
    }

    pub fn replace(&self, settings: SideEffectSettings) {
        self.inner.store(Arc::new(settings));
    }

    /// Sets or clears the standing clear directive.
    pub fn set_clear_directive(&self, directive: Option<String>) {
        self.inner.rcu(|current| {
            let mut next = SideEffectSettings::clone(current);
            next.clear_side_effects = directive.clone();
            next
        });
    }

    /// Re-reads file and environment sources. On error the previous snapshot is kept.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let fresh = SideEffectSettings::new()?;
        self.replace(fresh);
        Ok(())
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(SideEffectSettings::default())
    }
}

impl From<SideEffectSettings> for SettingsHandle {
    fn from(settings: SideEffectSettings) -> Self {
        Self::new(settings)
    }
}
