use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerPreference {
    Low,
    #[default]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryProfile {
    Performance,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub animation: AnimationSection,
    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceSection {
    #[serde(default)]
    pub power: PowerPreference,
    #[serde(default)]
    pub fallback_adapter: bool,
    #[serde(default)]
    pub memory: MemoryProfile,
    /// Ask for a wide-gamut surface format when a surface is attached.
    #[serde(default)]
    pub hdr_display: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSection {
    #[serde(default = "default_max_per_key")]
    pub max_per_key: usize,
    #[serde(
        default = "default_max_age",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_age: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogSection {
    #[serde(
        default = "default_watchdog_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnimationSection {
    #[serde(default = "default_one")]
    pub supersample: f32,
    #[serde(default = "default_one")]
    pub gamma: f32,
    #[serde(default = "default_one")]
    pub contrast: f32,
    #[serde(
        default = "default_slow_frame_threshold",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub slow_frame_threshold: Duration,
    #[serde(default = "default_slow_frame_limit")]
    pub slow_frame_limit: u32,
    #[serde(default = "default_check_window")]
    pub check_window: u32,
    #[serde(default)]
    pub profile: bool,
    /// Optional per-animation frame cap; absent or zero means uncapped.
    #[serde(default)]
    pub fps: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportSection {
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

fn default_version() -> u32 {
    1
}

fn default_max_per_key() -> usize {
    4
}

fn default_max_age() -> Duration {
    Duration::from_secs(60)
}

fn default_watchdog_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_one() -> f32 {
    1.0
}

fn default_slow_frame_threshold() -> Duration {
    Duration::from_millis(100)
}

fn default_slow_frame_limit() -> u32 {
    3
}

fn default_check_window() -> u32 {
    30
}

fn default_thumbnail_size() -> u32 {
    256
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_per_key: default_max_per_key(),
            max_age: default_max_age(),
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            timeout: default_watchdog_timeout(),
        }
    }
}

impl Default for AnimationSection {
    fn default() -> Self {
        Self {
            supersample: default_one(),
            gamma: default_one(),
            contrast: default_one(),
            slow_frame_threshold: default_slow_frame_threshold(),
            slow_frame_limit: default_slow_frame_limit(),
            check_window: default_check_window(),
            profile: false,
            fps: None,
        }
    }
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            device: DeviceSection::default(),
            pool: PoolSection::default(),
            watchdog: WatchdogSection::default(),
            animation: AnimationSection::default(),
            export: ExportSection::default(),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() || v.is_infinite() {
                return Err(E::custom("duration must be a finite non-negative number"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: EngineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads and validates `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|err| ConfigError::Invalid(format!("failed to serialize configuration: {err}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.pool.max_per_key == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_per_key must be greater than zero".into(),
            ));
        }

        if self.watchdog.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "watchdog.timeout must be greater than zero".into(),
            ));
        }

        let animation = &self.animation;
        if !(animation.supersample > 0.0 && animation.supersample <= 4.0) {
            return Err(ConfigError::Invalid(format!(
                "animation.supersample must be in (0, 4], got {}",
                animation.supersample
            )));
        }
        if !(animation.gamma > 0.0 && animation.gamma.is_finite()) {
            return Err(ConfigError::Invalid("animation.gamma must be > 0".into()));
        }
        if !(animation.contrast > 0.0 && animation.contrast.is_finite()) {
            return Err(ConfigError::Invalid(
                "animation.contrast must be > 0".into(),
            ));
        }
        if animation.slow_frame_limit == 0 || animation.slow_frame_limit > animation.check_window {
            return Err(ConfigError::Invalid(format!(
                "animation.slow_frame_limit must be between 1 and check_window ({})",
                animation.check_window
            )));
        }
        if let Some(fps) = animation.fps {
            if fps < 0.0 {
                return Err(ConfigError::Invalid("animation.fps must be >= 0".into()));
            }
        }

        if self.export.thumbnail_size == 0 {
            return Err(ConfigError::Invalid(
                "export.thumbnail_size must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[device]
power = "low"
fallback_adapter = true
memory = "performance"

[pool]
max_per_key = 8
max_age = "2m"

[watchdog]
timeout = 3

[animation]
supersample = 2.0
gamma = 2.2
slow_frame_threshold = "50ms"
profile = true

[export]
thumbnail_size = 128
"#;

    #[test]
    fn parses_sample_config() {
        let config = EngineConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.device.power, PowerPreference::Low);
        assert!(config.device.fallback_adapter);
        assert_eq!(config.device.memory, MemoryProfile::Performance);
        assert_eq!(config.pool.max_per_key, 8);
        assert_eq!(config.pool.max_age, Duration::from_secs(120));
        assert_eq!(config.watchdog.timeout, Duration::from_secs(3));
        assert_eq!(config.animation.supersample, 2.0);
        assert_eq!(
            config.animation.slow_frame_threshold,
            Duration::from_millis(50)
        );
        assert_eq!(config.animation.contrast, 1.0);
        assert_eq!(config.animation.check_window, 30);
        assert!(config.animation.profile);
        assert_eq!(config.export.thumbnail_size, 128);
    }

    #[test]
    fn empty_input_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.device.power, PowerPreference::High);
        assert_eq!(config.pool.max_per_key, 4);
        assert_eq!(config.pool.max_age, Duration::from_secs(60));
        assert_eq!(config.watchdog.timeout, Duration::from_secs(5));
        assert_eq!(config.animation.slow_frame_limit, 3);
        assert_eq!(config.export.thumbnail_size, 256);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for input in [
            "version = 2",
            "[pool]\nmax_per_key = 0",
            "[watchdog]\ntimeout = 0",
            "[animation]\nsupersample = 5.0",
            "[animation]\nsupersample = 0.0",
            "[animation]\ngamma = 0.0",
            "[animation]\ncontrast = -1.0",
            "[animation]\nslow_frame_limit = 40",
            "[export]\nthumbnail_size = 0",
        ] {
            let err = EngineConfig::from_toml_str(input).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{input}: {err}");
        }
    }

    #[test]
    fn rejects_malformed_duration() {
        let err = EngineConfig::from_toml_str("[watchdog]\ntimeout = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.pool.max_per_key, 4);

        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.export.thumbnail_size, 128);
    }

    #[test]
    fn serialized_defaults_round_trip() {
        let text = EngineConfig::default().to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.watchdog.timeout, Duration::from_secs(5));
        assert_eq!(
            parsed.animation.slow_frame_threshold,
            Duration::from_millis(100)
        );
    }
}
