use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "landwatch.toml";
pub const DEFAULT_SCHEMA: &str = "landwatch";
pub const DEFAULT_SQLITE_PATH: &str = "landwatch.sqlite";
pub const SCHEMA_ENV: &str = "LANDWATCH_SCHEMA";
pub const DATABASE_URL_ENV: &str = "LANDWATCH_DATABASE_URL";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_POLL_BATCH_SIZE: u32 = 20;
pub const DEFAULT_STALE_RUNNING_MINUTES: u32 = 30;
pub const DEFAULT_CACHE_TTL_MONTHS: u32 = 2;
pub const DEFAULT_CACHE_SWEEP_INTERVAL_HOURS: u64 = 6;
pub const DEFAULT_CACHE_MEMORY_CAPACITY: u64 = 512;
pub const DEFAULT_CACHE_MEMORY_TTL_SECS: u64 = 300;
pub const DEFAULT_MAP_TOLERANCE: f64 = 0.0001;
pub const MAX_MAP_TOLERANCE: f64 = 0.01;
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SCHEDULER_BATCH_SIZE: u32 = 200;
pub const DEFAULT_SPATIAL_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LandwatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub spatial: SpatialConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_spatial_max_connections")]
    pub max_connections: u32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schema: default_schema(),
            max_connections: DEFAULT_SPATIAL_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: u32,
    /// Analyses left in `running` longer than this are force-failed by the poller. Zero disables the sweep.
    #[serde(default = "default_stale_running_minutes")]
    pub stale_running_minutes: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            poll_batch_size: DEFAULT_POLL_BATCH_SIZE,
            stale_running_minutes: DEFAULT_STALE_RUNNING_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_months")]
    pub ttl_months: u32,
    #[serde(default = "default_cache_sweep_interval_hours")]
    pub sweep_interval_hours: u64,
    #[serde(default = "default_cache_memory_capacity")]
    pub memory_capacity: u64,
    #[serde(default = "default_cache_memory_ttl_secs")]
    pub memory_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_months: DEFAULT_CACHE_TTL_MONTHS,
            sweep_interval_hours: DEFAULT_CACHE_SWEEP_INTERVAL_HOURS,
            memory_capacity: DEFAULT_CACHE_MEMORY_CAPACITY,
            memory_ttl_secs: DEFAULT_CACHE_MEMORY_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    #[serde(default = "default_map_tolerance")]
    pub default_tolerance: f64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            default_tolerance: DEFAULT_MAP_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_SCHEDULER_INTERVAL_SECS,
            batch_size: DEFAULT_SCHEDULER_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("{name} is invalid: '{value}' is not a plain SQL identifier")]
    InvalidIdentifier { name: &'static str, value: String },
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, the only shape allowed to be spliced into SQL.
pub fn validate_identifier(value: &str, name: &'static str) -> Result<String, ConfigError> {
    let mut chars = value.chars();
    let valid_head = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    let valid_tail = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid_head && valid_tail {
        Ok(value.to_owned())
    } else {
        Err(ConfigError::InvalidIdentifier {
            name,
            value: value.to_owned(),
        })
    }
}

pub fn config_path(root: impl AsRef<Path>) -> PathBuf {
    root.as_ref().join(CONFIG_FILE_NAME)
}

/// Loads `landwatch.toml` from `root`, falling back to defaults when absent.
pub fn load_config(root: impl AsRef<Path>) -> Result<LandwatchConfig, ConfigError> {
    let path = config_path(root);
    if !path.exists() {
        return finalize(LandwatchConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: LandwatchConfig = toml::from_str(&raw)?;
    finalize(parsed)
}

pub fn ensure_config(root: impl AsRef<Path>) -> Result<LandwatchConfig, ConfigError> {
    let root = root.as_ref();
    fs::create_dir_all(root)?;

    let path = config_path(root);
    if path.exists() {
        return load_config(root);
    }

    let config = LandwatchConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Applies `LANDWATCH_SCHEMA` / `LANDWATCH_DATABASE_URL` style overrides through `lookup`.
pub fn apply_env_overrides<F>(
    mut config: LandwatchConfig,
    lookup: F,
) -> Result<LandwatchConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(schema) = normalize_optional(lookup(SCHEMA_ENV)) {
        config.spatial.schema = validate_identifier(&schema, SCHEMA_ENV)?;
    }
    if let Some(url) = normalize_optional(lookup(DATABASE_URL_ENV)) {
        config.spatial.database_url = Some(url);
    }
    Ok(config)
}

pub fn validate_config(config: &LandwatchConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.spatial.database_url.is_none() {
        warnings.push(ConfigWarning {
            code: "spatial_url_missing",
            message: format!(
                "spatial.database_url is not set; set it in {CONFIG_FILE_NAME} or {DATABASE_URL_ENV}"
            ),
        });
    }
    if config.runner.poll_interval_secs == 0 {
        warnings.push(ConfigWarning {
            code: "runner_poll_disabled",
            message: "runner.poll_interval_secs is 0; orphaned pending analyses will not be picked up"
                .to_owned(),
        });
    }
    if config.runner.stale_running_minutes == 0 {
        warnings.push(ConfigWarning {
            code: "runner_stale_sweep_disabled",
            message: "runner.stale_running_minutes is 0; analyses stuck in running are never failed"
                .to_owned(),
        });
    }
    if config.cache.ttl_months == 0 {
        warnings.push(ConfigWarning {
            code: "cache_ttl_zero",
            message: "cache.ttl_months is 0; every cached payload expires immediately".to_owned(),
        });
    }
    if config.map.default_tolerance != clamp_tolerance(Some(config.map.default_tolerance)) {
        warnings.push(ConfigWarning {
            code: "map_tolerance_clamped",
            message: format!(
                "map.default_tolerance {} is outside [0, {MAX_MAP_TOLERANCE}] and will be clamped",
                config.map.default_tolerance
            ),
        });
    }

    warnings
}

/// Clamps a simplification tolerance to `[0, 0.01]`; absent or non-finite input yields the default.
pub fn clamp_tolerance(tolerance: Option<f64>) -> f64 {
    match tolerance {
        Some(value) if value.is_finite() => value.clamp(0.0, MAX_MAP_TOLERANCE),
        _ => DEFAULT_MAP_TOLERANCE,
    }
}

fn finalize(config: LandwatchConfig) -> Result<LandwatchConfig, ConfigError> {
    let config = normalize_config(config);
    validate_identifier(&config.spatial.schema, "spatial.schema")?;
    Ok(config)
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn normalize_config(mut config: LandwatchConfig) -> LandwatchConfig {
    config.spatial.database_url = normalize_optional(config.spatial.database_url.take());

    let schema = config.spatial.schema.trim();
    config.spatial.schema = if schema.is_empty() {
        default_schema()
    } else {
        schema.to_owned()
    };

    let sqlite_path = config.storage.sqlite_path.trim();
    config.storage.sqlite_path = if sqlite_path.is_empty() {
        default_sqlite_path()
    } else {
        sqlite_path.to_owned()
    };

    if config.runner.poll_batch_size == 0 {
        config.runner.poll_batch_size = DEFAULT_POLL_BATCH_SIZE;
    }
    if config.scheduler.batch_size == 0 {
        config.scheduler.batch_size = DEFAULT_SCHEDULER_BATCH_SIZE;
    }
    if config.spatial.max_connections == 0 {
        config.spatial.max_connections = DEFAULT_SPATIAL_MAX_CONNECTIONS;
    }

    config
}

fn default_sqlite_path() -> String {
    DEFAULT_SQLITE_PATH.to_owned()
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_owned()
}

fn default_spatial_max_connections() -> u32 {
    DEFAULT_SPATIAL_MAX_CONNECTIONS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_poll_batch_size() -> u32 {
    DEFAULT_POLL_BATCH_SIZE
}

fn default_stale_running_minutes() -> u32 {
    DEFAULT_STALE_RUNNING_MINUTES
}

fn default_cache_ttl_months() -> u32 {
    DEFAULT_CACHE_TTL_MONTHS
}

fn default_cache_sweep_interval_hours() -> u64 {
    DEFAULT_CACHE_SWEEP_INTERVAL_HOURS
}

fn default_cache_memory_capacity() -> u64 {
    DEFAULT_CACHE_MEMORY_CAPACITY
}

fn default_cache_memory_ttl_secs() -> u64 {
    DEFAULT_CACHE_MEMORY_TTL_SECS
}

fn default_map_tolerance() -> f64 {
    DEFAULT_MAP_TOLERANCE
}

fn default_scheduler_interval_secs() -> u64 {
    DEFAULT_SCHEDULER_INTERVAL_SECS
}

fn default_scheduler_batch_size() -> u32 {
    DEFAULT_SCHEDULER_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn ensure_config_creates_default_file() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();

        let config = ensure_config(root).expect("ensure config");

        assert_eq!(config.spatial.schema, DEFAULT_SCHEMA);
        assert_eq!(config.runner.poll_interval_secs, 10);
        assert_eq!(config.runner.poll_batch_size, 20);
        assert_eq!(config.cache.ttl_months, 2);
        assert!(config_path(root).exists());

        let content = fs::read_to_string(config_path(root)).expect("read config file");
        assert!(content.contains("[spatial]"));
        assert!(content.contains("schema = \"landwatch\""));
    }

    #[test]
    fn load_config_parses_sections_and_trims_values() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();

        let raw = r#"
[storage]
sqlite_path = "  data/app.sqlite  "

[spatial]
database_url = " postgres://landwatch@localhost/landwatch "
schema = "lw_prod"

[runner]
poll_interval_secs = 5
poll_batch_size = 0

[map]
default_tolerance = 0.0005
"#;
        fs::write(config_path(root), raw).expect("write config");

        let config = load_config(root).expect("load config");

        assert_eq!(config.storage.sqlite_path, "data/app.sqlite");
        assert_eq!(
            config.spatial.database_url.as_deref(),
            Some("postgres://landwatch@localhost/landwatch")
        );
        assert_eq!(config.spatial.schema, "lw_prod");
        assert_eq!(config.runner.poll_interval_secs, 5);
        assert_eq!(config.runner.poll_batch_size, DEFAULT_POLL_BATCH_SIZE);
        assert_eq!(config.map.default_tolerance, 0.0005);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn load_config_rejects_schema_with_sql_metacharacters() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(
            config_path(root),
            "[spatial]\nschema = \"landwatch\\\"; DROP TABLE x; --\"\n",
        )
        .expect("write config");

        let err = load_config(root).expect_err("schema must be rejected");
        assert!(matches!(err, ConfigError::InvalidIdentifier { .. }));
    }

    #[test]
    fn validate_identifier_accepts_only_plain_identifiers() {
        assert!(validate_identifier("landwatch", "schema").is_ok());
        assert!(validate_identifier("_lw_2024", "schema").is_ok());
        assert!(validate_identifier("2024_lw", "schema").is_err());
        assert!(validate_identifier("lw-prod", "schema").is_err());
        assert!(validate_identifier("", "schema").is_err());
        assert!(validate_identifier("lw.prod", "schema").is_err());
    }

    #[test]
    fn env_overrides_replace_schema_and_url() {
        let env: HashMap<&str, &str> = HashMap::from([
            (SCHEMA_ENV, "other_schema"),
            (DATABASE_URL_ENV, "postgres://db/lw"),
        ]);

        let config = apply_env_overrides(LandwatchConfig::default(), |key| {
            env.get(key).map(|value| (*value).to_owned())
        })
        .expect("apply overrides");

        assert_eq!(config.spatial.schema, "other_schema");
        assert_eq!(config.spatial.database_url.as_deref(), Some("postgres://db/lw"));

        let err = apply_env_overrides(LandwatchConfig::default(), |key| {
            (key == SCHEMA_ENV).then(|| "bad schema".to_owned())
        })
        .expect_err("invalid schema from env");
        assert!(matches!(
            err,
            ConfigError::InvalidIdentifier {
                name: SCHEMA_ENV,
                ..
            }
        ));
    }

    #[test]
    fn validate_config_reports_missing_url_and_out_of_range_tolerance() {
        let mut config = LandwatchConfig::default();
        config.map.default_tolerance = 0.5;

        let codes: Vec<_> = validate_config(&config)
            .into_iter()
            .map(|warning| warning.code)
            .collect();

        assert!(codes.contains(&"spatial_url_missing"));
        assert!(codes.contains(&"map_tolerance_clamped"));
    }

    #[test]
    fn clamp_tolerance_bounds_and_defaults() {
        assert_eq!(clamp_tolerance(None), DEFAULT_MAP_TOLERANCE);
        assert_eq!(clamp_tolerance(Some(f64::NAN)), DEFAULT_MAP_TOLERANCE);
        assert_eq!(clamp_tolerance(Some(-1.0)), 0.0);
        assert_eq!(clamp_tolerance(Some(1.0)), MAX_MAP_TOLERANCE);
        assert_eq!(clamp_tolerance(Some(0.002)), 0.002);
    }
}
