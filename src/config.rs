//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::device::SegmentedDeviceOptions;
use crate::store::StoreOptions;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TidekvConfig {
    /// Device configuration.
    pub device: Option<DeviceConfigSpec>,
    /// Store configuration.
    pub store: Option<StoreConfigSpec>,
}

impl TidekvConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `TIDEKV_CONFIG` env var (if set), then
    /// apply `TIDEKV__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("TIDEKV_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("TIDEKV__") {
                continue;
            }
            let path = key["TIDEKV__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["device", "base"] => {
                    self.device_mut().base = Some(PathBuf::from(value));
                }
                ["device", "segment_size"] => {
                    self.device_mut().segment_size = Some(value.to_string());
                }
                ["device", "handle_capacity"] => {
                    self.device_mut().handle_capacity = Some(parse_value(&key, &value)?);
                }
                ["device", "delete_on_close"] => {
                    self.device_mut().delete_on_close = Some(parse_value(&key, &value)?);
                }
                ["device", "os_read_buffering"] => {
                    self.device_mut().os_read_buffering = Some(parse_value(&key, &value)?);
                }
                ["device", "preallocate_file"] => {
                    self.device_mut().preallocate_file = Some(parse_value(&key, &value)?);
                }
                ["device", "recover_device"] => {
                    self.device_mut().recover_device = Some(parse_value(&key, &value)?);
                }
                ["device", "io_workers"] => {
                    self.device_mut().io_workers = Some(parse_value(&key, &value)?);
                }
                ["store", "shard_count"] => {
                    self.store_mut().shard_count = Some(parse_value(&key, &value)?);
                }
                ["store", "lock_bucket_count"] => {
                    self.store_mut().lock_bucket_count = Some(parse_value(&key, &value)?);
                }
                ["store", "log_page_size"] => {
                    self.store_mut().log_page_size = Some(value.to_string());
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build [`SegmentedDeviceOptions`] using defaults plus overrides.
    pub fn to_device_options(&self) -> SegmentedDeviceOptions {
        let mut options = SegmentedDeviceOptions::default();
        if let Some(device) = &self.device {
            device.apply_to(&mut options);
        }
        options
    }

    /// Build [`StoreOptions`] using defaults plus overrides.
    pub fn to_store_options(&self) -> StoreOptions {
        let mut options = StoreOptions::default();
        if let Some(store) = &self.store {
            store.apply_to(&mut options);
        }
        options
    }

    fn device_mut(&mut self) -> &mut DeviceConfigSpec {
        self.device.get_or_insert_with(DeviceConfigSpec::default)
    }

    fn store_mut(&mut self) -> &mut StoreConfigSpec {
        self.store.get_or_insert_with(StoreConfigSpec::default)
    }
}

/// `[device]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfigSpec {
    /// Base path of the segmented log (`<base>.<segment_id>`).
    pub base: Option<PathBuf>,
    /// Segment size as a size string (`"1 GB"`); `"0"` means unbounded.
    pub segment_size: Option<String>,
    /// Per-segment, per-direction handle limit.
    pub handle_capacity: Option<usize>,
    /// Delete segment files on reset/dispose.
    pub delete_on_close: Option<bool>,
    /// Keep OS buffering instead of direct I/O.
    pub os_read_buffering: Option<bool>,
    /// Preallocate segment files to the fixed size.
    pub preallocate_file: Option<bool>,
    /// Enumerate existing segments on startup.
    pub recover_device: Option<bool>,
    /// Worker threads serving async I/O.
    pub io_workers: Option<usize>,
}

impl DeviceConfigSpec {
    fn apply_to(&self, options: &mut SegmentedDeviceOptions) {
        if let Some(segment_size) = &self.segment_size {
            let bytes = parse_size(segment_size);
            options.segment_size = if bytes == 0 { None } else { Some(bytes) };
        }
        if let Some(handle_capacity) = self.handle_capacity {
            options.handle_capacity = handle_capacity;
        }
        if let Some(delete_on_close) = self.delete_on_close {
            options.delete_on_close = delete_on_close;
        }
        if let Some(os_read_buffering) = self.os_read_buffering {
            options.os_read_buffering = os_read_buffering;
        }
        if let Some(preallocate_file) = self.preallocate_file {
            options.preallocate_file = preallocate_file;
        }
        if let Some(recover_device) = self.recover_device {
            options.recover_device = recover_device;
        }
        if let Some(io_workers) = self.io_workers {
            options.io_workers = io_workers;
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfigSpec {
    /// Number of record-table shards.
    pub shard_count: Option<usize>,
    /// Number of lock-table buckets.
    pub lock_bucket_count: Option<usize>,
    /// Log page size as a size string (`"4k"`).
    pub log_page_size: Option<String>,
}

impl StoreConfigSpec {
    fn apply_to(&self, options: &mut StoreOptions) {
        if let Some(shard_count) = self.shard_count {
            options.shard_count = shard_count;
        }
        if let Some(lock_bucket_count) = self.lock_bucket_count {
            options.lock_bucket_count = lock_bucket_count;
        }
        if let Some(log_page_size) = &self.log_page_size {
            let bytes = parse_size(log_page_size);
            if bytes != 0 {
                options.log_page_size = bytes as usize;
            }
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse a size string of the form `^[0-9]+ ?[kKmMgGtTpP]B?$` into bytes.
///
/// The multiplier is `1024^n` keyed on `k,m,g,t,p`. Strings that match no
/// suffix parse as their leading digits; anything else parses as 0.
pub fn parse_size(value: &str) -> u64 {
    const SUFFIXES: &str = "kmgtp";

    let mut result: u64 = 0;
    for c in value.chars() {
        if let Some(digit) = c.to_digit(10) {
            result = result.wrapping_mul(10).wrapping_add(digit as u64);
        } else if let Some(index) = SUFFIXES.find(c.to_ascii_lowercase()) {
            return result.wrapping_mul(1024u64.pow(index as u32 + 1));
        }
    }
    result
}
