//! Configuration for the volume cache and its collaborators.
//!
//! Values come from defaults, then an optional TOML file, then environment
//! variables, each layer overriding the previous one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MB: usize = 1024 * 1024;

/// What `set_max_cache_size` does when the new limit is below current usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Refuse the new limit and leave the cache untouched.
    #[default]
    Reject,
    /// Decache least-recently-used idle entries until usage fits.
    EvictLru,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(EvictionPolicy::Reject),
            "evict_lru" | "lru" => Ok(EvictionPolicy::EvictLru),
            _ => Err(ConfigError::InvalidValue("eviction_policy".to_string())),
        }
    }
}

/// Settings shared by the cache, the streaming loader and the context pool.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Byte budget for images and volumes
    pub max_cache_size: usize,
    pub eviction_policy: EvictionPolicy,
    /// Let frame images alias a loaded volume's buffer
    pub enable_buffer_aliasing: bool,
    /// Whether the transport layer can hand out cross-context shareable buffers
    pub shared_buffers_supported: bool,
    /// Concurrent requests allowed per request class
    pub max_requests_per_class: usize,
    /// Number of GPU rendering contexts
    pub context_pool_size: usize,
    /// Canvas size tolerance in pixels for context affinity
    pub size_tolerance: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 3 * 1024 * MB, // 3 GB
            eviction_policy: EvictionPolicy::Reject,
            enable_buffer_aliasing: true,
            shared_buffers_supported: true,
            max_requests_per_class: 6,
            context_pool_size: 7,
            size_tolerance: 50,
        }
    }
}

/// On-disk layout. Sizes are in megabytes; every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eviction_policy: Option<EvictionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_buffer_aliasing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shared_buffers_supported: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_requests_per_class: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_tolerance: Option<u32>,
}

impl CacheConfig {
    /// Sets the byte budget in megabytes, saturating at `usize::MAX` bytes.
    pub fn with_max_cache_mb(mut self, mb: usize) -> Self {
        self.max_cache_size = mb.saturating_mul(MB);
        self
    }

    pub fn with_max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_buffer_aliasing(mut self, enabled: bool) -> Self {
        self.enable_buffer_aliasing = enabled;
        self
    }

    pub fn with_shared_buffers(mut self, supported: bool) -> Self {
        self.shared_buffers_supported = supported;
        self
    }

    pub fn with_max_requests_per_class(mut self, max: usize) -> Self {
        self.max_requests_per_class = max.max(1);
        self
    }

    pub fn with_context_pool_size(mut self, size: usize) -> Self {
        self.context_pool_size = size.max(1);
        self
    }

    pub fn with_size_tolerance(mut self, pixels: u32) -> Self {
        self.size_tolerance = pixels;
        self
    }

    pub fn max_cache_mb(&self) -> usize {
        self.max_cache_size / MB
    }

    /// Zero-copy aliasing runs only when enabled and the buffers are shareable.
    pub fn buffer_aliasing_active(&self) -> bool {
        self.enable_buffer_aliasing && self.shared_buffers_supported
    }

    /// Default location of the configuration file.
    ///
    /// - macOS: ~/Library/Application Support/voxstream/cache.toml
    /// - Linux: ~/.config/voxstream/cache.toml
    /// - Windows: %APPDATA%\voxstream\cache.toml
    pub fn default_config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("voxstream").join("cache.toml"),
            None => PathBuf::from("voxstream-cache.toml"),
        }
    }

    /// Defaults, overridden by the default config file if present, then by
    /// the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_config_path();
        let base = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        base.merge_env()
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `VOXSTREAM_MAX_CACHE_MB`: byte budget in MB
    /// - `VOXSTREAM_EVICTION_POLICY`: `reject` or `evict_lru`
    /// - `VOXSTREAM_BUFFER_ALIASING`: `true` / `false`
    /// - `VOXSTREAM_CONTEXT_POOL_SIZE`: number of rendering contexts
    /// - `VOXSTREAM_SIZE_TOLERANCE`: context affinity tolerance in pixels
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env()
    }

    /// Applies environment overrides to `self`.
    pub fn merge_env(mut self) -> Result<Self, ConfigError> {
        if let Some(mb) = env_value::<usize>("VOXSTREAM_MAX_CACHE_MB")? {
            self.max_cache_size = mb_to_bytes(mb, "VOXSTREAM_MAX_CACHE_MB")?;
        }
        if let Some(policy) = env_value::<EvictionPolicy>("VOXSTREAM_EVICTION_POLICY")? {
            self.eviction_policy = policy;
        }
        if let Some(enabled) = env_value::<bool>("VOXSTREAM_BUFFER_ALIASING")? {
            self.enable_buffer_aliasing = enabled;
        }
        if let Some(size) = env_value::<usize>("VOXSTREAM_CONTEXT_POOL_SIZE")? {
            self = self.with_context_pool_size(size);
        }
        if let Some(tolerance) = env_value::<u32>("VOXSTREAM_SIZE_TOLERANCE")? {
            self.size_tolerance = tolerance;
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// max_cache_mb = 3072
    /// eviction_policy = "evict_lru"
    /// enable_buffer_aliasing = true
    /// context_pool_size = 7
    /// size_tolerance = 50
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();
        if let Some(mb) = file.max_cache_mb {
            config.max_cache_size = mb_to_bytes(mb, "max_cache_mb")?;
        }
        if let Some(policy) = file.eviction_policy {
            config.eviction_policy = policy;
        }
        if let Some(enabled) = file.enable_buffer_aliasing {
            config.enable_buffer_aliasing = enabled;
        }
        if let Some(supported) = file.shared_buffers_supported {
            config.shared_buffers_supported = supported;
        }
        if let Some(max) = file.max_requests_per_class {
            config = config.with_max_requests_per_class(max);
        }
        if let Some(size) = file.context_pool_size {
            config = config.with_context_pool_size(size);
        }
        if let Some(tolerance) = file.size_tolerance {
            config.size_tolerance = tolerance;
        }
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            max_cache_mb: Some(self.max_cache_mb()),
            eviction_policy: Some(self.eviction_policy),
            enable_buffer_aliasing: Some(self.enable_buffer_aliasing),
            shared_buffers_supported: Some(self.shared_buffers_supported),
            max_requests_per_class: Some(self.max_requests_per_class),
            context_pool_size: Some(self.context_pool_size),
            size_tolerance: Some(self.size_tolerance),
        };
        Ok(toml::to_string(&file)?)
    }
}

fn mb_to_bytes(mb: usize, key: &str) -> Result<usize, ConfigError> {
    mb.checked_mul(MB)
        .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
}

fn env_value<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
