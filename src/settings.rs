//! System configuration provider
//!
//! Reads the `system_config` key/value table through the store, caches the
//! map with a TTL, and layers process environment overrides on top. Numeric
//! accessors clamp to their documented ranges so a bad row degrades instead
//! of wedging the scheduler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::SettingsError;
use crate::store::Store;

/// Recognized configuration keys.
pub mod keys {
    pub const JFROG_BASE_URL: &str = "JFrogBaseURL";
    pub const JFROG_USER: &str = "SVCJFROGUSR";
    pub const JFROG_PASS: &str = "SVCJFROGPAS";
    pub const BASE_DRIVE: &str = "BaseDrive";
    pub const MAX_CONCURRENT_THREADS: &str = "MaxConcurrentThreads";
    pub const DEFAULT_POLLING_FREQUENCY: &str = "DefaultPollingFrequency";
    pub const MAX_BUILDS_TO_KEEP: &str = "MaxBuildsToKeep";
    pub const DOWNLOAD_TIMEOUT: &str = "DownloadTimeout";
    pub const EXTRACTION_TIMEOUT: &str = "ExtractionTimeout";
    pub const RETRY_ATTEMPTS: &str = "RetryAttempts";
    pub const LOG_RETENTION_DAYS: &str = "LogRetentionDays";
    pub const MAX_LOOKBACK_DAYS: &str = "MaxLookbackDays";

    /// All recognized keys, in the order `config` prints them.
    pub const ALL: &[&str] = &[
        JFROG_BASE_URL,
        JFROG_USER,
        JFROG_PASS,
        BASE_DRIVE,
        MAX_CONCURRENT_THREADS,
        DEFAULT_POLLING_FREQUENCY,
        MAX_BUILDS_TO_KEEP,
        DOWNLOAD_TIMEOUT,
        EXTRACTION_TIMEOUT,
        RETRY_ATTEMPTS,
        LOG_RETENTION_DAYS,
        MAX_LOOKBACK_DAYS,
    ];
}

/// Environment variables overriding their SystemConfig counterparts.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("WINCORE_BASE_DRIVE", keys::BASE_DRIVE),
    ("WINCORE_JFROG_URL", keys::JFROG_BASE_URL),
    ("WINCORE_JFROG_USER", keys::JFROG_USER),
    ("WINCORE_JFROG_PASS", keys::JFROG_PASS),
    ("WINCORE_MAX_CONCURRENCY", keys::MAX_CONCURRENT_THREADS),
];

/// Hard ceiling on the worker pool size.
pub const MAX_CONCURRENCY_CAP: u32 = 10_000;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_CONCURRENCY: u32 = 100;
const DEFAULT_POLLING_SECONDS: u64 = 300;
const MIN_POLLING_SECONDS: u64 = 30;
const DEFAULT_MAX_BUILDS: u32 = 5;
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_EXTRACTION_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;
const DEFAULT_LOOKBACK_DAYS: u32 = 7;

/// Cached view over `system_config` plus environment overrides.
pub struct Settings {
    store: Arc<Store>,
    ttl: Duration,
    cache: Mutex<Option<CachedMap>>,
}

struct CachedMap {
    loaded_at: Instant,
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Look a key up: environment override first, then the cached table.
    pub fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        if let Some(value) = env_override(key) {
            return Ok(Some(value));
        }
        let map = self.load()?;
        Ok(map.get(key).cloned())
    }

    /// Like [`Settings::get`] but missing keys are an error.
    pub fn require(&self, key: &str) -> Result<String, SettingsError> {
        self.get(key)?
            .ok_or_else(|| SettingsError::MissingKey(key.to_string()))
    }

    /// Drop the cache; the next read hits the store.
    pub fn reload(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, SettingsError> {
        let mut cache = self.cache.lock().map_err(|_| {
            SettingsError::Store(crate::error::StoreError::Poisoned)
        })?;
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.values.clone());
            }
        }
        let values = self.store.config_map()?;
        *cache = Some(CachedMap {
            loaded_at: Instant::now(),
            values: values.clone(),
        });
        Ok(values)
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>, SettingsError> {
        match self.get(key)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| SettingsError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, SettingsError> {
        Ok(self
            .get_u64(key)?
            .map(|v| v.min(u64::from(u32::MAX)) as u32))
    }

    // --- typed accessors -------------------------------------------------

    /// Worker pool size, clamped to `[1, 10000]`.
    pub fn max_concurrent_threads(&self) -> Result<u32, SettingsError> {
        let value = self
            .get_u32(keys::MAX_CONCURRENT_THREADS)?
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);
        Ok(value.clamp(1, MAX_CONCURRENCY_CAP))
    }

    /// Fallback polling cadence in seconds, clamped to >= 30.
    pub fn default_polling_frequency(&self) -> Result<u64, SettingsError> {
        let value = self
            .get_u64(keys::DEFAULT_POLLING_FREQUENCY)?
            .unwrap_or(DEFAULT_POLLING_SECONDS);
        Ok(value.max(MIN_POLLING_SECONDS))
    }

    /// Retention window, clamped to >= 1. Default 5.
    pub fn max_builds_to_keep(&self) -> Result<u32, SettingsError> {
        let value = self
            .get_u32(keys::MAX_BUILDS_TO_KEEP)?
            .unwrap_or(DEFAULT_MAX_BUILDS);
        Ok(value.max(1))
    }

    pub fn download_timeout(&self) -> Result<Duration, SettingsError> {
        Ok(Duration::from_secs(
            self.get_u64(keys::DOWNLOAD_TIMEOUT)?
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
        ))
    }

    pub fn extraction_timeout(&self) -> Result<Duration, SettingsError> {
        Ok(Duration::from_secs(
            self.get_u64(keys::EXTRACTION_TIMEOUT)?
                .unwrap_or(DEFAULT_EXTRACTION_TIMEOUT_SECONDS),
        ))
    }

    pub fn retry_attempts(&self) -> Result<u32, SettingsError> {
        Ok(self
            .get_u32(keys::RETRY_ATTEMPTS)?
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS))
    }

    pub fn log_retention_days(&self) -> Result<u32, SettingsError> {
        Ok(self
            .get_u32(keys::LOG_RETENTION_DAYS)?
            .unwrap_or(DEFAULT_LOG_RETENTION_DAYS))
    }

    /// How many days discovery walks back from today before giving up.
    pub fn max_lookback_days(&self) -> Result<u32, SettingsError> {
        Ok(self
            .get_u32(keys::MAX_LOOKBACK_DAYS)?
            .unwrap_or(DEFAULT_LOOKBACK_DAYS))
    }

    pub fn base_drive(&self) -> Result<PathBuf, SettingsError> {
        Ok(PathBuf::from(self.require(keys::BASE_DRIVE)?))
    }

    pub fn jfrog_base_url(&self) -> Result<String, SettingsError> {
        self.require(keys::JFROG_BASE_URL)
    }

    /// The service credentials. Both keys must be present.
    pub fn jfrog_credentials(&self) -> Result<(String, String), SettingsError> {
        Ok((
            self.require(keys::JFROG_USER)?,
            self.require(keys::JFROG_PASS)?,
        ))
    }

    /// All recognized keys with display values, secrets redacted. This is
    /// what the `config` command prints; the password never leaves here in
    /// the clear.
    pub fn redacted_entries(&self) -> Result<Vec<(&'static str, String)>, SettingsError> {
        let mut entries = Vec::with_capacity(keys::ALL.len());
        for &key in keys::ALL {
            let display = match self.get(key)? {
                None => "<unset>".to_string(),
                Some(_) if key == keys::JFROG_PASS => "********".to_string(),
                Some(value) => value,
            };
            entries.push((key, display));
        }
        Ok(entries)
    }
}

fn env_override(key: &str) -> Option<String> {
    ENV_OVERRIDES
        .iter()
        .find(|(_, mapped)| *mapped == key)
        .and_then(|(env, _)| std::env::var(env).ok())
        .filter(|v| !v.is_empty())
}
