//! Engine configuration.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RmaError};

/// How blocking calls drive progress while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Poke the transport in bounded batches, spinning `backoff_nanos` after an empty poke.
    Poke { backoff_nanos: u64 },

    /// Block inside the transport until something arrives.
    Wait,
}

impl Default for ProgressMode {
    fn default() -> Self {
        ProgressMode::Poke { backoff_nanos: 0 }
    }
}

impl FromStr for ProgressMode {
    type Err = RmaError;

    /// Parse `wait`, `poke` or `poke:<nanos>`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || RmaError::Config {
            key: "progress",
            value: s.to_owned(),
        };
        match s.split_once(':') {
            None if s == "wait" => Ok(ProgressMode::Wait),
            None if s == "poke" => Ok(ProgressMode::default()),
            Some(("poke", nanos)) => Ok(ProgressMode::Poke {
                backoff_nanos: nanos.parse().map_err(|_| bad())?,
            }),
            _ => Err(bad()),
        }
    }
}

/// Tunables of the passive-target engine, one instance per process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmaConfig {
    /// Byte budget of operation payload buffered in one window's lock queue.
    pub lock_data_bytes: usize,

    /// Maximum number of entries in one window's lock queue.
    pub lock_entry_pool: usize,

    /// Size of one streaming unit for accumulate-class payloads.
    pub stream_buf_size: usize,

    /// Largest payload allowed to ride together with a lock request.
    pub piggyback_lock_data_size: usize,

    /// Deliveries processed by one poke.
    pub poke_batch: usize,

    pub progress: ProgressMode,

    /// Send every lock request at `lock_all` instead of on demand.
    pub lock_all_eager: bool,
}

impl Default for RmaConfig {
    fn default() -> Self {
        Self {
            lock_data_bytes: 655_360,
            lock_entry_pool: 256,
            stream_buf_size: 256 * 1024,
            piggyback_lock_data_size: 65_536,
            poke_batch: 64,
            progress: ProgressMode::default(),
            lock_all_eager: false,
        }
    }
}

fn env_value<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RmaError::Config { key, value }),
        Err(_) => Ok(None),
    }
}

impl RmaConfig {
    /// Build a configuration from the defaults and the `RMALOCK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_value("RMALOCK_LOCK_DATA_BYTES")? {
            config.lock_data_bytes = v;
        }
        if let Some(v) = env_value("RMALOCK_LOCK_ENTRY_POOL")? {
            config.lock_entry_pool = v;
        }
        if let Some(v) = env_value("RMALOCK_STREAM_BUF_SIZE")? {
            config.stream_buf_size = v;
        }
        if let Some(v) = env_value("RMALOCK_PIGGYBACK_LOCK_DATA_SIZE")? {
            config.piggyback_lock_data_size = v;
        }
        if let Some(v) = env_value("RMALOCK_POKE_BATCH")? {
            config.poke_batch = v;
        }
        if let Some(v) = env_value("RMALOCK_PROGRESS")? {
            config.progress = v;
        }
        if let Some(v) = env_value("RMALOCK_LOCK_ALL_EAGER")? {
            config.lock_all_eager = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; absent keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| RmaError::Config {
            key: "json",
            value: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.stream_buf_size == 0 {
            return Err(RmaError::Config {
                key: "stream_buf_size",
                value: "0".into(),
            });
        }
        if self.poke_batch == 0 {
            return Err(RmaError::Config {
                key: "poke_batch",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn with_lock_data_bytes(mut self, bytes: usize) -> Self {
        self.lock_data_bytes = bytes;
        self
    }

    pub fn with_lock_entry_pool(mut self, entries: usize) -> Self {
        self.lock_entry_pool = entries;
        self
    }

    pub fn with_stream_buf_size(mut self, bytes: usize) -> Self {
        self.stream_buf_size = bytes;
        self
    }

    pub fn with_piggyback_lock_data_size(mut self, bytes: usize) -> Self {
        self.piggyback_lock_data_size = bytes;
        self
    }

    pub fn with_progress(mut self, progress: ProgressMode) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_lock_all_eager(mut self, eager: bool) -> Self {
        self.lock_all_eager = eager;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_mode_parse() {
        assert_eq!("wait".parse::<ProgressMode>().unwrap(), ProgressMode::Wait);
        assert_eq!(
            "poke:500".parse::<ProgressMode>().unwrap(),
            ProgressMode::Poke { backoff_nanos: 500 }
        );
        assert_eq!(
            "poke".parse::<ProgressMode>().unwrap(),
            ProgressMode::default()
        );
        assert!("spin".parse::<ProgressMode>().is_err());
        assert!("poke:soon".parse::<ProgressMode>().is_err());
    }

    #[test]
    fn test_json_partial() {
        let config = RmaConfig::from_json(r#"{ "lock_data_bytes": 16, "progress": "wait" }"#)
            .unwrap();
        assert_eq!(config.lock_data_bytes, 16);
        assert_eq!(config.progress, ProgressMode::Wait);
        assert_eq!(config.lock_entry_pool, RmaConfig::default().lock_entry_pool);
    }

    #[test]
    fn test_json_rejects_zero_stream() {
        assert!(RmaConfig::from_json(r#"{ "stream_buf_size": 0 }"#).is_err());
    }

    #[test]
    fn test_env_override() {
        // Only this test touches these variables.
        env::set_var("RMALOCK_LOCK_DATA_BYTES", "1024");
        env::set_var("RMALOCK_LOCK_ALL_EAGER", "true");
        let config = RmaConfig::from_env().unwrap();
        assert_eq!(config.lock_data_bytes, 1024);
        assert!(config.lock_all_eager);

        env::set_var("RMALOCK_LOCK_DATA_BYTES", "lots");
        assert!(matches!(
            RmaConfig::from_env(),
            Err(RmaError::Config { key: "RMALOCK_LOCK_DATA_BYTES", .. })
        ));
        env::remove_var("RMALOCK_LOCK_DATA_BYTES");
        env::remove_var("RMALOCK_LOCK_ALL_EAGER");
    }
}
