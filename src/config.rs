//! Configuration for Keystead
//!
//! CLI arguments and environment variable handling using clap. The library
//! itself only sees [`KeeperConfig`]; `Args` exists for the host binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::crypto::CodecParams;
use crate::store::SlotProvider;
use crate::types::{Result, WalletError};

/// Keystead - background control core for a browser identity wallet
#[derive(Parser, Debug, Clone)]
#[command(name = "keystead")]
#[command(about = "Identity wallet control core speaking newline-delimited JSON on stdio")]
pub struct Args {
    /// Directory holding the persisted slots. In-memory when unset.
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Register development-only methods (clear-approved-hosts, dummy-request)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Lock after this many idle minutes (0 disables auto-lock)
    #[arg(long, env = "AUTO_LOCK_MINUTES", default_value = "15")]
    pub auto_lock_minutes: u64,

    /// How often the auto-lock timer checks for inactivity
    #[arg(long, env = "AUTO_LOCK_CHECK_SECS", default_value = "30")]
    pub auto_lock_check_secs: u64,

    /// Give up on a consent request after this many milliseconds.
    /// Unset means wait for the user indefinitely.
    #[arg(long, env = "CONSENT_TIMEOUT_MS")]
    pub consent_timeout_ms: Option<u64>,

    /// Depth of the bounded RPC channel
    #[arg(long, env = "CHANNEL_CAPACITY", default_value = "64")]
    pub channel_capacity: usize,

    /// Argon2id memory cost in KiB
    #[arg(long, env = "KDF_MEMORY_KB", default_value = "65536")]
    pub kdf_memory_kb: u32,

    /// Argon2id iterations
    #[arg(long, env = "KDF_ITERATIONS", default_value = "3")]
    pub kdf_iterations: u32,

    /// Where the proof engine finds circuit artifacts
    #[arg(long, env = "PROOF_ARTIFACTS_DIR", default_value = "zkeyFiles")]
    pub proof_artifacts_dir: String,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be text or json, got {}", self.log_format));
        }
        if self.channel_capacity == 0 {
            return Err("CHANNEL_CAPACITY must be at least 1".to_string());
        }
        if self.auto_lock_minutes > 0 && self.auto_lock_check_secs == 0 {
            return Err("AUTO_LOCK_CHECK_SECS must be at least 1 when auto-lock is enabled".to_string());
        }
        if self.kdf_iterations == 0 {
            return Err("KDF_ITERATIONS must be at least 1".to_string());
        }
        // Argon2 requires at least 8 KiB per lane
        if self.kdf_memory_kb < 8 * CodecParams::default().parallelism {
            return Err("KDF_MEMORY_KB is too small".to_string());
        }
        if self.consent_timeout_ms == Some(0) {
            return Err("CONSENT_TIMEOUT_MS must be positive when set".to_string());
        }
        if self.proof_artifacts_dir.trim().is_empty() {
            return Err("PROOF_ARTIFACTS_DIR must not be empty".to_string());
        }
        Ok(())
    }

    pub fn keeper_config(&self) -> KeeperConfig {
        let defaults = CodecParams::default();
        KeeperConfig {
            slots: SlotProvider::from_data_dir(self.data_dir.clone()),
            codec: CodecParams::new(self.kdf_memory_kb, self.kdf_iterations, defaults.parallelism),
            dev_mode: self.dev_mode,
            auto_lock: (self.auto_lock_minutes > 0).then(|| AutoLock {
                idle: Duration::from_secs(self.auto_lock_minutes * 60),
                check_interval: Duration::from_secs(self.auto_lock_check_secs),
            }),
            consent_timeout: self.consent_timeout_ms.map(Duration::from_millis),
            proof_artifacts_dir: self.proof_artifacts_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoLock {
    pub idle: Duration,
    pub check_interval: Duration,
}

/// Everything needed to start a keeper.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub slots: SlotProvider,
    pub codec: CodecParams,
    pub dev_mode: bool,
    pub auto_lock: Option<AutoLock>,
    pub consent_timeout: Option<Duration>,
    pub proof_artifacts_dir: String,
}

impl KeeperConfig {
    /// In-memory keeper with cheap key derivation. Handy for tests and demos.
    pub fn ephemeral() -> Self {
        Self {
            slots: SlotProvider::Memory,
            codec: CodecParams::new(8, 1, 1),
            dev_mode: false,
            auto_lock: None,
            consent_timeout: None,
            proof_artifacts_dir: "zkeyFiles".to_string(),
        }
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_slots(mut self, slots: SlotProvider) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_auto_lock(mut self, auto_lock: Option<AutoLock>) -> Self {
        self.auto_lock = auto_lock;
        self
    }

    pub fn with_consent_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.consent_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(auto_lock) = self.auto_lock {
            if auto_lock.idle.is_zero() || auto_lock.check_interval.is_zero() {
                return Err(WalletError::Config("auto-lock durations must be positive".into()));
            }
        }
        if self.codec.iterations == 0 {
            return Err(WalletError::Config("KDF iterations must be at least 1".into()));
        }
        Ok(())
    }
}
