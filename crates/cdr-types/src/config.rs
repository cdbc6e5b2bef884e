//! Layered configuration (§6 "Configuration inputs", §10 ambient stack).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Per-EDR-label pool sizing and provisioning parameters (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_uses")]
    pub max_uses: u32,
    #[serde(default = "default_clean_timeout_sec")]
    pub clean_timeout_sec: u64,
    #[serde(default)]
    pub vm_size: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub admin_username: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Base image reference, keyed by EDR label.
    #[serde(default)]
    pub base_image: BTreeMap<String, String>,
}

fn default_pool_size() -> usize {
    5
}
fn default_max_uses() -> u32 {
    20
}
fn default_clean_timeout_sec() -> u64 {
    120
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_uses: default_max_uses(),
            clean_timeout_sec: default_clean_timeout_sec(),
            vm_size: None,
            subnet_id: None,
            admin_username: None,
            admin_password: None,
            base_image: BTreeMap::new(),
        }
    }
}

/// Per-phase concurrency and retry parameters (§4.3, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,
    #[serde(default = "default_interaction_duration_sec")]
    pub interaction_duration_sec: u64,
    #[serde(default = "default_settle_delay_sec")]
    pub settle_delay_sec: u64,
    #[serde(default = "default_soft_timeout_sec")]
    pub soft_timeout_sec: u64,
    #[serde(default = "default_hard_timeout_sec")]
    pub hard_timeout_sec: u64,
    #[serde(default = "default_vm_acquire_timeout_sec")]
    pub vm_acquire_timeout_sec: u64,
}

fn default_max_concurrency() -> usize {
    8
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_sec() -> u64 {
    60
}
fn default_interaction_duration_sec() -> u64 {
    300
}
fn default_settle_delay_sec() -> u64 {
    60
}
fn default_soft_timeout_sec() -> u64 {
    3600
}
fn default_hard_timeout_sec() -> u64 {
    7200
}
fn default_vm_acquire_timeout_sec() -> u64 {
    3600
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_sec: default_retry_delay_sec(),
            interaction_duration_sec: default_interaction_duration_sec(),
            settle_delay_sec: default_settle_delay_sec(),
            soft_timeout_sec: default_soft_timeout_sec(),
            hard_timeout_sec: default_hard_timeout_sec(),
            vm_acquire_timeout_sec: default_vm_acquire_timeout_sec(),
        }
    }
}

/// Job store connection parameters (§4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_ttl_sec")]
    pub ttl_sec: i64,
}

fn default_store_url() -> String {
    "memory://local".to_string()
}
fn default_ttl_sec() -> i64 {
    7 * 24 * 3600
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            ttl_sec: default_ttl_sec(),
        }
    }
}

/// REST server bind parameters (§6, §10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Maximum accepted request body size, in bytes (§6).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_filter() -> String {
    "cdr_validate=info,tower_http=info".to_string()
}
fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Priority → scheduler-hint map (advisory only, §4.7, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityMap {
    #[serde(default = "default_low_hint")]
    pub low: u8,
    #[serde(default = "default_normal_hint")]
    pub normal: u8,
    #[serde(default = "default_high_hint")]
    pub high: u8,
}

fn default_low_hint() -> u8 {
    3
}
fn default_normal_hint() -> u8 {
    5
}
fn default_high_hint() -> u8 {
    7
}

impl Default for PriorityMap {
    fn default() -> Self {
        Self {
            low: default_low_hint(),
            normal: default_normal_hint(),
            high: default_high_hint(),
        }
    }
}

/// Top-level configuration object, loaded once at process startup (§10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub phase1: PhaseConfig,
    #[serde(default)]
    pub phase2: PhaseConfig,
    #[serde(default)]
    pub phase3: PhaseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub priority_map: PriorityMap,
}

impl Config {
    /// Load from a TOML file, falling back to defaults entirely if the path is absent.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| CoreError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Resolve the default config path from `CDR_VALIDATE_CONFIG`, or `./config.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var_os("CDR_VALIDATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Load from the resolved default path.
    pub fn load_default() -> Result<Self, CoreError> {
        Self::load(&Self::default_path())
    }
}
