use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// 上游DNS。
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// 上游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

/// 响应缓存配置，TTL 单位均为秒。
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 缓存条目上限，仅在首次写入时生效。
    #[serde(default = "default_cache_size")]
    pub size: usize,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
    #[serde(default = "default_neg_min_ttl")]
    pub neg_min_ttl: u32,
    #[serde(default = "default_neg_max_ttl")]
    pub neg_max_ttl: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_cache_size(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            neg_min_ttl: default_neg_min_ttl(),
            neg_max_ttl: default_neg_max_ttl(),
        }
    }
}

impl ProxyConfig {
    #[inline]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.upstream_timeout_ms)
    }

    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        self.settings
            .upstream
            .parse()
            .with_context(|| format!("parse upstream addr: {}", self.settings.upstream))
    }

    pub fn validate(&self) -> Result<()> {
        self.settings
            .bind_udp
            .parse::<SocketAddr>()
            .with_context(|| format!("parse bind_udp: {}", self.settings.bind_udp))?;
        self.settings
            .bind_tcp
            .parse::<SocketAddr>()
            .with_context(|| format!("parse bind_tcp: {}", self.settings.bind_tcp))?;
        self.upstream_addr()?;

        let cache = &self.cache;
        if cache.min_ttl > cache.max_ttl {
            anyhow::bail!("cache min_ttl {} exceeds max_ttl {}", cache.min_ttl, cache.max_ttl);
        }
        if cache.neg_min_ttl > cache.neg_max_ttl {
            anyhow::bail!(
                "cache neg_min_ttl {} exceeds neg_max_ttl {}",
                cache.neg_min_ttl,
                cache.neg_max_ttl
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.validate()
        .with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}


fn default_true() -> bool {
    true
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_cache_size() -> usize {
    4096
}

fn default_min_ttl() -> u32 {
    2400
}

fn default_max_ttl() -> u32 {
    86400
}

fn default_neg_min_ttl() -> u32 {
    60
}

fn default_neg_max_ttl() -> u32 {
    600
}
