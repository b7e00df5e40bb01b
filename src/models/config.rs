use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::{ProxyMode, ServerDescriptor};
use crate::error::CompileError;

/// 持久化的应用配置文档
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: AppSettings,

    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,

    #[serde(rename = "proxyMode", default)]
    pub proxy_mode: ProxyMode,

    #[serde(rename = "activeServer", default)]
    pub active_server: Option<String>,

    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRecord>,

    #[serde(rename = "gfwListUpdatedAt", default)]
    pub gfw_list_updated_at: Option<String>,
}

impl AppConfig {
    pub fn server(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_mut(&mut self, name: &str) -> Option<&mut ServerDescriptor> {
        self.servers.iter_mut().find(|s| s.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.name == name)
    }

    pub fn active(&self) -> Option<&ServerDescriptor> {
        self.active_server.as_deref().and_then(|name| self.server(name))
    }

    /// 根据激活名称重建 connected 标记，并丢弃指向不存在服务器的激活名称
    pub fn normalize(&mut self) {
        if let Some(active) = &self.active_server {
            if self.server(active).is_none() {
                log::warn!("Active server {} no longer exists, clearing selection", active);
                self.active_server = None;
            }
        }
        let active = self.active_server.clone();
        for server in &mut self.servers {
            server.connected = active.as_deref() == Some(server.name.as_str());
        }
    }
}

/// 订阅记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub url: String,

    #[serde(rename = "updatedAt")]
    pub updated_at: String,

    #[serde(rename = "serverCount", default)]
    pub server_count: usize,
}

/// 本地监听协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalProtocol {
    #[default]
    Socks,
    Http,
}

impl LocalProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socks => "socks",
            Self::Http => "http",
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(rename = "localProtocol", default)]
    pub local_protocol: LocalProtocol,

    #[serde(rename = "localHost", default = "default_local_host")]
    pub local_host: String,

    #[serde(rename = "localPort", default = "default_local_port")]
    pub local_port: u16,

    #[serde(rename = "probePort", default = "default_probe_port")]
    pub probe_port: u16,

    #[serde(rename = "pacPort", default = "default_pac_port")]
    pub pac_port: u16,

    #[serde(default = "default_udp")]
    pub udp: bool,

    #[serde(rename = "dnsServers", default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    #[serde(rename = "gfwListUrl", default = "default_gfw_list_url")]
    pub gfw_list_url: String,

    #[serde(rename = "gfwListRefreshHours", default = "default_gfw_list_refresh_hours")]
    pub gfw_list_refresh_hours: u32,

    #[serde(rename = "corePath", default)]
    pub core_path: Option<String>,

    #[serde(rename = "coreLogLevel", default = "default_core_log_level")]
    pub core_log_level: String,

    #[serde(rename = "latencyTarget", default = "default_latency_target")]
    pub latency_target: String,

    #[serde(rename = "latencyTimeoutMs", default = "default_latency_timeout_ms")]
    pub latency_timeout_ms: u64,

    #[serde(rename = "startupTimeoutMs", default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    #[serde(rename = "stopGraceMs", default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(rename = "commandTimeoutMs", default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// macOS 需要修改的网络服务，留空时自动探测
    #[serde(rename = "networkServices", default)]
    pub network_services: Vec<String>,

    /// 网络连通性检测地址
    #[serde(rename = "networkCheckUrls", default = "default_network_check_urls")]
    pub network_check_urls: Vec<String>,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port() -> u16 {
    1080
}
fn default_probe_port() -> u16 {
    1086
}
fn default_pac_port() -> u16 {
    1085
}
fn default_udp() -> bool {
    true
}
fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}
fn default_gfw_list_url() -> String {
    "https://raw.githubusercontent.com/gfwlist/gfwlist/master/gfwlist.txt".to_string()
}
fn default_gfw_list_refresh_hours() -> u32 {
    24
}
fn default_core_log_level() -> String {
    "warning".to_string()
}
fn default_latency_target() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}
fn default_latency_timeout_ms() -> u64 {
    3000
}
fn default_startup_timeout_ms() -> u64 {
    5000
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_command_timeout_ms() -> u64 {
    3000
}
fn default_network_check_urls() -> Vec<String> {
    vec![
        "https://www.google.com".to_string(),
        "https://www.baidu.com".to_string(),
    ]
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            local_protocol: LocalProtocol::default(),
            local_host: default_local_host(),
            local_port: default_local_port(),
            probe_port: default_probe_port(),
            pac_port: default_pac_port(),
            udp: default_udp(),
            dns_servers: default_dns_servers(),
            gfw_list_url: default_gfw_list_url(),
            gfw_list_refresh_hours: default_gfw_list_refresh_hours(),
            core_path: None,
            core_log_level: default_core_log_level(),
            latency_target: default_latency_target(),
            latency_timeout_ms: default_latency_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            network_services: vec![],
            network_check_urls: default_network_check_urls(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["debug", "info", "warning", "error", "none"];

impl AppSettings {
    pub fn latency_timeout(&self) -> Duration {
        Duration::from_millis(self.latency_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn pac_url(&self) -> String {
        format!("http://{}:{}/proxy.pac", self.local_host, self.pac_port)
    }

    /// 校验设置
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.local_host.trim().is_empty() {
            return Err(CompileError::invalid_field("localHost", "must not be empty"));
        }

        let ports = [
            ("localPort", self.local_port),
            ("probePort", self.probe_port),
            ("pacPort", self.pac_port),
        ];
        let mut seen = HashSet::new();
        for (field, port) in ports {
            if port == 0 {
                return Err(CompileError::invalid_field(field, "must not be 0"));
            }
            if !seen.insert(port) {
                return Err(CompileError::invalid_field(
                    field,
                    format!("port {} is already used by another listener", port),
                ));
            }
        }

        if !LOG_LEVELS.contains(&self.core_log_level.as_str()) {
            return Err(CompileError::invalid_field(
                "coreLogLevel",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        for (field, url) in [
            ("gfwListUrl", &self.gfw_list_url),
            ("latencyTarget", &self.latency_target),
        ] {
            validate_http_url(field, url)?;
        }
        for url in &self.network_check_urls {
            validate_http_url("networkCheckUrls", url)?;
        }

        for (field, value) in [
            ("latencyTimeoutMs", self.latency_timeout_ms),
            ("startupTimeoutMs", self.startup_timeout_ms),
            ("commandTimeoutMs", self.command_timeout_ms),
        ] {
            if value == 0 {
                return Err(CompileError::invalid_field(field, "must be greater than 0"));
            }
        }

        Ok(())
    }
}

pub(crate) fn validate_http_url(field: &str, url: &str) -> Result<(), CompileError> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| CompileError::invalid_field(field, format!("invalid url: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(CompileError::invalid_field(
            field,
            format!("unsupported scheme `{}`", other),
        )),
    }
}
