use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CompileError;

/// 代理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Off,
    /// 系统代理指向本地监听端口
    Global,
    /// 系统代理指向本地 PAC 地址
    Pac,
    /// 只运行内核，不修改系统代理（按应用手动配置）
    Manual,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Global => "global",
            Self::Pac => "pac",
            Self::Manual => "manual",
        }
    }

    pub fn needs_core(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "none" => Ok(Self::Off),
            "global" => Ok(Self::Global),
            "pac" => Ok(Self::Pac),
            "manual" => Ok(Self::Manual),
            other => Err(CompileError::invalid_field(
                "mode",
                format!("unknown proxy mode `{}`", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemProxyType {
    #[default]
    Disabled,
    PacProxy,
    HttpProxy,
    SocksProxy,
}

/// 操作系统当前的代理设置
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProxyState {
    pub proxy_type: SystemProxyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl SystemProxyState {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn pac(url: impl Into<String>) -> Self {
        Self {
            proxy_type: SystemProxyType::PacProxy,
            url: Some(url.into()),
            host: None,
            port: None,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type: SystemProxyType::HttpProxy,
            url: None,
            host: Some(host.into()),
            port: Some(port),
        }
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type: SystemProxyType::SocksProxy,
            url: None,
            host: Some(host.into()),
            port: Some(port),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.proxy_type == SystemProxyType::Disabled
    }

    /// 返回 host:port，仅对 HTTP/SOCKS 有意义
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) if !host.is_empty() && port > 0 => Some((host.as_str(), port)),
            _ => None,
        }
    }
}

impl fmt::Display for SystemProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy_type {
            SystemProxyType::Disabled => f.write_str("disabled"),
            SystemProxyType::PacProxy => {
                write!(f, "pac {}", self.url.as_deref().unwrap_or_default())
            }
            SystemProxyType::HttpProxy | SystemProxyType::SocksProxy => {
                let kind = if self.proxy_type == SystemProxyType::HttpProxy {
                    "http"
                } else {
                    "socks"
                };
                write!(
                    f,
                    "{} {}:{}",
                    kind,
                    self.host.as_deref().unwrap_or_default(),
                    self.port.unwrap_or_default()
                )
            }
        }
    }
}

/// 内核进程状态
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "camelCase")]
pub enum ProcessStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    CrashedWithError(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// 内核状态快照
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatus {
    pub state: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

impl CoreStatus {
    pub fn uptime(&self) -> Option<Duration> {
        let started = chrono::DateTime::parse_from_rfc3339(self.started_at.as_deref()?).ok()?;
        let elapsed = chrono::Local::now().signed_duration_since(started);
        elapsed.to_std().ok()
    }
}

/// 单个服务器的测速结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum LatencyOutcome {
    Reachable { millis: u64 },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyResult {
    pub name: String,
    pub outcome: LatencyOutcome,
}

/// 单个检测地址的可达性
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reachability {
    pub url: String,
    pub accessible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 网络连通性检测结果；`proxy` 为检测时使用的本地代理，直连时为 None
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub proxy: Option<String>,
    pub checks: Vec<Reachability>,
}

impl NetworkStatus {
    pub fn is_accessible(&self, url: &str) -> bool {
        self.checks.iter().any(|c| c.url == url && c.accessible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_mode_from_str() {
        assert_eq!("Global".parse::<ProxyMode>().unwrap(), ProxyMode::Global);
        assert_eq!("".parse::<ProxyMode>().unwrap(), ProxyMode::Off);
        assert!("tunnel".parse::<ProxyMode>().is_err());
    }

    #[test]
    fn test_system_proxy_display() {
        assert_eq!(SystemProxyState::disabled().to_string(), "disabled");
        assert_eq!(
            SystemProxyState::socks("127.0.0.1", 1080).to_string(),
            "socks 127.0.0.1:1080"
        );
        assert_eq!(
            SystemProxyState::pac("http://127.0.0.1:1085/proxy.pac").to_string(),
            "pac http://127.0.0.1:1085/proxy.pac"
        );
    }

    #[test]
    fn test_core_status_uptime() {
        let started = chrono::Local::now() - chrono::Duration::seconds(5);
        let status = CoreStatus {
            state: ProcessStatus::Running,
            started_at: Some(started.to_rfc3339()),
            ..Default::default()
        };
        let uptime = status.uptime().unwrap();
        assert!(uptime >= Duration::from_secs(4));
        assert!(CoreStatus::default().uptime().is_none());
    }
}
