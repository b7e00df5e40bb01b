use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};

use crate::error::CompileError;

/// v2ray 内核配置文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfigDocument {
    pub log: LogConfig,
    pub inbounds: Vec<InboundConfig>,
    pub outbounds: Vec<OutboundConfig>,
    pub routing: RoutingConfig,
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub loglevel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: String,
    pub settings: Value,
    #[serde(rename = "streamSettings", default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(rename = "domainStrategy")]
    pub domain_strategy: String,
    pub rules: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub servers: Vec<String>,
}

pub const PROXY_INBOUND_TAG: &str = "proxy-in";
pub const PROBE_INBOUND_TAG: &str = "probe-in";
pub const PROXY_OUTBOUND_TAG: &str = "proxy";
pub const DIRECT_OUTBOUND_TAG: &str = "direct";

impl CoreConfigDocument {
    pub fn inbound(&self, tag: &str) -> Option<&InboundConfig> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    pub fn outbound(&self, tag: &str) -> Option<&OutboundConfig> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    /// 本地代理监听地址，就绪检测连接这里
    pub fn primary_listener(&self) -> Option<SocketAddr> {
        let inbound = self.inbound(PROXY_INBOUND_TAG)?;
        let ip: IpAddr = inbound.listen.parse().ok()?;
        Some(SocketAddr::new(ip, inbound.port))
    }

    /// 结构性检查：入站、主出站、端口
    pub fn validate(&self) -> Result<(), CompileError> {
        let inbound = self
            .inbound(PROXY_INBOUND_TAG)
            .ok_or_else(|| CompileError::synthesis("missing local proxy inbound"))?;
        if inbound.port == 0 {
            return Err(CompileError::synthesis("local proxy inbound has port 0"));
        }
        if self.primary_listener().is_none() {
            return Err(CompileError::synthesis(format!(
                "local proxy inbound listens on `{}`, expected an IP address",
                inbound.listen
            )));
        }
        if self.outbound(PROXY_OUTBOUND_TAG).is_none() {
            return Err(CompileError::synthesis("missing proxy outbound"));
        }
        let mut ports: Vec<u16> = self.inbounds.iter().map(|i| i.port).collect();
        ports.sort_unstable();
        if ports.windows(2).any(|w| w[0] == w[1]) {
            return Err(CompileError::synthesis("two inbounds share one port"));
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, CompileError> {
        serde_json::to_string_pretty(self).map_err(|e| CompileError::synthesis(e.to_string()))
    }
}
