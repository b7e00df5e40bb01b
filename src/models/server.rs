use serde::{Deserialize, Serialize};

use super::LatencyOutcome;

/// 一个远程代理服务器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// 唯一名称
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub origin: ServerOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyRecord>,
    /// 是否为当前激活的服务器，由控制器根据激活名称维护
    #[serde(default)]
    pub connected: bool,
}

impl ServerDescriptor {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        protocol: ProtocolSettings,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            protocol,
            stream: StreamSettings::default(),
            origin: ServerOrigin::Manual,
            latency: None,
            connected: false,
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    /// 比较连接相关字段（忽略名称、来源、延迟等元数据）
    pub fn same_endpoint(&self, other: &ServerDescriptor) -> bool {
        self.address == other.address
            && self.port == other.port
            && self.protocol == other.protocol
            && self.stream == other.stream
    }

    pub fn is_from_subscription(&self, url: &str) -> bool {
        matches!(&self.origin, ServerOrigin::Subscription { url: u } if u == url)
    }
}

/// 协议相关设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolSettings {
    Vmess(VmessSettings),
    Shadowsocks(ShadowsocksSettings),
}

impl ProtocolSettings {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Vmess(_) => "vmess",
            Self::Shadowsocks(_) => "shadowsocks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmessSettings {
    pub id: String,
    #[serde(default)]
    pub alter_id: u16,
    #[serde(default = "default_vmess_security")]
    pub security: String,
}

impl VmessSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alter_id: 0,
            security: default_vmess_security(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksSettings {
    pub method: String,
    pub password: String,
}

/// 传输层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Kcp,
    Ws,
    Http,
    Quic,
    #[serde(rename = "domainsocket")]
    DomainSocket,
    Grpc,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Kcp => "kcp",
            Self::Ws => "ws",
            Self::Http => "http",
            Self::Quic => "quic",
            Self::DomainSocket => "domainsocket",
            Self::Grpc => "grpc",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Some(Self::Tcp),
            "kcp" | "mkcp" => Some(Self::Kcp),
            "ws" | "websocket" => Some(Self::Ws),
            "http" | "h2" => Some(Self::Http),
            "quic" => Some(Self::Quic),
            "domainsocket" | "ds" => Some(Self::DomainSocket),
            "grpc" | "gun" => Some(Self::Grpc),
            _ => None,
        }
    }
}

/// 传输层设置，可选字段缺省时由编译器补默认值
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    /// tcp: none/http；kcp/quic: none/srtp/utp/wechat-video/dtls/wireguard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_type: Option<String>,
    /// ws/http/tcp-http 的 Host，多个值用逗号分隔
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// ws/http/tcp-http 路径，或 domainsocket 的套接字路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kcp: Option<KcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic: Option<QuicSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub mux: MuxSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KcpSettings {
    #[serde(default = "default_kcp_mtu")]
    pub mtu: u16,
    #[serde(default = "default_kcp_tti")]
    pub tti: u16,
    #[serde(default = "default_kcp_uplink")]
    pub uplink_capacity: u32,
    #[serde(default = "default_kcp_downlink")]
    pub downlink_capacity: u32,
    #[serde(default)]
    pub congestion: bool,
    #[serde(default = "default_kcp_buffer")]
    pub read_buffer_size: u32,
    #[serde(default = "default_kcp_buffer")]
    pub write_buffer_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: default_kcp_mtu(),
            tti: default_kcp_tti(),
            uplink_capacity: default_kcp_uplink(),
            downlink_capacity: default_kcp_downlink(),
            congestion: false,
            read_buffer_size: default_kcp_buffer(),
            write_buffer_size: default_kcp_buffer(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuicSettings {
    #[serde(default = "default_quic_security")]
    pub security: String,
    #[serde(default)]
    pub key: String,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            security: default_quic_security(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MuxSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u16>,
}

/// 服务器来源
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerOrigin {
    #[default]
    Manual,
    Subscription { url: String },
}

/// 最近一次测速结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyRecord {
    pub outcome: LatencyOutcome,
    pub measured_at: String,
}

fn default_vmess_security() -> String {
    "auto".to_string()
}

fn default_kcp_mtu() -> u16 {
    1350
}

fn default_kcp_tti() -> u16 {
    50
}

fn default_kcp_uplink() -> u32 {
    5
}

fn default_kcp_downlink() -> u32 {
    20
}

fn default_kcp_buffer() -> u32 {
    2
}

fn default_quic_security() -> String {
    "none".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_json_shape() {
        let server = ServerDescriptor::new(
            "node-1",
            "1.2.3.4",
            8388,
            ProtocolSettings::Shadowsocks(ShadowsocksSettings {
                method: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            }),
        );
        let value = serde_json::to_value(&server).unwrap();
        assert_eq!(value["protocol"], "shadowsocks");
        assert_eq!(value["method"], "aes-256-gcm");
        assert_eq!(value["origin"]["kind"], "manual");
        assert!(value.get("latency").is_none());

        let back: ServerDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, server);
    }

    #[test]
    fn test_vmess_defaults_on_deserialize() {
        let json = r#"{"name":"v","address":"a.com","port":443,"protocol":"vmess","id":"x"}"#;
        let server: ServerDescriptor = serde_json::from_str(json).unwrap();
        match server.protocol {
            ProtocolSettings::Vmess(v) => {
                assert_eq!(v.alter_id, 0);
                assert_eq!(v.security, "auto");
            }
            _ => panic!("expected vmess"),
        }
        assert_eq!(server.stream.network, Network::Tcp);
    }

    #[test]
    fn test_network_parse_aliases() {
        assert_eq!(Network::parse("websocket"), Some(Network::Ws));
        assert_eq!(Network::parse("h2"), Some(Network::Http));
        assert_eq!(Network::parse(""), Some(Network::Tcp));
        assert_eq!(Network::parse("carrier-pigeon"), None);
    }

    #[test]
    fn test_same_endpoint_ignores_metadata() {
        let a = ServerDescriptor::new(
            "a",
            "h",
            1,
            ProtocolSettings::Vmess(VmessSettings::new("id")),
        );
        let mut b = a.clone();
        b.name = "b".to_string();
        b.connected = true;
        b.origin = ServerOrigin::Subscription {
            url: "https://s".to_string(),
        };
        assert!(a.same_endpoint(&b));
        b.port = 2;
        assert!(!a.same_endpoint(&b));
    }
}
