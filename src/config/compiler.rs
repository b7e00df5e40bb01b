use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::CompileError;
use crate::models::{
    AppSettings, CoreConfigDocument, DnsConfig, InboundConfig, LocalProtocol, LogConfig, Network,
    OutboundConfig, ProtocolSettings, RoutingConfig, ServerDescriptor, StreamSettings,
    DIRECT_OUTBOUND_TAG, PROBE_INBOUND_TAG, PROXY_INBOUND_TAG, PROXY_OUTBOUND_TAG,
};

static HOSTNAME_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?\.)*[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?\.?$")
        .ok()
});

pub const VMESS_SECURITIES: &[&str] = &["auto", "aes-128-gcm", "chacha20-poly1305", "none", "zero"];

pub const SHADOWSOCKS_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-poly1305",
    "chacha20-ietf-poly1305",
    "xchacha20-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "aes-128-cfb",
    "aes-256-cfb",
    "chacha20",
    "chacha20-ietf",
    "none",
    "plain",
];

const HEADER_TYPES: &[&str] = &["none", "srtp", "utp", "wechat-video", "dtls", "wireguard"];

/// tcp http 伪装使用的固定 UA 列表
const OBFS_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

const PROBE_REJECT_TAG: &str = "probe-reject";

/// 编译选项，由 AppSettings 派生
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    pub local_protocol: LocalProtocol,
    pub listen: String,
    pub port: u16,
    pub probe_port: Option<u16>,
    pub udp: bool,
    pub dns_servers: Vec<String>,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl CompileOptions {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            local_protocol: settings.local_protocol,
            listen: settings.local_host.clone(),
            port: settings.local_port,
            probe_port: Some(settings.probe_port),
            udp: settings.udp,
            dns_servers: settings.dns_servers.clone(),
            log_level: settings.core_log_level.clone(),
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

/// 服务器配置编译器
///
/// 纯函数：不做 I/O，不持有状态。
pub struct Compiler;

impl Compiler {
    /// 校验描述中必填字段与取值范围
    pub fn validate(server: &ServerDescriptor) -> Result<(), CompileError> {
        if server.name.trim().is_empty() {
            return Err(CompileError::invalid_field("name", "must not be empty"));
        }
        Self::validate_address(&server.address)?;
        if server.port == 0 {
            return Err(CompileError::invalid_field("port", "must not be 0"));
        }

        match &server.protocol {
            ProtocolSettings::Vmess(vmess) => {
                let id = vmess.id.trim();
                if id.is_empty() {
                    return Err(CompileError::invalid_field("id", "must not be empty"));
                }
                if uuid::Uuid::parse_str(id).is_err() {
                    return Err(CompileError::invalid_field(
                        "id",
                        format!("`{}` is not a valid UUID", id),
                    ));
                }
                if !VMESS_SECURITIES.contains(&vmess.security.as_str()) {
                    return Err(CompileError::invalid_field(
                        "security",
                        format!("unsupported vmess security `{}`", vmess.security),
                    ));
                }
            }
            ProtocolSettings::Shadowsocks(ss) => {
                if ss.method.trim().is_empty() {
                    return Err(CompileError::invalid_field("method", "must not be empty"));
                }
                if !SHADOWSOCKS_METHODS.contains(&ss.method.to_ascii_lowercase().as_str()) {
                    return Err(CompileError::invalid_field(
                        "method",
                        format!("unsupported shadowsocks method `{}`", ss.method),
                    ));
                }
                if ss.password.is_empty() {
                    return Err(CompileError::invalid_field("password", "must not be empty"));
                }
            }
        }

        Self::validate_stream(&server.stream)
    }

    fn validate_address(address: &str) -> Result<(), CompileError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(CompileError::invalid_field("address", "must not be empty"));
        }
        let bare = address.trim_start_matches('[').trim_end_matches(']');
        let is_hostname = HOSTNAME_RE
            .as_ref()
            .map_or(false, |re| re.is_match(address));
        if bare.parse::<IpAddr>().is_ok() || is_hostname {
            Ok(())
        } else {
            Err(CompileError::invalid_field(
                "address",
                format!("`{}` is neither a hostname nor an IP address", address),
            ))
        }
    }

    fn validate_stream(stream: &StreamSettings) -> Result<(), CompileError> {
        if let Some(path) = stream.path.as_deref() {
            let needs_slash = matches!(stream.network, Network::Ws | Network::Http | Network::Tcp);
            if needs_slash && !path.is_empty() && !path.starts_with('/') {
                return Err(CompileError::invalid_field(
                    "stream.path",
                    "must start with `/`",
                ));
            }
        }

        if let Some(header) = stream.header_type.as_deref() {
            let valid = match stream.network {
                Network::Tcp => matches!(header, "none" | "http"),
                Network::Kcp | Network::Quic => HEADER_TYPES.contains(&header),
                _ => true,
            };
            if !valid {
                return Err(CompileError::invalid_field(
                    "stream.headerType",
                    format!("`{}` is not valid for {}", header, stream.network.as_str()),
                ));
            }
        }

        if let Some(kcp) = &stream.kcp {
            if !(576..=1460).contains(&kcp.mtu) {
                return Err(CompileError::invalid_field(
                    "stream.kcp.mtu",
                    "must be between 576 and 1460",
                ));
            }
            if !(10..=100).contains(&kcp.tti) {
                return Err(CompileError::invalid_field(
                    "stream.kcp.tti",
                    "must be between 10 and 100",
                ));
            }
        }

        if stream.network == Network::DomainSocket
            && stream.path.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(CompileError::invalid_field(
                "stream.path",
                "domainsocket requires a socket path",
            ));
        }

        if stream.mux.enabled {
            if let Some(concurrency) = stream.mux.concurrency {
                if !(1..=1024).contains(&concurrency) {
                    return Err(CompileError::invalid_field(
                        "stream.mux.concurrency",
                        "must be between 1 and 1024",
                    ));
                }
            }
        }

        Ok(())
    }

    /// 编译单个服务器
    pub fn compile(
        server: &ServerDescriptor,
        options: &CompileOptions,
    ) -> Result<CoreConfigDocument, CompileError> {
        Self::compile_with_probes(server, &[], options)
    }

    /// 编译激活服务器，并为 `servers` 中的每个可用服务器生成测速出站
    ///
    /// 激活服务器必须合法；测速服务器不合法时只跳过，调用方通过
    /// 缺失的 `probe-<key>` 出站识别被跳过的服务器。
    pub fn compile_with_probes(
        active: &ServerDescriptor,
        servers: &[ServerDescriptor],
        options: &CompileOptions,
    ) -> Result<CoreConfigDocument, CompileError> {
        Self::validate(active)?;
        if options.port == 0 {
            return Err(CompileError::invalid_field("localPort", "must not be 0"));
        }

        let mut inbounds = vec![Self::local_inbound(options)];
        let mut outbounds = vec![Self::outbound(active, PROXY_OUTBOUND_TAG)];
        outbounds.push(OutboundConfig {
            tag: DIRECT_OUTBOUND_TAG.to_string(),
            protocol: "freedom".to_string(),
            settings: json!({}),
            stream_settings: None,
            mux: None,
        });

        let mut rules = Vec::new();

        if let Some(probe_port) = options.probe_port {
            let mut accounts = Vec::new();
            for server in servers {
                if Self::validate(server).is_err() {
                    continue;
                }
                let key = Self::probe_key(&server.name);
                if accounts.iter().any(|a: &Value| a["user"] == key.as_str()) {
                    continue;
                }
                let tag = format!("probe-{}", key);
                outbounds.push(Self::outbound(server, &tag));
                rules.push(json!({
                    "type": "field",
                    "inboundTag": [PROBE_INBOUND_TAG],
                    "user": [key.clone()],
                    "outboundTag": tag,
                }));
                accounts.push(json!({ "user": key.clone(), "pass": key }));
            }

            if !accounts.is_empty() {
                inbounds.push(InboundConfig {
                    tag: PROBE_INBOUND_TAG.to_string(),
                    listen: options.listen.clone(),
                    port: probe_port,
                    protocol: "socks".to_string(),
                    settings: json!({
                        "auth": "password",
                        "accounts": accounts,
                        "udp": false,
                    }),
                    sniffing: None,
                });
                outbounds.push(OutboundConfig {
                    tag: PROBE_REJECT_TAG.to_string(),
                    protocol: "blackhole".to_string(),
                    settings: json!({}),
                    stream_settings: None,
                    mux: None,
                });
                // 未匹配账号的测速流量直接丢弃，避免走默认出站
                rules.push(json!({
                    "type": "field",
                    "inboundTag": [PROBE_INBOUND_TAG],
                    "outboundTag": PROBE_REJECT_TAG,
                }));
            }
        }

        rules.push(json!({
            "type": "field",
            "ip": ["geoip:private"],
            "outboundTag": DIRECT_OUTBOUND_TAG,
        }));

        let dns_servers = if options.dns_servers.is_empty() {
            vec!["localhost".to_string()]
        } else {
            options.dns_servers.clone()
        };

        let log = LogConfig {
            loglevel: options.log_level.clone(),
            access: options
                .log_dir
                .as_ref()
                .map(|dir| dir.join("access.log").to_string_lossy().to_string()),
            error: options
                .log_dir
                .as_ref()
                .map(|dir| dir.join("error.log").to_string_lossy().to_string()),
        };

        let document = CoreConfigDocument {
            log,
            inbounds,
            outbounds,
            routing: RoutingConfig {
                domain_strategy: "IPIfNonMatch".to_string(),
                rules,
            },
            dns: DnsConfig {
                servers: dns_servers,
            },
        };
        document.validate()?;
        Ok(document)
    }

    /// 服务器名到测速账号的稳定映射
    pub fn probe_key(name: &str) -> String {
        let digest = Sha256::digest(name.as_bytes());
        let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        format!("p{}", hex)
    }

    fn local_inbound(options: &CompileOptions) -> InboundConfig {
        let (protocol, settings) = match options.local_protocol {
            LocalProtocol::Socks => (
                "socks",
                json!({ "auth": "noauth", "udp": options.udp, "ip": options.listen }),
            ),
            LocalProtocol::Http => ("http", json!({ "timeout": 300, "allowTransparent": false })),
        };
        InboundConfig {
            tag: PROXY_INBOUND_TAG.to_string(),
            listen: options.listen.clone(),
            port: options.port,
            protocol: protocol.to_string(),
            settings,
            sniffing: Some(json!({ "enabled": true, "destOverride": ["http", "tls"] })),
        }
    }

    fn outbound(server: &ServerDescriptor, tag: &str) -> OutboundConfig {
        let settings = match &server.protocol {
            ProtocolSettings::Vmess(vmess) => json!({
                "vnext": [{
                    "address": server.address.trim(),
                    "port": server.port,
                    "users": [{
                        "id": vmess.id.trim(),
                        "alterId": vmess.alter_id,
                        "security": vmess.security,
                        "level": 0,
                    }],
                }],
            }),
            ProtocolSettings::Shadowsocks(ss) => json!({
                "servers": [{
                    "address": server.address.trim(),
                    "port": server.port,
                    "method": ss.method.to_ascii_lowercase(),
                    "password": ss.password,
                    "level": 0,
                }],
            }),
        };

        let mux = server.stream.mux.enabled.then(|| {
            json!({
                "enabled": true,
                "concurrency": server.stream.mux.concurrency.unwrap_or(8),
            })
        });

        OutboundConfig {
            tag: tag.to_string(),
            protocol: server.protocol.name().to_string(),
            settings,
            stream_settings: Some(Self::stream_settings(server)),
            mux,
        }
    }

    /// 生成 streamSettings，缺省字段填默认值
    pub fn stream_settings(server: &ServerDescriptor) -> Value {
        let stream = &server.stream;
        let security = if stream.tls { "tls" } else { "none" };
        let mut settings = json!({
            "network": stream.network.as_str(),
            "security": security,
        });

        let hosts = split_hosts(stream.host.as_deref());

        if stream.tls {
            let server_name = stream
                .server_name
                .clone()
                .filter(|s| !s.trim().is_empty())
                .or_else(|| hosts.first().cloned())
                .unwrap_or_else(|| server.address.trim().to_string());
            settings["tlsSettings"] = json!({
                "serverName": server_name,
                "allowInsecure": stream.allow_insecure,
            });
        }

        let path = stream
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        match stream.network {
            Network::Tcp => {
                settings["tcpSettings"] = Self::tcp_settings(stream, &hosts, &path);
            }
            Network::Kcp => {
                let kcp = stream.kcp.clone().unwrap_or_default();
                let mut kcp_settings = json!({
                    "mtu": kcp.mtu,
                    "tti": kcp.tti,
                    "uplinkCapacity": kcp.uplink_capacity,
                    "downlinkCapacity": kcp.downlink_capacity,
                    "congestion": kcp.congestion,
                    "readBufferSize": kcp.read_buffer_size,
                    "writeBufferSize": kcp.write_buffer_size,
                    "header": { "type": stream.header_type.as_deref().unwrap_or("none") },
                });
                if let Some(seed) = kcp.seed.filter(|s| !s.is_empty()) {
                    kcp_settings["seed"] = json!(seed);
                }
                settings["kcpSettings"] = kcp_settings;
            }
            Network::Ws => {
                let mut ws = json!({ "path": path });
                if let Some(host) = hosts.first() {
                    ws["headers"] = json!({ "Host": host });
                }
                settings["wsSettings"] = ws;
            }
            Network::Http => {
                let mut http = json!({ "path": path });
                if !hosts.is_empty() {
                    http["host"] = json!(hosts);
                }
                settings["httpSettings"] = http;
            }
            Network::Quic => {
                let quic = stream.quic.clone().unwrap_or_default();
                settings["quicSettings"] = json!({
                    "security": quic.security,
                    "key": quic.key,
                    "header": { "type": stream.header_type.as_deref().unwrap_or("none") },
                });
            }
            Network::DomainSocket => {
                settings["dsSettings"] = json!({ "path": stream.path.clone().unwrap_or_default() });
            }
            Network::Grpc => {
                settings["grpcSettings"] = json!({
                    "serviceName": stream.service_name.clone().unwrap_or_default(),
                });
            }
        }

        settings
    }

    fn tcp_settings(stream: &StreamSettings, hosts: &[String], path: &str) -> Value {
        if stream.header_type.as_deref() != Some("http") {
            return json!({ "header": { "type": "none" } });
        }
        json!({
            "header": {
                "type": "http",
                "request": {
                    "version": "1.1",
                    "method": "GET",
                    "path": [path],
                    "headers": {
                        "Host": hosts,
                        "User-Agent": OBFS_USER_AGENTS,
                        "Accept-Encoding": ["gzip, deflate"],
                        "Connection": ["keep-alive"],
                        "Pragma": "no-cache",
                    },
                },
            },
        })
    }
}

fn split_hosts(host: Option<&str>) -> Vec<String> {
    host.map(|h| {
        h.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KcpSettings, ShadowsocksSettings, VmessSettings};

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn ss_server() -> ServerDescriptor {
        ServerDescriptor::new(
            "node-1",
            "1.2.3.4",
            8388,
            ProtocolSettings::Shadowsocks(ShadowsocksSettings {
                method: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            }),
        )
    }

    fn vmess_server() -> ServerDescriptor {
        let mut server = ServerDescriptor::new(
            "vmess-ws",
            "v.example.com",
            443,
            ProtocolSettings::Vmess(VmessSettings::new(UUID)),
        );
        server.stream.network = Network::Ws;
        server.stream.tls = true;
        server.stream.host = Some("cdn.example.com".to_string());
        server
    }

    fn field_of(err: CompileError) -> String {
        match err {
            CompileError::InvalidField { field, .. } => field,
            other => panic!("expected InvalidField, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_required_fields_are_rejected() {
        let options = CompileOptions::default();

        let mut server = ss_server();
        server.address = "  ".to_string();
        assert_eq!(field_of(Compiler::compile(&server, &options).unwrap_err()), "address");

        let mut server = ss_server();
        server.name = String::new();
        assert_eq!(field_of(Compiler::compile(&server, &options).unwrap_err()), "name");

        let mut server = ss_server();
        server.port = 0;
        assert_eq!(field_of(Compiler::compile(&server, &options).unwrap_err()), "port");

        let mut server = ss_server();
        server.protocol = ProtocolSettings::Shadowsocks(ShadowsocksSettings {
            method: "aes-256-gcm".to_string(),
            password: String::new(),
        });
        assert_eq!(field_of(Compiler::compile(&server, &options).unwrap_err()), "password");

        let mut server = vmess_server();
        server.protocol = ProtocolSettings::Vmess(VmessSettings::new(""));
        assert_eq!(field_of(Compiler::compile(&server, &options).unwrap_err()), "id");
    }

    #[test]
    fn test_rejects_malformed_values() {
        let mut server = vmess_server();
        server.protocol = ProtocolSettings::Vmess(VmessSettings::new("not-a-uuid"));
        assert_eq!(field_of(Compiler::validate(&server).unwrap_err()), "id");

        let mut server = ss_server();
        server.protocol = ProtocolSettings::Shadowsocks(ShadowsocksSettings {
            method: "rot13".to_string(),
            password: "x".to_string(),
        });
        assert_eq!(field_of(Compiler::validate(&server).unwrap_err()), "method");

        let mut server = vmess_server();
        server.stream.path = Some("ws".to_string());
        assert_eq!(field_of(Compiler::validate(&server).unwrap_err()), "stream.path");

        let mut server = vmess_server();
        server.stream.network = Network::Kcp;
        server.stream.kcp = Some(KcpSettings {
            mtu: 9000,
            ..Default::default()
        });
        assert_eq!(field_of(Compiler::validate(&server).unwrap_err()), "stream.kcp.mtu");

        let mut server = ss_server();
        server.address = "bad host name".to_string();
        assert_eq!(field_of(Compiler::validate(&server).unwrap_err()), "address");
    }

    #[test]
    fn test_compile_shadowsocks_document() {
        let doc = Compiler::compile(&ss_server(), &CompileOptions::default()).unwrap();

        let inbound = doc.inbound(PROXY_INBOUND_TAG).unwrap();
        assert_eq!(inbound.protocol, "socks");
        assert_eq!(inbound.port, 1080);
        assert_eq!(doc.primary_listener().unwrap().to_string(), "127.0.0.1:1080");

        let proxy = doc.outbound(PROXY_OUTBOUND_TAG).unwrap();
        assert_eq!(proxy.protocol, "shadowsocks");
        assert_eq!(proxy.settings["servers"][0]["address"], "1.2.3.4");
        assert_eq!(proxy.settings["servers"][0]["port"], 8388);
        assert_eq!(proxy.settings["servers"][0]["method"], "aes-256-gcm");
        assert!(proxy.mux.is_none());
        assert!(doc.outbound(DIRECT_OUTBOUND_TAG).is_some());
        assert_eq!(doc.dns.servers, vec!["8.8.8.8", "8.8.4.4"]);
        // 没有测速服务器时不生成测速入站
        assert!(doc.inbound(PROBE_INBOUND_TAG).is_none());
    }

    #[test]
    fn test_compile_vmess_ws_tls_defaults() {
        let mut server = vmess_server();
        server.stream.mux.enabled = true;
        let doc = Compiler::compile(&server, &CompileOptions::default()).unwrap();
        let proxy = doc.outbound(PROXY_OUTBOUND_TAG).unwrap();
        let user = &proxy.settings["vnext"][0]["users"][0];
        assert_eq!(user["id"], UUID);
        assert_eq!(user["alterId"], 0);
        assert_eq!(user["security"], "auto");

        let stream = proxy.stream_settings.as_ref().unwrap();
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["security"], "tls");
        assert_eq!(stream["tlsSettings"]["serverName"], "cdn.example.com");
        assert_eq!(stream["wsSettings"]["path"], "/");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(proxy.mux.as_ref().unwrap()["concurrency"], 8);
    }

    #[test]
    fn test_tcp_http_obfuscation_and_kcp_defaults() {
        let mut server = vmess_server();
        server.stream = StreamSettings {
            network: Network::Tcp,
            header_type: Some("http".to_string()),
            host: Some("a.com, b.com".to_string()),
            ..Default::default()
        };
        let stream = Compiler::stream_settings(&server);
        let request = &stream["tcpSettings"]["header"]["request"];
        assert_eq!(request["headers"]["Host"], json!(["a.com", "b.com"]));
        assert_eq!(request["path"], json!(["/"]));
        assert_eq!(request["headers"]["User-Agent"].as_array().unwrap().len(), 2);

        server.stream = StreamSettings {
            network: Network::Kcp,
            ..Default::default()
        };
        let stream = Compiler::stream_settings(&server);
        assert_eq!(stream["kcpSettings"]["mtu"], 1350);
        assert_eq!(stream["kcpSettings"]["tti"], 50);
        assert_eq!(stream["kcpSettings"]["uplinkCapacity"], 5);
        assert_eq!(stream["kcpSettings"]["downlinkCapacity"], 20);
        assert_eq!(stream["kcpSettings"]["header"]["type"], "none");
    }

    #[test]
    fn test_http_local_inbound() {
        let options = CompileOptions {
            local_protocol: LocalProtocol::Http,
            port: 1087,
            ..Default::default()
        };
        let doc = Compiler::compile(&ss_server(), &options).unwrap();
        let inbound = doc.inbound(PROXY_INBOUND_TAG).unwrap();
        assert_eq!(inbound.protocol, "http");
        assert_eq!(inbound.port, 1087);
    }

    #[test]
    fn test_probe_outbounds_and_routing() {
        let mut broken = ss_server();
        broken.name = "broken".to_string();
        broken.port = 0;
        let servers = vec![ss_server(), vmess_server(), broken];

        let doc =
            Compiler::compile_with_probes(&servers[0], &servers, &CompileOptions::default())
                .unwrap();

        let probe = doc.inbound(PROBE_INBOUND_TAG).unwrap();
        assert_eq!(probe.port, 1086);
        assert_eq!(probe.settings["accounts"].as_array().unwrap().len(), 2);

        let key = Compiler::probe_key("vmess-ws");
        let tag = format!("probe-{}", key);
        assert_eq!(doc.outbound(&tag).unwrap().protocol, "vmess");
        assert!(doc
            .routing
            .rules
            .iter()
            .any(|r| r["user"] == json!([key.clone()]) && r["outboundTag"] == tag.as_str()));
        assert!(doc.outbound(&format!("probe-{}", Compiler::probe_key("broken"))).is_none());
        // 默认出站仍是激活服务器
        assert_eq!(doc.outbounds[0].tag, PROXY_OUTBOUND_TAG);
    }

    #[test]
    fn test_probe_key_is_stable() {
        assert_eq!(Compiler::probe_key("node-1"), Compiler::probe_key("node-1"));
        assert_ne!(Compiler::probe_key("node-1"), Compiler::probe_key("node-2"));
        assert_eq!(Compiler::probe_key("node-1").len(), 17);
    }

    #[test]
    fn test_log_paths_from_log_dir() {
        let options = CompileOptions::default().with_log_dir(PathBuf::from("/tmp/v2ray-logs"));
        let doc = Compiler::compile(&ss_server(), &options).unwrap();
        assert!(doc.log.access.as_deref().unwrap().ends_with("access.log"));
        assert!(doc.log.error.as_deref().unwrap().ends_with("error.log"));
    }
}
