use serde_json::Value;

use super::subscription::{LineFailure, SubscriptionBatch};
use super::Compiler;
use crate::error::CompileError;
use crate::models::{
    KcpSettings, MuxSettings, Network, ProtocolSettings, QuicSettings, ServerDescriptor,
    ShadowsocksSettings, StreamSettings, VmessSettings,
};

/// 从 v2ray 配置文件导入服务器
///
/// 读取 `outbounds`（或旧版的 `outbound`）中的 vmess / shadowsocks 出站。
pub fn import_config_file(contents: &str) -> Result<SubscriptionBatch, CompileError> {
    let root: Value = serde_json::from_str(contents)
        .map_err(|e| CompileError::parse_failure(contents, format!("invalid JSON: {}", e)))?;

    let outbounds: Vec<&Value> = match (root.get("outbounds"), root.get("outbound")) {
        (Some(Value::Array(list)), _) => list.iter().collect(),
        (_, Some(single @ Value::Object(_))) => vec![single],
        _ => {
            return Err(CompileError::parse_failure(
                contents,
                "no `outbounds` array in config file",
            ))
        }
    };

    let mut batch = SubscriptionBatch::default();
    for (index, outbound) in outbounds.into_iter().enumerate() {
        let protocol = outbound.get("protocol").and_then(Value::as_str).unwrap_or("");
        let tag = outbound.get("tag").and_then(Value::as_str).unwrap_or("");
        let stream = outbound
            .get("streamSettings")
            .map(parse_stream_settings)
            .unwrap_or_default();
        let mux = parse_mux(outbound.get("mux"));

        let candidates = match protocol {
            "vmess" => vmess_servers(outbound),
            "shadowsocks" => shadowsocks_servers(outbound),
            "freedom" | "blackhole" | "dns" => continue,
            other => {
                batch.failures.push(LineFailure {
                    line: index + 1,
                    content: tag.to_string(),
                    reason: format!("unsupported outbound protocol `{}`", other),
                });
                continue;
            }
        };

        let multiple = candidates.len() > 1;
        for (n, (address, port, settings)) in candidates.into_iter().enumerate() {
            let name = match (tag.is_empty(), multiple) {
                (false, false) => tag.to_string(),
                (false, true) => format!("{}-{}", tag, n + 1),
                (true, _) => format!("{}:{}", address, port),
            };
            let mut server = ServerDescriptor::new(name, address, port, settings);
            server.stream = stream.clone();
            server.stream.mux = mux.clone();
            match Compiler::validate(&server) {
                Ok(()) => batch.servers.push(server),
                Err(e) => batch.failures.push(LineFailure {
                    line: index + 1,
                    content: server.name.clone(),
                    reason: e.to_string(),
                }),
            }
        }
    }

    Ok(batch)
}

fn str_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn port_field(value: &Value) -> u16 {
    str_field(value, "port").parse().unwrap_or(0)
}

fn vmess_servers(outbound: &Value) -> Vec<(String, u16, ProtocolSettings)> {
    let mut out = Vec::new();
    let vnext = outbound
        .pointer("/settings/vnext")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for node in &vnext {
        let users = node.get("users").and_then(Value::as_array).cloned().unwrap_or_default();
        for user in &users {
            let security = Some(str_field(user, "security"))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "auto".to_string());
            out.push((
                str_field(node, "address"),
                port_field(node),
                ProtocolSettings::Vmess(VmessSettings {
                    id: str_field(user, "id"),
                    alter_id: str_field(user, "alterId").parse().unwrap_or(0),
                    security,
                }),
            ));
        }
    }
    out
}

fn shadowsocks_servers(outbound: &Value) -> Vec<(String, u16, ProtocolSettings)> {
    outbound
        .pointer("/settings/servers")
        .and_then(Value::as_array)
        .map(|servers| {
            servers
                .iter()
                .map(|s| {
                    (
                        str_field(s, "address"),
                        port_field(s),
                        ProtocolSettings::Shadowsocks(ShadowsocksSettings {
                            method: str_field(s, "method"),
                            password: str_field(s, "password"),
                        }),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_mux(mux: Option<&Value>) -> MuxSettings {
    let Some(mux) = mux else {
        return MuxSettings::default();
    };
    MuxSettings {
        enabled: mux.get("enabled").and_then(Value::as_bool).unwrap_or(false),
        concurrency: mux
            .get("concurrency")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok()),
    }
}

/// 将 streamSettings JSON 还原为 StreamSettings
pub fn parse_stream_settings(value: &Value) -> StreamSettings {
    let network = Network::parse(&str_field(value, "network")).unwrap_or_default();
    let mut stream = StreamSettings {
        network,
        tls: str_field(value, "security") == "tls",
        ..Default::default()
    };

    if let Some(tls) = value.get("tlsSettings") {
        stream.server_name = Some(str_field(tls, "serverName")).filter(|s| !s.is_empty());
        stream.allow_insecure = tls
            .get("allowInsecure")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    }

    let header_type = |settings: &Value| -> Option<String> {
        settings
            .pointer("/header/type")
            .and_then(Value::as_str)
            .filter(|t| *t != "none")
            .map(str::to_string)
    };

    match network {
        Network::Tcp => {
            if let Some(tcp) = value.get("tcpSettings") {
                stream.header_type = header_type(tcp);
                if let Some(request) = tcp.pointer("/header/request") {
                    stream.path = request
                        .pointer("/path/0")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    stream.host = join_strings(request.pointer("/headers/Host"));
                }
            }
        }
        Network::Kcp => {
            if let Some(kcp) = value.get("kcpSettings") {
                let defaults = KcpSettings::default();
                let num = |key: &str, fallback: u32| {
                    kcp.get(key)
                        .and_then(Value::as_u64)
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(fallback)
                };
                stream.kcp = Some(KcpSettings {
                    mtu: u16::try_from(num("mtu", defaults.mtu as u32)).unwrap_or(defaults.mtu),
                    tti: u16::try_from(num("tti", defaults.tti as u32)).unwrap_or(defaults.tti),
                    uplink_capacity: num("uplinkCapacity", defaults.uplink_capacity),
                    downlink_capacity: num("downlinkCapacity", defaults.downlink_capacity),
                    congestion: kcp.get("congestion").and_then(Value::as_bool).unwrap_or(false),
                    read_buffer_size: num("readBufferSize", defaults.read_buffer_size),
                    write_buffer_size: num("writeBufferSize", defaults.write_buffer_size),
                    seed: kcp.get("seed").and_then(Value::as_str).map(str::to_string),
                });
                stream.header_type = header_type(kcp);
            }
        }
        Network::Ws => {
            if let Some(ws) = value.get("wsSettings") {
                stream.path = ws.get("path").and_then(Value::as_str).map(str::to_string);
                stream.host = ws
                    .pointer("/headers/Host")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        Network::Http => {
            if let Some(http) = value.get("httpSettings") {
                stream.path = http.get("path").and_then(Value::as_str).map(str::to_string);
                stream.host = join_strings(http.get("host"));
            }
        }
        Network::Quic => {
            if let Some(quic) = value.get("quicSettings") {
                stream.quic = Some(QuicSettings {
                    security: Some(str_field(quic, "security"))
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "none".to_string()),
                    key: str_field(quic, "key"),
                });
                stream.header_type = header_type(quic);
            }
        }
        Network::DomainSocket => {
            stream.path = value
                .pointer("/dsSettings/path")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Network::Grpc => {
            stream.service_name = value
                .pointer("/grpcSettings/serviceName")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }

    stream
}

fn join_strings(value: Option<&Value>) -> Option<String> {
    let list: Vec<&str> = value?.as_array()?.iter().filter_map(Value::as_str).collect();
    if list.is_empty() {
        None
    } else {
        Some(list.join(","))
    }
}
