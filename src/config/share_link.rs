use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{json, Map, Value};

use super::Compiler;
use crate::error::CompileError;
use crate::models::{
    Network, ProtocolSettings, QuicSettings, ServerDescriptor, ShadowsocksSettings,
    StreamSettings, VmessSettings,
};

/// 宽松的 base64 解码：忽略空白，兼容标准/URL 安全字母表和有无填充
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .or_else(|_| URL_SAFE.decode(&cleaned))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&cleaned))
        .ok()
}

fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// 分享链接的解析与生成
pub struct ShareLink;

impl ShareLink {
    /// 解析 `vmess://` 或 `ss://` 链接，结果已通过字段校验
    pub fn parse(link: &str) -> Result<ServerDescriptor, CompileError> {
        let link = link.trim();
        let server = if let Some(payload) = link.strip_prefix("vmess://") {
            Self::parse_vmess(payload)?
        } else if let Some(payload) = link.strip_prefix("ss://") {
            Self::parse_shadowsocks(payload)?
        } else {
            let scheme = link.split("://").next().unwrap_or(link);
            return Err(CompileError::parse_failure(
                scheme,
                "unsupported share link scheme",
            ));
        };
        Compiler::validate(&server)?;
        Ok(server)
    }

    /// 生成分享链接
    pub fn to_link(server: &ServerDescriptor) -> String {
        match &server.protocol {
            ProtocolSettings::Vmess(vmess) => Self::vmess_link(server, vmess),
            ProtocolSettings::Shadowsocks(ss) => Self::shadowsocks_link(server, ss),
        }
    }

    fn parse_vmess(payload: &str) -> Result<ServerDescriptor, CompileError> {
        if payload.trim().is_empty() {
            return Err(CompileError::parse_failure("vmess://", "missing payload"));
        }
        let decoded = decode_base64_text(payload)
            .ok_or_else(|| CompileError::parse_failure(payload, "payload is not valid base64"))?;
        let object: Map<String, Value> = serde_json::from_str(&decoded)
            .map_err(|e| CompileError::parse_failure(&decoded, format!("invalid JSON: {}", e)))?;

        let field = |key: &str| -> String {
            match object.get(key) {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            }
        };

        let address = field("add");
        let port_text = field("port");
        let port: u16 = port_text
            .parse()
            .map_err(|_| CompileError::parse_failure(&port_text, "invalid vmess port"))?;
        let alter_text = field("aid");
        let alter_id: u16 = if alter_text.is_empty() {
            0
        } else {
            alter_text
                .parse()
                .map_err(|_| CompileError::parse_failure(&alter_text, "invalid alterId"))?
        };
        let security = Some(field("scy"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "auto".to_string());

        let net_text = field("net");
        let network = Network::parse(&net_text)
            .ok_or_else(|| CompileError::parse_failure(&net_text, "unknown transport"))?;

        let header = field("type");
        let host = field("host");
        let path = field("path");
        let mut stream = StreamSettings {
            network,
            tls: field("tls").eq_ignore_ascii_case("tls"),
            server_name: non_empty(field("sni")),
            header_type: non_empty(header).filter(|h| h != "none"),
            ..Default::default()
        };
        match network {
            Network::Quic => {
                stream.quic = Some(QuicSettings {
                    security: non_empty(host).unwrap_or_else(|| "none".to_string()),
                    key: path,
                });
            }
            Network::Grpc => stream.service_name = non_empty(path),
            Network::Kcp => {}
            _ => {
                stream.host = non_empty(host);
                stream.path = non_empty(path);
            }
        }

        let name = non_empty(field("ps")).unwrap_or_else(|| format!("{}:{}", address, port));
        let mut server = ServerDescriptor::new(
            name,
            address,
            port,
            ProtocolSettings::Vmess(VmessSettings {
                id: field("id"),
                alter_id,
                security,
            }),
        );
        server.stream = stream;
        Ok(server)
    }

    fn parse_shadowsocks(payload: &str) -> Result<ServerDescriptor, CompileError> {
        if payload.trim().is_empty() {
            return Err(CompileError::parse_failure("ss://", "missing payload"));
        }

        let (main, tag) = match payload.split_once('#') {
            Some((main, fragment)) => (
                main,
                urlencoding::decode(fragment)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| fragment.to_string()),
            ),
            None => (payload, String::new()),
        };

        let main = match main.split_once('?') {
            Some((before, query)) => {
                if query.split('&').any(|kv| kv.starts_with("plugin=")) {
                    return Err(CompileError::parse_failure(
                        query,
                        "shadowsocks plugins are not supported",
                    ));
                }
                before
            }
            None => main,
        };

        // SIP002: userinfo@host:port；旧格式: base64(method:password@host:port)
        let (credentials, host_port) = match main.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let userinfo = urlencoding::decode(userinfo)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| userinfo.to_string());
                let credentials = if userinfo.contains(':') {
                    userinfo
                } else {
                    decode_base64_text(&userinfo).ok_or_else(|| {
                        CompileError::parse_failure(&userinfo, "userinfo is not valid base64")
                    })?
                };
                (credentials, host_port.trim_end_matches('/').to_string())
            }
            None => {
                let decoded = decode_base64_text(main)
                    .ok_or_else(|| CompileError::parse_failure(main, "payload is not valid base64"))?;
                let (credentials, host_port) = decoded.rsplit_once('@').ok_or_else(|| {
                    CompileError::parse_failure(&decoded, "missing `@` between credentials and host")
                })?;
                (credentials.to_string(), host_port.to_string())
            }
        };

        let (method, password) = credentials.split_once(':').ok_or_else(|| {
            CompileError::parse_failure(&credentials, "expected `method:password`")
        })?;
        let (host, port) = split_host_port(&host_port)?;

        let name = non_empty(tag).unwrap_or_else(|| format!("{}:{}", host, port));
        Ok(ServerDescriptor::new(
            name,
            host,
            port,
            ProtocolSettings::Shadowsocks(ShadowsocksSettings {
                method: method.to_ascii_lowercase(),
                password: password.to_string(),
            }),
        ))
    }

    fn vmess_link(server: &ServerDescriptor, vmess: &VmessSettings) -> String {
        let stream = &server.stream;
        let (host, path) = match stream.network {
            Network::Quic => {
                let quic = stream.quic.clone().unwrap_or_default();
                (quic.security, quic.key)
            }
            Network::Grpc => (String::new(), stream.service_name.clone().unwrap_or_default()),
            _ => (
                stream.host.clone().unwrap_or_default(),
                stream.path.clone().unwrap_or_default(),
            ),
        };
        let tls = if stream.tls { "tls" } else { "" };
        let body = json!({
            "v": "2",
            "ps": server.name,
            "add": server.address,
            "port": server.port.to_string(),
            "id": vmess.id,
            "aid": vmess.alter_id.to_string(),
            "scy": vmess.security,
            "net": stream.network.as_str(),
            "type": stream.header_type.clone().unwrap_or_else(|| "none".to_string()),
            "host": host,
            "path": path,
            "tls": tls,
            "sni": stream.server_name.clone().unwrap_or_default(),
        });
        format!("vmess://{}", STANDARD.encode(body.to_string()))
    }

    fn shadowsocks_link(server: &ServerDescriptor, ss: &ShadowsocksSettings) -> String {
        let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", ss.method, ss.password));
        let host = if server.address.contains(':') && !server.address.starts_with('[') {
            format!("[{}]", server.address)
        } else {
            server.address.clone()
        };
        format!(
            "ss://{}@{}:{}#{}",
            userinfo,
            host,
            server.port,
            urlencoding::encode(&server.name)
        )
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn split_host_port(input: &str) -> Result<(String, u16), CompileError> {
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| CompileError::parse_failure(input, "expected `host:port`"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CompileError::parse_failure(port, "invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CompileError::parse_failure(input, "missing host"));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn vmess_link(body: Value) -> String {
        format!("vmess://{}", STANDARD.encode(body.to_string()))
    }

    #[test]
    fn test_parse_vmess_link() {
        let link = vmess_link(json!({
            "v": "2", "ps": "东京 01", "add": "jp.example.com", "port": 443,
            "id": UUID, "aid": "0", "net": "ws", "type": "none",
            "host": "cdn.example.com", "path": "/ray", "tls": "tls"
        }));
        let server = ShareLink::parse(&link).unwrap();
        assert_eq!(server.name, "东京 01");
        assert_eq!(server.address, "jp.example.com");
        assert_eq!(server.port, 443);
        assert_eq!(server.stream.network, Network::Ws);
        assert!(server.stream.tls);
        assert_eq!(server.stream.path.as_deref(), Some("/ray"));
        assert_eq!(server.stream.header_type, None);
        match server.protocol {
            ProtocolSettings::Vmess(v) => {
                assert_eq!(v.id, UUID);
                assert_eq!(v.security, "auto");
            }
            _ => panic!("expected vmess"),
        }
    }

    #[test]
    fn test_parse_shadowsocks_forms() {
        // SIP002
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:secret");
        let server = ShareLink::parse(&format!("ss://{}@1.2.3.4:8388#node-1", userinfo)).unwrap();
        assert_eq!(server.name, "node-1");
        assert_eq!(server.address, "1.2.3.4");
        assert_eq!(server.port, 8388);

        // 旧格式
        let legacy = STANDARD.encode("chacha20-ietf-poly1305:p@ss@5.6.7.8:443");
        let server = ShareLink::parse(&format!("ss://{}#%E9%A6%99%E6%B8%AF", legacy)).unwrap();
        assert_eq!(server.name, "香港");
        assert_eq!(server.address, "5.6.7.8");
        match &server.protocol {
            ProtocolSettings::Shadowsocks(ss) => assert_eq!(ss.password, "p@ss"),
            _ => panic!("expected shadowsocks"),
        }

        // 明文 userinfo，无名称
        let server = ShareLink::parse("ss://2022-blake3-aes-128-gcm:a%3Ab@[::1]:9000/").unwrap();
        assert_eq!(server.address, "::1");
        assert_eq!(server.name, "::1:9000");
    }

    #[test]
    fn test_parse_failures_carry_offending_input() {
        match ShareLink::parse("vmess://!!!notbase64").unwrap_err() {
            CompileError::ParseFailure { input, .. } => assert_eq!(input, "!!!notbase64"),
            other => panic!("unexpected {:?}", other),
        }
        match ShareLink::parse("trojan://pw@host:443").unwrap_err() {
            CompileError::ParseFailure { input, .. } => assert_eq!(input, "trojan"),
            other => panic!("unexpected {:?}", other),
        }
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:secret");
        match ShareLink::parse(&format!("ss://{}@1.2.3.4:99999", userinfo)).unwrap_err() {
            CompileError::ParseFailure { input, .. } => assert_eq!(input, "99999"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ShareLink::parse("ss://YWVzLTI1Ni1nY206c2VjcmV0@1.2.3.4:8388/?plugin=obfs-local").is_err());
    }

    #[test]
    fn test_parsed_link_is_validated() {
        let link = vmess_link(json!({"add": "h.com", "port": "443", "id": "not-a-uuid"}));
        assert!(matches!(
            ShareLink::parse(&link),
            Err(CompileError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_link_reparse_preserves_endpoint() {
        let links = [
            vmess_link(json!({
                "ps": "a", "add": "a.example.com", "port": "8443", "id": UUID, "aid": 4,
                "net": "grpc", "path": "svc", "tls": "tls", "sni": "sni.example.com"
            })),
            format!(
                "ss://{}@[2001:db8::1]:8388#v6%20node",
                URL_SAFE_NO_PAD.encode("aes-128-gcm:pw:with:colons")
            ),
        ];
        for link in links {
            let first = ShareLink::parse(&link).unwrap();
            let second = ShareLink::parse(&ShareLink::to_link(&first)).unwrap();
            assert_eq!(first.address, second.address);
            assert_eq!(first.port, second.port);
            assert_eq!(first.protocol, second.protocol);
            assert_eq!(first.name, second.name);
            assert_eq!(first.stream, second.stream);
        }
    }
}
