use serde::Serialize;

use super::share_link::decode_base64;
use super::ShareLink;
use crate::models::{ServerDescriptor, ServerOrigin};

/// 单行解析失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineFailure {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

/// 一次订阅（或批量链接）解析的结果
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBatch {
    pub servers: Vec<ServerDescriptor>,
    pub failures: Vec<LineFailure>,
}

/// 解析订阅内容
///
/// 内容可以是 base64 编码的链接列表，也可以是明文链接列表。
/// 每行独立解析，失败的行记录到 `failures` 中，不影响其它行。
pub fn parse_subscription(payload: &str, origin: &ServerOrigin) -> SubscriptionBatch {
    let text = decode_payload(payload);
    let mut batch = SubscriptionBatch::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match ShareLink::parse(line) {
            Ok(mut server) => {
                server.origin = origin.clone();
                batch.servers.push(server);
            }
            Err(e) => {
                log::debug!("Skipping subscription line {}: {}", index + 1, e);
                batch.failures.push(LineFailure {
                    line: index + 1,
                    content: line.chars().take(120).collect(),
                    reason: e.to_string(),
                });
            }
        }
    }

    batch
}

fn decode_payload(payload: &str) -> String {
    let trimmed = payload.trim();
    if trimmed.contains("://") {
        return trimmed.to_string();
    }
    match decode_base64(trimmed).and_then(|bytes| String::from_utf8(bytes).ok()) {
        Some(decoded) if decoded.contains("://") => decoded,
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    fn ss(name: &str, host: &str) -> String {
        format!(
            "ss://{}@{}:8388#{}",
            URL_SAFE_NO_PAD.encode("aes-256-gcm:pw"),
            host,
            name
        )
    }

    #[test]
    fn test_base64_payload_with_bad_lines() {
        let plain = format!(
            "{}\n\nvmess://%%%\n{}\r\nhttp://not-a-proxy\n",
            ss("a", "1.1.1.1"),
            ss("b", "2.2.2.2")
        );
        let payload = STANDARD.encode(plain);
        let origin = ServerOrigin::Subscription {
            url: "https://sub.example.com".to_string(),
        };

        let batch = parse_subscription(&payload, &origin);
        assert_eq!(batch.servers.len(), 2);
        assert_eq!(batch.servers[0].name, "a");
        assert_eq!(batch.servers[1].name, "b");
        assert!(batch.servers.iter().all(|s| s.origin == origin));

        assert_eq!(batch.failures.len(), 2);
        assert_eq!(batch.failures[0].line, 3);
        assert_eq!(batch.failures[1].line, 5);
    }

    #[test]
    fn test_plain_payload() {
        let payload = format!("{}\n{}", ss("x", "3.3.3.3"), ss("y", "4.4.4.4"));
        let batch = parse_subscription(&payload, &ServerOrigin::Manual);
        assert_eq!(batch.servers.len(), 2);
        assert!(batch.failures.is_empty());
    }

    #[test]
    fn test_garbage_payload_reports_failure() {
        let batch = parse_subscription("definitely not a subscription", &ServerOrigin::Manual);
        assert!(batch.servers.is_empty());
        assert_eq!(batch.failures.len(), 1);
    }
}
