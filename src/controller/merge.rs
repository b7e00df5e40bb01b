use crate::models::ServerDescriptor;

/// 订阅合并结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MergeOutcome {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// 去掉重名时追加的 ` (n)` 后缀
fn base_name(name: &str) -> &str {
    let Some(stripped) = name.strip_suffix(')') else {
        return name;
    };
    match stripped.rsplit_once(" (") {
        Some((base, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

/// 返回不与 `servers` 中任何名称冲突的名称
pub(crate) fn unique_name(base: &str, servers: &[ServerDescriptor]) -> String {
    let taken = |name: &str| servers.iter().any(|s| s.name == name);
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{} ({})", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// 把订阅 `url` 的最新内容合并进 `servers`
///
/// - 该订阅中已不存在的条目删除
/// - 仍存在的原地更新，连接参数不变时保留测速结果
/// - 新条目追加到末尾，与其他来源重名时加 ` (n)` 后缀
/// - 手动添加的条目和其他订阅的条目不受影响
pub(crate) fn merge_subscription(
    servers: &mut Vec<ServerDescriptor>,
    url: &str,
    incoming: Vec<ServerDescriptor>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut claimed = vec![false; servers.len()];

    for server in incoming {
        let candidates = |exact: bool| {
            servers.iter().enumerate().position(|(i, s)| {
                !claimed[i]
                    && s.is_from_subscription(url)
                    && if exact {
                        s.name == server.name
                    } else {
                        base_name(&s.name) == server.name
                    }
            })
        };
        let existing = candidates(true).or_else(|| candidates(false));

        match existing {
            Some(index) => {
                let current = &mut servers[index];
                let latency = if current.same_endpoint(&server) {
                    current.latency.clone()
                } else {
                    None
                };
                let name = current.name.clone();
                let connected = current.connected;
                *current = ServerDescriptor {
                    name: name.clone(),
                    latency,
                    connected,
                    ..server
                };
                claimed[index] = true;
                outcome.updated.push(name);
            }
            None => {
                let name = unique_name(&server.name, servers);
                servers.push(ServerDescriptor {
                    name: name.clone(),
                    latency: None,
                    connected: false,
                    ..server
                });
                claimed.push(true);
                outcome.added.push(name);
            }
        }
    }

    let mut index = 0;
    servers.retain(|s| {
        let keep = !s.is_from_subscription(url) || claimed[index];
        index += 1;
        if !keep {
            outcome.removed.push(s.name.clone());
        }
        keep
    });

    outcome
}
