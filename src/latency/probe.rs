use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::Compiler;
use crate::models::{LatencyOutcome, LatencyResult};

/// 一次往返测量
pub trait LatencyTransport: Send + Sync {
    /// 通过 `proxy` 请求 `target`，返回耗时
    fn round_trip(&self, proxy: &str, target: &str, timeout: Duration)
        -> BoxFuture<'static, Result<Duration>>;
}

/// reqwest 实现：经内核测速入站发起 HTTP 请求
pub struct HttpTransport;

impl LatencyTransport for HttpTransport {
    fn round_trip(
        &self,
        proxy: &str,
        target: &str,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Duration>> {
        let client = reqwest::Proxy::all(proxy).and_then(|proxy| {
            reqwest::Client::builder()
                .proxy(proxy)
                .timeout(timeout)
                .redirect(reqwest::redirect::Policy::none())
                .build()
        });
        let target = target.to_string();
        async move {
            let client = client?;
            let started = Instant::now();
            let response = client.get(&target).send().await?;
            let elapsed = started.elapsed();
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                Ok(elapsed)
            } else {
                Err(anyhow!("HTTP {}", status))
            }
        }
        .boxed()
    }
}

/// 待测服务器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: String,
    /// 为 None 时直接判定为不可达（例如服务器没有编译进当前内核配置）
    pub proxy_url: Option<String>,
}

impl ProbeTarget {
    /// 通过测速入站上属于该服务器的账号访问
    pub fn via_probe_inbound(name: &str, host: &str, port: u16) -> Self {
        let key = Compiler::probe_key(name);
        Self {
            name: name.to_string(),
            proxy_url: Some(format!("socks5h://{}:{}@{}:{}", key, key, host, port)),
        }
    }

    pub fn unreachable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            proxy_url: None,
        }
    }
}

/// 并发测速
pub struct LatencyProbe {
    transport: Arc<dyn LatencyTransport>,
    target_url: String,
    timeout: Duration,
}

impl LatencyProbe {
    pub fn new(transport: Arc<dyn LatencyTransport>, target_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            target_url: target_url.into(),
            timeout,
        }
    }

    /// 每个服务器一个任务，完成即发送结果；同名目标只测一次
    pub fn measure(&self, targets: Vec<ProbeTarget>) -> mpsc::UnboundedReceiver<LatencyResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut seen = HashSet::new();

        for target in targets {
            if !seen.insert(target.name.clone()) {
                continue;
            }
            let tx = tx.clone();
            let transport = self.transport.clone();
            let url = self.target_url.clone();
            let timeout = self.timeout;

            tokio::spawn(async move {
                let outcome = match target.proxy_url {
                    Some(proxy) => {
                        let measured =
                            tokio::time::timeout(timeout, transport.round_trip(&proxy, &url, timeout))
                                .await;
                        match measured {
                            Ok(Ok(elapsed)) => LatencyOutcome::Reachable {
                                millis: elapsed.as_millis() as u64,
                            },
                            Ok(Err(e)) => {
                                log::debug!("Latency probe for {} failed: {:#}", target.name, e);
                                LatencyOutcome::Unreachable
                            }
                            Err(_) => {
                                log::debug!("Latency probe for {} timed out", target.name);
                                LatencyOutcome::Unreachable
                            }
                        }
                    }
                    None => LatencyOutcome::Unreachable,
                };
                let _ = tx.send(LatencyResult {
                    name: target.name,
                    outcome,
                });
            });
        }

        rx
    }
}
