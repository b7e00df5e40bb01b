use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::time::Duration;

const USER_AGENT: &str = concat!("v2ray-desktop/", env!("CARGO_PKG_VERSION"));

/// 远程文本获取（订阅、GFW 列表）
pub trait Fetcher: Send + Sync {
    /// 获取 `url` 的文本内容，`proxy` 为可选的代理地址（如 `socks5h://127.0.0.1:1080`）
    fn fetch(&self, url: &str, proxy: Option<&str>) -> BoxFuture<'static, Result<String>>;
}

/// 基于 reqwest 的实现
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_client(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);
        builder = match proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, proxy: Option<&str>) -> BoxFuture<'static, Result<String>> {
        let client = self.build_client(proxy);
        let url = url.to_string();
        async move {
            let client = client?;
            log::info!("Fetching {}", url);
            let response = client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(anyhow!("HTTP {}", response.status()));
            }
            let text = response.text().await?;
            log::debug!("Fetched {} bytes from {}", text.len(), url);
            Ok(text)
        }
        .boxed()
    }
}
