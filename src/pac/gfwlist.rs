use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::decode_base64;
use crate::error::{AppError, AppResult};
use crate::models::LocalProtocol;
use crate::utils::Fetcher;

/// 从 AutoProxy 格式的 GFW 列表中提取的域名规则
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GfwRules {
    /// 走代理的域名（后缀匹配）
    pub proxied: BTreeSet<String>,
    /// `@@` 例外规则，直连
    pub direct: BTreeSet<String>,
}

impl GfwRules {
    /// 解码下载内容：通常是 base64，也接受已解码的明文
    pub fn decode(raw: &str) -> Result<String> {
        let trimmed = raw.trim_start();
        if trimmed.starts_with("[AutoProxy") || trimmed.starts_with('!') {
            return Ok(raw.to_string());
        }
        let bytes = decode_base64(raw).ok_or_else(|| anyhow!("gfwlist is not valid base64"))?;
        let text = String::from_utf8(bytes).map_err(|_| anyhow!("gfwlist is not valid UTF-8"))?;
        if !text.trim_start().starts_with("[AutoProxy") {
            return Err(anyhow!("gfwlist has no AutoProxy header"));
        }
        Ok(text)
    }

    pub fn parse(text: &str) -> Self {
        let mut rules = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }
            let (exception, rule) = match line.strip_prefix("@@") {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let Some(domain) = rule_domain(rule) else {
                continue;
            };
            if exception {
                rules.direct.insert(domain);
            } else {
                rules.proxied.insert(domain);
            }
        }
        rules
    }

    pub fn len(&self) -> usize {
        self.proxied.len() + self.direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxied.is_empty() && self.direct.is_empty()
    }

    /// 与 PAC 脚本相同的判定：例外优先，然后按域名后缀匹配
    pub fn should_proxy(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        !suffix_match(&self.direct, &host) && suffix_match(&self.proxied, &host)
    }
}

fn suffix_match(set: &BTreeSet<String>, host: &str) -> bool {
    let mut suffix = host;
    loop {
        if set.contains(suffix) {
            return true;
        }
        match suffix.find('.') {
            Some(dot) => suffix = &suffix[dot + 1..],
            None => return false,
        }
    }
}

/// 单条规则对应的域名；正则和含通配符的规则忽略
fn rule_domain(rule: &str) -> Option<String> {
    if rule.starts_with('/') && rule.ends_with('/') {
        return None;
    }
    let rest = if let Some(rest) = rule.strip_prefix("||") {
        rest
    } else if let Some(rest) = rule.strip_prefix('|') {
        rest.strip_prefix("http://")
            .or_else(|| rest.strip_prefix("https://"))
            .unwrap_or(rest)
    } else {
        rule.trim_start_matches('.')
    };

    let host = rest.split(['/', '^', '?']).next()?;
    let host = host.split(':').next()?.trim_start_matches('.').to_ascii_lowercase();
    let valid = host.contains('.')
        && !host.ends_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    valid.then_some(host)
}

/// PAC 中返回的代理串
pub fn pac_proxy_string(protocol: LocalProtocol, host: &str, port: u16) -> String {
    match protocol {
        LocalProtocol::Socks => format!("SOCKS5 {host}:{port}; SOCKS {host}:{port}; DIRECT"),
        LocalProtocol::Http => format!("PROXY {host}:{port}; DIRECT"),
    }
}

/// 生成 PAC 脚本
pub fn generate_pac(rules: &GfwRules, proxy: &str) -> String {
    let to_object = |set: &BTreeSet<String>| {
        let map: BTreeMap<&str, u8> = set.iter().map(|d| (d.as_str(), 1)).collect();
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    };
    let proxy = serde_json::to_string(proxy).unwrap_or_else(|_| "\"DIRECT\"".to_string());

    format!(
        r#"var proxy = {proxy};
var direct = "DIRECT";
var proxied = {proxied};
var exceptions = {exceptions};
var hasOwn = Object.prototype.hasOwnProperty;

function matches(set, host) {{
    var suffix = host;
    while (true) {{
        if (hasOwn.call(set, suffix)) {{
            return true;
        }}
        var dot = suffix.indexOf(".");
        if (dot < 0) {{
            return false;
        }}
        suffix = suffix.substring(dot + 1);
    }}
}}

function FindProxyForURL(url, host) {{
    host = host.toLowerCase();
    if (matches(exceptions, host)) {{
        return direct;
    }}
    if (matches(proxied, host)) {{
        return proxy;
    }}
    return direct;
}}
"#,
        proxy = proxy,
        proxied = to_object(&rules.proxied),
        exceptions = to_object(&rules.direct),
    )
}

/// 加载结果
#[derive(Debug, Clone)]
pub struct GfwList {
    pub rules: GfwRules,
    pub updated_at: SystemTime,
    /// 下载失败，使用了过期缓存
    pub stale: bool,
    pub fetched: bool,
}

/// 磁盘上的 GFW 列表缓存（原始下载内容），修改时间即更新时间
pub struct GfwListCache {
    path: PathBuf,
}

impl GfwListCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Option<(String, SystemTime)> {
        let content = fs::read_to_string(&self.path).ok()?;
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        Some((content, modified))
    }

    pub fn write(&self, raw: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, raw)?;
        Ok(())
    }

    fn load_rules(&self) -> Option<(GfwRules, SystemTime)> {
        let (raw, modified) = self.read()?;
        match GfwRules::decode(&raw) {
            Ok(text) => Some((GfwRules::parse(&text), modified)),
            Err(e) => {
                log::warn!("Ignoring corrupt gfwlist cache {:?}: {}", self.path, e);
                None
            }
        }
    }

    /// 获取规则
    ///
    /// 缓存未过期且不强制更新时直接使用缓存；否则下载，失败时退回过期缓存。
    /// 强制更新失败直接报错。
    pub async fn load(
        &self,
        fetcher: &dyn Fetcher,
        url: &str,
        refresh: Duration,
        force: bool,
        proxy: Option<&str>,
    ) -> AppResult<GfwList> {
        let cached = self.load_rules();
        if let (false, Some((rules, modified))) = (force, &cached) {
            let age = SystemTime::now()
                .duration_since(*modified)
                .unwrap_or_default();
            if age < refresh {
                log::debug!("Using cached gfwlist ({} rules, age {:?})", rules.len(), age);
                return Ok(GfwList {
                    rules: rules.clone(),
                    updated_at: *modified,
                    stale: false,
                    fetched: false,
                });
            }
        }

        let downloaded = match fetcher.fetch(url, proxy).await {
            Ok(raw) => GfwRules::decode(&raw).map(|text| (raw, text)),
            Err(e) => Err(e),
        };

        match downloaded {
            Ok((raw, text)) => {
                let rules = GfwRules::parse(&text);
                if let Err(e) = self.write(&raw) {
                    log::warn!("Failed to cache gfwlist to {:?}: {}", self.path, e);
                }
                log::info!("Downloaded gfwlist with {} rules", rules.len());
                Ok(GfwList {
                    rules,
                    updated_at: SystemTime::now(),
                    stale: false,
                    fetched: true,
                })
            }
            Err(e) => match cached {
                Some((rules, modified)) if !force => {
                    log::warn!("Failed to download gfwlist, using stale cache: {:#}", e);
                    Ok(GfwList {
                        rules,
                        updated_at: modified,
                        stale: true,
                        fetched: false,
                    })
                }
                _ => Err(AppError::fetch_failed(url, format!("{:#}", e))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFetcher;
    use base64::Engine;

    const LIST: &str = "[AutoProxy 0.2.9]\n\
        ! Checksum: abc\n\
        ||google.com\n\
        .twitter.com\n\
        |http://www.example.org/path\n\
        blogspot.com\n\
        /^https?:\\/\\/[^\\/]+blogspot\\.(.*)/\n\
        *.wildcard.net\n\
        @@||cn.google.com\n\
        @@|http://direct.example.org\n";

    fn encoded() -> String {
        base64::engine::general_purpose::STANDARD.encode(LIST)
    }

    #[test]
    fn test_parse_rules() {
        let rules = GfwRules::parse(LIST);
        let proxied: Vec<_> = rules.proxied.iter().map(String::as_str).collect();
        assert_eq!(
            proxied,
            vec!["blogspot.com", "google.com", "twitter.com", "www.example.org"]
        );
        let direct: Vec<_> = rules.direct.iter().map(String::as_str).collect();
        assert_eq!(direct, vec!["cn.google.com", "direct.example.org"]);
    }

    #[test]
    fn test_suffix_matching_and_exceptions() {
        let rules = GfwRules::parse(LIST);
        assert!(rules.should_proxy("google.com"));
        assert!(rules.should_proxy("WWW.Google.com"));
        assert!(rules.should_proxy("mobile.twitter.com"));
        assert!(!rules.should_proxy("cn.google.com"));
        assert!(!rules.should_proxy("maps.cn.google.com"));
        assert!(!rules.should_proxy("notgoogle.com"));
        assert!(!rules.should_proxy("example.org"));
    }

    #[test]
    fn test_decode_accepts_base64_with_newlines() {
        let wrapped: String = encoded()
            .as_bytes()
            .chunks(64)
            .map(|c| format!("{}\n", String::from_utf8_lossy(c)))
            .collect();
        assert_eq!(GfwRules::decode(&wrapped).unwrap(), LIST);
        assert_eq!(GfwRules::decode(LIST).unwrap(), LIST);
        assert!(GfwRules::decode("<html>not found</html>").is_err());
    }

    #[test]
    fn test_generated_script() {
        let rules = GfwRules::parse(LIST);
        let script = generate_pac(&rules, &pac_proxy_string(LocalProtocol::Socks, "127.0.0.1", 1080));
        assert!(script.contains(r#"var proxy = "SOCKS5 127.0.0.1:1080; SOCKS 127.0.0.1:1080; DIRECT";"#));
        assert!(script.contains(r#""google.com":1"#));
        assert!(script.contains(r#"var exceptions = {"cn.google.com":1,"direct.example.org":1};"#));
        assert!(script.contains("function FindProxyForURL(url, host)"));

        assert_eq!(
            pac_proxy_string(LocalProtocol::Http, "127.0.0.1", 1087),
            "PROXY 127.0.0.1:1087; DIRECT"
        );
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GfwListCache::new(dir.path().join("gfwlist.txt"));
        cache.write(&encoded()).unwrap();
        let fetcher = StaticFetcher::new();

        let list = cache
            .load(&fetcher, "https://example.com/gfwlist.txt", Duration::from_secs(3600), false, None)
            .await
            .unwrap();
        assert!(!list.fetched);
        assert!(!list.stale);
        assert!(list.rules.should_proxy("google.com"));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_download_populates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GfwListCache::new(dir.path().join("gfwlist.txt"));
        let fetcher = StaticFetcher::new();
        fetcher.respond("https://example.com/gfwlist.txt", encoded());

        let list = cache
            .load(&fetcher, "https://example.com/gfwlist.txt", Duration::from_secs(3600), false, None)
            .await
            .unwrap();
        assert!(list.fetched);
        assert_eq!(cache.read().unwrap().0, encoded());
    }

    #[tokio::test]
    async fn test_stale_cache_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let cache = GfwListCache::new(dir.path().join("gfwlist.txt"));
        let fetcher = StaticFetcher::new();
        let url = "https://unreachable.example/gfwlist.txt";

        let err = cache.load(&fetcher, url, Duration::ZERO, false, None).await.unwrap_err();
        assert!(matches!(err, AppError::SubscriptionFetchFailed { .. }));

        cache.write(&encoded()).unwrap();
        let list = cache.load(&fetcher, url, Duration::ZERO, false, None).await.unwrap();
        assert!(list.stale);
        assert!(list.rules.should_proxy("twitter.com"));

        // 强制更新不退回缓存
        assert!(cache.load(&fetcher, url, Duration::ZERO, true, None).await.is_err());
    }
}
