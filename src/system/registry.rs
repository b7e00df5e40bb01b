use std::collections::HashMap;
use std::sync::Arc;

use super::proxy::read_output;
use super::{CommandRunner, ProxyWriteReport, SystemProxyAdapter};
use crate::models::{SystemProxyState, SystemProxyType};

const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Windows：通过 `reg` 读写 Internet Settings
pub struct RegistryProxy {
    runner: Arc<dyn CommandRunner>,
}

impl RegistryProxy {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// 解析 `reg query` 输出：`    Name    REG_TYPE    Value`
    fn parse_values(output: &str) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for line in output.lines() {
            let mut parts = line.split_whitespace();
            let (Some(name), Some(kind)) = (parts.next(), parts.next()) else {
                continue;
            };
            if !kind.starts_with("REG_") {
                continue;
            }
            let value = parts.collect::<Vec<_>>().join(" ");
            values.insert(name.to_string(), value);
        }
        values
    }

    fn parse_state(values: &HashMap<String, String>) -> SystemProxyState {
        if let Some(url) = values.get("AutoConfigURL").filter(|u| !u.is_empty()) {
            return SystemProxyState::pac(url.clone());
        }

        let enabled = values
            .get("ProxyEnable")
            .map(|v| v == "0x1" || v == "1")
            .unwrap_or(false);
        let Some(server) = values.get("ProxyServer").filter(|_| enabled) else {
            return SystemProxyState::disabled();
        };

        // ProxyServer 可能是 host:port，也可能是 http=...;socks=... 的协议列表
        let mut socks = None;
        let mut http = None;
        for entry in server.split(';') {
            match entry.split_once('=') {
                Some(("socks", addr)) => socks = parse_host_port(addr),
                Some((_, addr)) => http = http.or_else(|| parse_host_port(addr)),
                None => http = http.or_else(|| parse_host_port(entry)),
            }
        }
        match (socks, http) {
            (Some((host, port)), _) => SystemProxyState::socks(host, port),
            (None, Some((host, port))) => SystemProxyState::http(host, port),
            _ => SystemProxyState::disabled(),
        }
    }

    fn add_value(&self, report: &mut ProxyWriteReport, name: &str, kind: &str, data: &str) {
        report.run(
            self.runner.as_ref(),
            "reg",
            &["add", INTERNET_SETTINGS, "/v", name, "/t", kind, "/d", data, "/f"],
        );
    }

    fn delete_value(&self, report: &mut ProxyWriteReport, name: &str) {
        report.run_tolerant(
            self.runner.as_ref(),
            "reg",
            &["delete", INTERNET_SETTINGS, "/v", name, "/f"],
            |output| {
                let text = format!("{}{}", output.stdout, output.stderr).to_lowercase();
                text.contains("unable to find")
            },
        );
    }
}

fn parse_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.trim().rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

impl SystemProxyAdapter for RegistryProxy {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn get_system_proxy(&self) -> SystemProxyState {
        match read_output(self.runner.as_ref(), "reg", &["query", INTERNET_SETTINGS]) {
            Ok(output) => Self::parse_state(&Self::parse_values(&output)),
            Err(e) => {
                log::warn!("Failed to query Internet Settings: {}", e);
                SystemProxyState::disabled()
            }
        }
    }

    fn set_system_proxy(&self, state: &SystemProxyState) -> ProxyWriteReport {
        let mut report = ProxyWriteReport::default();
        match (state.proxy_type, state.endpoint()) {
            (SystemProxyType::PacProxy, _) => {
                let url = state.url.clone().unwrap_or_default();
                self.add_value(&mut report, "AutoConfigURL", "REG_SZ", &url);
            }
            (SystemProxyType::HttpProxy, Some((host, port))) => {
                self.add_value(&mut report, "ProxyEnable", "REG_DWORD", "1");
                self.add_value(&mut report, "ProxyServer", "REG_SZ", &format!("{}:{}", host, port));
            }
            (SystemProxyType::SocksProxy, Some((host, port))) => {
                self.add_value(&mut report, "ProxyEnable", "REG_DWORD", "1");
                self.add_value(
                    &mut report,
                    "ProxyServer",
                    "REG_SZ",
                    &format!("socks={}:{}", host, port),
                );
            }
            (SystemProxyType::Disabled, _) => return self.reset_system_proxy(),
            (_, None) => {
                report.attempted += 1;
                report.failures.push(format!("missing host/port for {}", state));
            }
        }
        if report.is_clean() {
            log::info!("System proxy set to {}", state);
        }
        report
    }

    fn reset_system_proxy(&self) -> ProxyWriteReport {
        let mut report = ProxyWriteReport::default();
        self.add_value(&mut report, "ProxyEnable", "REG_DWORD", "0");
        self.delete_value(&mut report, "AutoConfigURL");
        self.delete_value(&mut report, "ProxyServer");
        if report.is_clean() {
            log::info!("System proxy cleared");
        }
        report
    }
}
