use std::sync::Arc;

use super::proxy::read_output;
use super::{CommandRunner, ProxyWriteReport, SystemProxyAdapter};
use crate::models::{SystemProxyState, SystemProxyType};

const FALLBACK_SERVICES: &[&str] = &["Wi-Fi", "Ethernet"];

/// macOS：通过 networksetup 对每个网络服务分别读写
pub struct NetworkSetupProxy {
    runner: Arc<dyn CommandRunner>,
    configured_services: Vec<String>,
}

/// 单个网络服务上某类代理的设置
#[derive(Debug, Default, PartialEq, Eq)]
struct ServiceProxy {
    enabled: bool,
    url: String,
    server: String,
    port: u16,
}

impl NetworkSetupProxy {
    pub fn new(runner: Arc<dyn CommandRunner>, configured_services: Vec<String>) -> Self {
        Self {
            runner,
            configured_services,
        }
    }

    /// 需要管理的网络服务：优先使用配置，否则列出所有启用的服务
    fn services(&self) -> Vec<String> {
        if !self.configured_services.is_empty() {
            return self.configured_services.clone();
        }
        match read_output(self.runner.as_ref(), "networksetup", &["-listallnetworkservices"]) {
            Ok(output) => {
                let services: Vec<String> = output
                    .lines()
                    .skip(1) // 跳过第一行（说明文字）
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && !s.starts_with('*'))
                    .map(str::to_string)
                    .collect();
                if services.is_empty() {
                    FALLBACK_SERVICES.iter().map(|s| s.to_string()).collect()
                } else {
                    services
                }
            }
            Err(e) => {
                log::warn!("Failed to list network services: {}", e);
                FALLBACK_SERVICES.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    /// 解析 `Enabled: Yes` / `URL:` / `Server:` / `Port:` 形式的输出
    fn parse_proxy(output: &str) -> ServiceProxy {
        let mut proxy = ServiceProxy::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Enabled" => proxy.enabled = value.eq_ignore_ascii_case("yes"),
                "URL" => proxy.url = value.to_string(),
                "Server" => proxy.server = value.to_string(),
                "Port" => proxy.port = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        proxy
    }

    fn query(&self, flag: &str, service: &str) -> Option<ServiceProxy> {
        match read_output(self.runner.as_ref(), "networksetup", &[flag, service]) {
            Ok(output) => Some(Self::parse_proxy(&output)),
            Err(e) => {
                log::debug!("networksetup {} {} failed: {}", flag, service, e);
                None
            }
        }
    }

    fn run(&self, report: &mut ProxyWriteReport, args: &[&str]) {
        report.run(self.runner.as_ref(), "networksetup", args);
    }
}

impl SystemProxyAdapter for NetworkSetupProxy {
    fn name(&self) -> &'static str {
        "networksetup"
    }

    /// 跨服务汇总，优先级 SOCKS > HTTP > PAC
    fn get_system_proxy(&self) -> SystemProxyState {
        let mut socks = None;
        let mut http = None;
        let mut pac = None;

        for service in self.services() {
            if let Some(p) = self.query("-getautoproxyurl", &service) {
                if p.enabled && !p.url.is_empty() && pac.is_none() {
                    pac = Some(SystemProxyState::pac(p.url));
                }
            }
            if let Some(p) = self.query("-getwebproxy", &service) {
                if p.enabled && !p.server.is_empty() && p.port > 0 && http.is_none() {
                    http = Some(SystemProxyState::http(p.server, p.port));
                }
            }
            if let Some(p) = self.query("-getsocksfirewallproxy", &service) {
                if p.enabled && !p.server.is_empty() && p.port > 0 && socks.is_none() {
                    socks = Some(SystemProxyState::socks(p.server, p.port));
                }
            }
        }

        socks.or(http).or(pac).unwrap_or_default()
    }

    fn set_system_proxy(&self, state: &SystemProxyState) -> ProxyWriteReport {
        let mut report = ProxyWriteReport::default();
        if state.proxy_type == SystemProxyType::Disabled {
            return self.reset_system_proxy();
        }
        let endpoint = state.endpoint();
        if state.proxy_type != SystemProxyType::PacProxy && endpoint.is_none() {
            report.attempted += 1;
            report.failures.push(format!("missing host/port for {}", state));
            return report;
        }

        for service in self.services() {
            let service = service.as_str();
            match (state.proxy_type, endpoint) {
                (SystemProxyType::PacProxy, _) => {
                    let url = state.url.as_deref().unwrap_or_default();
                    self.run(&mut report, &["-setautoproxyurl", service, url]);
                    self.run(&mut report, &["-setautoproxystate", service, "on"]);
                }
                (SystemProxyType::HttpProxy, Some((host, port))) => {
                    let port = port.to_string();
                    self.run(&mut report, &["-setwebproxy", service, host, &port]);
                    self.run(&mut report, &["-setwebproxystate", service, "on"]);
                    self.run(&mut report, &["-setsecurewebproxy", service, host, &port]);
                    self.run(&mut report, &["-setsecurewebproxystate", service, "on"]);
                }
                (SystemProxyType::SocksProxy, Some((host, port))) => {
                    let port = port.to_string();
                    self.run(&mut report, &["-setsocksfirewallproxy", service, host, &port]);
                    self.run(&mut report, &["-setsocksfirewallproxystate", service, "on"]);
                }
                _ => {}
            }
        }

        if report.is_clean() {
            log::info!("System proxy set to {}", state);
        }
        report
    }

    fn reset_system_proxy(&self) -> ProxyWriteReport {
        let mut report = ProxyWriteReport::default();
        for service in self.services() {
            let service = service.as_str();
            self.run(&mut report, &["-setautoproxystate", service, "off"]);
            self.run(&mut report, &["-setwebproxystate", service, "off"]);
            self.run(&mut report, &["-setsecurewebproxystate", service, "off"]);
            self.run(&mut report, &["-setsocksfirewallproxystate", service, "off"]);
        }
        if report.is_clean() {
            log::info!("System proxy cleared");
        }
        report
    }
}
