use std::collections::HashMap;
use std::sync::Arc;

use super::proxy::read_output;
use super::{CommandRunner, ProxyWriteReport, SystemProxyAdapter};
use crate::models::{SystemProxyState, SystemProxyType};

const SCHEMA: &str = "org.gnome.system.proxy";
const IGNORE_HOSTS: &str =
    "['localhost', '127.0.0.0/8', '::1', '10.0.0.0/8', '172.16.0.0/12', '192.168.0.0/16']";

/// Linux/GNOME：通过 gsettings 读写桌面会话代理
pub struct GsettingsProxy {
    runner: Arc<dyn CommandRunner>,
}

impl GsettingsProxy {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// 解析 `gsettings list-recursively` 输出，键为 `schema key`
    fn parse_listing(output: &str) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for line in output.lines() {
            let mut parts = line.splitn(3, ' ');
            let (Some(schema), Some(key), Some(value)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let value = value.trim();
            // GVariant 字符串形如 'value'，数字形如 1080 或 uint32 1080
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or_else(|| value.trim_start_matches("uint32 "));
            values.insert(format!("{} {}", schema, key), value.to_string());
        }
        values
    }

    fn parse_state(values: &HashMap<String, String>) -> SystemProxyState {
        let get = |schema: &str, key: &str| {
            values
                .get(&format!("{} {}", schema, key))
                .cloned()
                .unwrap_or_default()
        };
        let endpoint = |sub: &str| -> Option<(String, u16)> {
            let schema = format!("{}.{}", SCHEMA, sub);
            let host = get(&schema, "host");
            let port: u16 = get(&schema, "port").parse().unwrap_or(0);
            (!host.is_empty() && port > 0).then_some((host, port))
        };

        match get(SCHEMA, "mode").as_str() {
            "auto" => SystemProxyState::pac(get(SCHEMA, "autoconfig-url")),
            // SOCKS 优先于 HTTP
            "manual" => match (endpoint("socks"), endpoint("http")) {
                (Some((host, port)), _) => SystemProxyState::socks(host, port),
                (None, Some((host, port))) => SystemProxyState::http(host, port),
                _ => SystemProxyState::disabled(),
            },
            _ => SystemProxyState::disabled(),
        }
    }

    fn set(&self, report: &mut ProxyWriteReport, schema: &str, key: &str, value: &str) {
        report.run(self.runner.as_ref(), "gsettings", &["set", schema, key, value]);
    }
}

impl SystemProxyAdapter for GsettingsProxy {
    fn name(&self) -> &'static str {
        "gsettings"
    }

    fn get_system_proxy(&self) -> SystemProxyState {
        match read_output(self.runner.as_ref(), "gsettings", &["list-recursively", SCHEMA]) {
            Ok(output) => Self::parse_state(&Self::parse_listing(&output)),
            Err(e) => {
                log::warn!("Failed to read GNOME proxy settings: {}", e);
                SystemProxyState::disabled()
            }
        }
    }

    fn set_system_proxy(&self, state: &SystemProxyState) -> ProxyWriteReport {
        let mut report = ProxyWriteReport::default();
        let http = format!("{}.http", SCHEMA);
        let https = format!("{}.https", SCHEMA);
        let socks = format!("{}.socks", SCHEMA);

        match (state.proxy_type, state.endpoint()) {
            (SystemProxyType::PacProxy, _) => {
                let url = state.url.clone().unwrap_or_default();
                self.set(&mut report, SCHEMA, "mode", "auto");
                self.set(&mut report, SCHEMA, "autoconfig-url", &url);
            }
            (SystemProxyType::HttpProxy, Some((host, port))) => {
                let port = port.to_string();
                self.set(&mut report, SCHEMA, "mode", "manual");
                self.set(&mut report, &http, "host", host);
                self.set(&mut report, &http, "port", &port);
                self.set(&mut report, &https, "host", host);
                self.set(&mut report, &https, "port", &port);
            }
            (SystemProxyType::SocksProxy, Some((host, port))) => {
                self.set(&mut report, SCHEMA, "mode", "manual");
                self.set(&mut report, &socks, "host", host);
                self.set(&mut report, &socks, "port", &port.to_string());
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
        let http = format!("{}.http", SCHEMA);
        let https = format!("{}.https", SCHEMA);
        let socks = format!("{}.socks", SCHEMA);

        self.set(&mut report, SCHEMA, "mode", "none");
        self.set(&mut report, SCHEMA, "autoconfig-url", "");
        self.set(&mut report, SCHEMA, "ignore-hosts", IGNORE_HOSTS);
        self.set(&mut report, &http, "enabled", "false");
        for schema in [&http, &https, &socks] {
            self.set(&mut report, schema, "host", "");
            self.set(&mut report, schema, "port", "0");
        }
        if report.is_clean() {
            log::info!("System proxy cleared");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::CommandOutput;
    use crate::testing::ScriptedRunner;

    const LIST: &str = "gsettings list-recursively org.gnome.system.proxy";

    fn listing(mode: &str, http: (&str, u16), socks: (&str, u16)) -> String {
        format!(
            "org.gnome.system.proxy autoconfig-url 'http://127.0.0.1:1085/proxy.pac'\n\
             org.gnome.system.proxy ignore-hosts ['localhost', '127.0.0.0/8']\n\
             org.gnome.system.proxy mode '{}'\n\
             org.gnome.system.proxy.http enabled false\n\
             org.gnome.system.proxy.http host '{}'\n\
             org.gnome.system.proxy.http port {}\n\
             org.gnome.system.proxy.socks host '{}'\n\
             org.gnome.system.proxy.socks port {}\n",
            mode, http.0, http.1, socks.0, socks.1
        )
    }

    fn read(output: String) -> SystemProxyState {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(LIST, CommandOutput::ok(output));
        GsettingsProxy::new(runner).get_system_proxy()
    }

    #[test]
    fn test_get_modes() {
        assert_eq!(
            read(listing("auto", ("", 0), ("", 0))),
            SystemProxyState::pac("http://127.0.0.1:1085/proxy.pac")
        );
        assert!(read(listing("none", ("127.0.0.1", 1087), ("", 0))).is_disabled());
        assert_eq!(
            read(listing("manual", ("127.0.0.1", 1087), ("", 0))),
            SystemProxyState::http("127.0.0.1", 1087)
        );
        assert!(read(listing("manual", ("", 0), ("", 0))).is_disabled());
    }

    #[test]
    fn test_socks_takes_precedence_over_http() {
        assert_eq!(
            read(listing("manual", ("127.0.0.1", 1087), ("127.0.0.1", 1080))),
            SystemProxyState::socks("127.0.0.1", 1080)
        );
    }

    #[test]
    fn test_unreadable_settings_report_disabled() {
        let runner = Arc::new(ScriptedRunner::new());
        assert!(GsettingsProxy::new(runner).get_system_proxy().is_disabled());
    }

    #[test]
    fn test_set_pac_and_reset_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_default(CommandOutput::ok(""));
        let adapter = GsettingsProxy::new(runner.clone());

        let report = adapter.set_system_proxy(&SystemProxyState::pac("http://127.0.0.1:1085/proxy.pac"));
        assert!(report.is_clean());
        assert_eq!(
            runner.calls(),
            vec![
                "gsettings set org.gnome.system.proxy mode auto",
                "gsettings set org.gnome.system.proxy autoconfig-url http://127.0.0.1:1085/proxy.pac",
            ]
        );

        runner.clear_calls();
        let first = adapter.reset_system_proxy();
        let first_calls = runner.calls();
        runner.clear_calls();
        let second = adapter.reset_system_proxy();
        assert_eq!(first, second);
        assert_eq!(first_calls, runner.calls());
        assert!(first_calls.contains(&"gsettings set org.gnome.system.proxy mode none".to_string()));
        assert!(first_calls.contains(&"gsettings set org.gnome.system.proxy.socks port 0".to_string()));
    }

    #[test]
    fn test_partial_failure_is_reported() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_default(CommandOutput::ok(""));
        runner.fail_when_contains("proxy.http ", CommandOutput::failed("No such schema"));
        let report = GsettingsProxy::new(runner).set_system_proxy(&SystemProxyState::http("127.0.0.1", 1087));
        assert_eq!(report.attempted, 5);
        assert_eq!(report.failures.len(), 2);
        assert!(!report.all_failed());
    }
}
