use anyhow::Result;
use std::sync::Arc;

use super::{CommandOutput, CommandRunner, GsettingsProxy, NetworkSetupProxy, RegistryProxy};
use crate::models::SystemProxyState;

/// 系统代理适配器
///
/// 三个操作在各平台语义一致；写操作对每个子命令都做尽力而为处理，
/// 失败记录在 [`ProxyWriteReport`] 中，不中断后续子命令。
pub trait SystemProxyAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn get_system_proxy(&self) -> SystemProxyState;
    fn set_system_proxy(&self, state: &SystemProxyState) -> ProxyWriteReport;
    fn reset_system_proxy(&self) -> ProxyWriteReport;
}

/// 一次写操作的结果汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyWriteReport {
    pub attempted: usize,
    pub failures: Vec<String>,
}

impl ProxyWriteReport {
    /// 执行一个子命令并记录结果
    pub(crate) fn run(&mut self, runner: &dyn CommandRunner, program: &str, args: &[&str]) -> bool {
        self.run_tolerant(runner, program, args, |_| false)
    }

    /// 同上，`tolerate` 返回 true 的失败视为成功（例如删除不存在的注册表值）
    pub(crate) fn run_tolerant(
        &mut self,
        runner: &dyn CommandRunner,
        program: &str,
        args: &[&str],
        tolerate: impl Fn(&CommandOutput) -> bool,
    ) -> bool {
        self.attempted += 1;
        let label = format!("{} {}", program, args.join(" "));
        match runner.run(program, args) {
            Ok(output) if command_succeeded(&output) || tolerate(&output) => true,
            Ok(output) => {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                log::warn!("`{}` failed: {}", label, detail);
                self.failures.push(format!("{}: {}", label, detail));
                false
            }
            Err(e) => {
                log::warn!("`{}` failed: {}", label, e);
                self.failures.push(format!("{}: {}", label, e));
                false
            }
        }
    }

    pub fn merge(&mut self, other: ProxyWriteReport) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// 所有子命令都失败（且至少尝试了一个）
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failures.len() >= self.attempted
    }
}

/// networksetup 失败时退出码可能仍为 0，需要检查输出
pub(crate) fn command_succeeded(output: &CommandOutput) -> bool {
    output.success && !output.stdout.trim_start().starts_with("** Error")
}

/// 根据运行平台选择适配器
pub fn detect_adapter(
    runner: Arc<dyn CommandRunner>,
    network_services: Vec<String>,
) -> Arc<dyn SystemProxyAdapter> {
    let adapter: Arc<dyn SystemProxyAdapter> = match std::env::consts::OS {
        "windows" => Arc::new(RegistryProxy::new(runner)),
        "macos" => Arc::new(NetworkSetupProxy::new(runner, network_services)),
        _ => Arc::new(GsettingsProxy::new(runner)),
    };
    log::info!("Using {} system proxy adapter", adapter.name());
    adapter
}

pub(crate) fn read_output(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<String> {
    let output = runner.run(program, args)?;
    if !command_succeeded(&output) {
        anyhow::bail!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            output.stderr.trim()
        );
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    #[test]
    fn test_report_classification() {
        let runner = ScriptedRunner::new();
        runner.respond("good", CommandOutput::ok(""));
        runner.respond("bad", CommandOutput::failed("denied"));
        runner.respond("mac", CommandOutput::ok("** Error: The parameters were not valid."));

        let mut report = ProxyWriteReport::default();
        assert!(report.run(&runner, "good", &[]));
        assert!(!report.run(&runner, "bad", &["x"]));
        assert!(!report.run(&runner, "mac", &[]));
        assert!(report.run_tolerant(&runner, "bad", &[], |o| o.stderr.contains("denied")));
        assert_eq!(report.attempted, 4);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].starts_with("bad x: denied"));
        assert!(!report.all_failed());

        let mut report = ProxyWriteReport::default();
        report.run(&runner, "missing-program", &[]);
        assert!(report.all_failed());
        assert!(!ProxyWriteReport::default().all_failed());
    }
}
