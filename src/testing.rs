//! 测试替身：命令执行、系统代理、内核进程、网络请求、配置存储

use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Compiler, ConfigStore};
use crate::latency::LatencyTransport;
use crate::models::{AppConfig, CoreConfigDocument, SystemProxyState, SystemProxyType};
use crate::system::{CommandOutput, CommandRunner, ProxyWriteReport, SystemProxyAdapter};
use crate::utils::Fetcher;
use crate::v2ray::{CoreChild, CoreLauncher, Preflight};

/// 获取一个当前空闲的本地端口
pub(crate) fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// 按命令行返回预设输出
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    responses: Mutex<HashMap<String, CommandOutput>>,
    failures: Mutex<Vec<(String, CommandOutput)>>,
    default: Mutex<Option<CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `cmdline` 为 `program arg1 arg2`，也可以只写程序名
    pub fn respond(&self, cmdline: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(cmdline.to_string(), output);
    }

    pub fn set_default(&self, output: CommandOutput) {
        *self.default.lock().unwrap() = Some(output);
    }

    /// 命令行包含 `pattern` 时返回 `output`，优先于其他规则
    pub fn fail_when_contains(&self, pattern: &str, output: CommandOutput) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        self.calls.lock().unwrap().push(line.clone());

        if let Some((_, output)) = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
        {
            return Ok(output.clone());
        }
        let responses = self.responses.lock().unwrap();
        if let Some(output) = responses.get(&line).or_else(|| responses.get(program)) {
            return Ok(output.clone());
        }
        self.default
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no scripted response for `{}`", line))
    }
}

/// 内存中的系统代理
#[derive(Default)]
pub(crate) struct MemoryProxyAdapter {
    state: Mutex<SystemProxyState>,
    fail_type: Mutex<Option<SystemProxyType>>,
    writes: AtomicUsize,
}

impl MemoryProxyAdapter {
    pub fn new(initial: SystemProxyState) -> Self {
        Self {
            state: Mutex::new(initial),
            ..Self::default()
        }
    }

    pub fn state(&self) -> SystemProxyState {
        self.state.lock().unwrap().clone()
    }

    /// 写入该类型时所有子命令失败
    pub fn fail_on(&self, proxy_type: Option<SystemProxyType>) {
        *self.fail_type.lock().unwrap() = proxy_type;
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SystemProxyAdapter for MemoryProxyAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_system_proxy(&self) -> SystemProxyState {
        self.state()
    }

    fn set_system_proxy(&self, state: &SystemProxyState) -> ProxyWriteReport {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if *self.fail_type.lock().unwrap() == Some(state.proxy_type) {
            return ProxyWriteReport {
                attempted: 2,
                failures: vec!["injected failure".to_string(); 2],
            };
        }
        *self.state.lock().unwrap() = state.clone();
        ProxyWriteReport {
            attempted: 2,
            failures: vec![],
        }
    }

    fn reset_system_proxy(&self) -> ProxyWriteReport {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = SystemProxyState::disabled();
        ProxyWriteReport {
            attempted: 1,
            failures: vec![],
        }
    }
}

struct FakeProcess {
    pid: u32,
    exited: Mutex<Option<String>>,
    listener: Mutex<Option<TcpListener>>,
}

impl FakeProcess {
    fn exit(&self, description: &str) {
        let mut exited = self.exited.lock().unwrap();
        if exited.is_none() {
            *exited = Some(description.to_string());
        }
        self.listener.lock().unwrap().take();
    }

    fn is_alive(&self) -> bool {
        self.exited.lock().unwrap().is_none()
    }
}

struct FakeChild(Arc<FakeProcess>);

impl CoreChild for FakeChild {
    fn id(&self) -> u32 {
        self.0.pid
    }

    fn try_wait(&mut self) -> std::io::Result<Option<String>> {
        Ok(self.0.exited.lock().unwrap().clone())
    }

    fn terminate(&mut self) {
        self.0.exit("terminated");
    }

    fn kill(&mut self) {
        self.0.exit("killed");
    }
}

/// 假内核：启动时读取配置并监听其中的本地端口
pub(crate) struct FakeLauncher {
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    configs: Mutex<Vec<CoreConfigDocument>>,
    preflight_error: Mutex<Option<String>>,
    exit_on_launch: Mutex<Option<String>>,
    never_ready: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            preflight_error: Mutex::new(None),
            exit_on_launch: Mutex::new(None),
            never_ready: AtomicBool::new(false),
            // 高于 Linux pid_max，不会误伤真实进程
            next_pid: AtomicU32::new(4_200_000),
        }
    }

    pub fn set_preflight_error(&self, reason: Option<&str>) {
        *self.preflight_error.lock().unwrap() = reason.map(str::to_string);
    }

    pub fn set_exit_on_launch(&self, description: Option<&str>) {
        *self.exit_on_launch.lock().unwrap() = description.map(str::to_string);
    }

    pub fn set_never_ready(&self, never_ready: bool) {
        self.never_ready.store(never_ready, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn running_count(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_alive())
            .count()
    }

    pub fn last_config(&self) -> Option<CoreConfigDocument> {
        self.configs.lock().unwrap().last().cloned()
    }

    /// 模拟正在运行的内核意外退出
    pub fn crash_running(&self, description: &str) {
        for process in self.processes.lock().unwrap().iter() {
            if process.is_alive() {
                process.exit(description);
            }
        }
    }
}

impl CoreLauncher for FakeLauncher {
    fn launch(&self, config_path: &Path) -> Result<Box<dyn CoreChild>> {
        let config: CoreConfigDocument = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let exit = self.exit_on_launch.lock().unwrap().clone();
        let listener = match (&exit, self.never_ready.load(Ordering::SeqCst)) {
            (None, false) => {
                let addr = config
                    .primary_listener()
                    .ok_or_else(|| anyhow!("config has no listener"))?;
                Some(TcpListener::bind(addr)?)
            }
            _ => None,
        };
        let process = Arc::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exited: Mutex::new(exit),
            listener: Mutex::new(listener),
        });
        self.processes.lock().unwrap().push(process.clone());
        self.configs.lock().unwrap().push(config);
        Ok(Box::new(FakeChild(process)))
    }

    fn preflight(&self, config_path: &Path) -> Result<Preflight> {
        let content = std::fs::read_to_string(config_path)?;
        serde_json::from_str::<CoreConfigDocument>(&content)?;
        Ok(match self.preflight_error.lock().unwrap().clone() {
            Some(reason) => Preflight::Rejected(reason),
            None => Preflight::Passed,
        })
    }

    fn version(&self) -> Option<String> {
        Some("V2Ray 4.45.2".to_string())
    }
}

/// 预设响应的下载器，未配置的地址返回错误
#[derive(Default)]
pub(crate) struct StaticFetcher {
    responses: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, body: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), body.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn proxies(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, url: &str, proxy: Option<&str>) -> BoxFuture<'static, Result<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), proxy.map(str::to_string)));
        let result = self
            .responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused"));
        async move { result }.boxed()
    }
}

/// 内存配置存储
pub(crate) struct MemoryConfigStore {
    config: Mutex<AppConfig>,
    saves: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saved(&self) -> AppConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<AppConfig> {
        let mut config = self.config.lock().unwrap().clone();
        config.normalize();
        Ok(config)
    }

    fn save(&self, config: &AppConfig) -> Result<()> {
        *self.config.lock().unwrap() = config.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 按测速账号返回预设延迟，未配置的服务器连接失败
#[derive(Default)]
pub(crate) struct FakeTransport {
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delay(&self, server: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(Compiler::probe_key(server), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl LatencyTransport for FakeTransport {
    fn round_trip(
        &self,
        proxy: &str,
        _target: &str,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<Duration>> {
        self.calls.lock().unwrap().push(proxy.to_string());
        let user = proxy
            .strip_prefix("socks5h://")
            .and_then(|rest| rest.split(':').next())
            .unwrap_or_default();
        let delay = self.delays.lock().unwrap().get(user).copied();
        async move {
            let delay = delay.ok_or_else(|| anyhow!("connection refused"))?;
            tokio::time::sleep(delay).await;
            Ok(delay)
        }
        .boxed()
    }
}
