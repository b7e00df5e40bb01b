use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Duration, Instant, MissedTickBehavior};

use super::{CoreChild, CoreLauncher, Preflight};
use crate::error::{AppError, AppResult, CompileError};
use crate::models::{AppSettings, CoreConfigDocument, CoreStatus, ProcessStatus};
use crate::utils::{is_pid_running, kill_process_by_pid};

/// 内核进程管理参数
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// 内核读取的配置文件位置
    pub config_path: PathBuf,
    pub pid_path: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub liveness_interval: Duration,
}

impl SupervisorOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            pid_path: None,
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
            liveness_interval: Duration::from_millis(500),
        }
    }

    pub fn with_pid_path(mut self, pid_path: impl Into<PathBuf>) -> Self {
        self.pid_path = Some(pid_path.into());
        self
    }

    pub fn with_settings(mut self, settings: &AppSettings) -> Self {
        self.startup_timeout = settings.startup_timeout();
        self.stop_grace = settings.stop_grace();
        self
    }
}

enum Op {
    Start(CoreConfigDocument),
    Stop,
    Apply(CoreConfigDocument),
}

struct Request {
    op: Op,
    reply: oneshot::Sender<AppResult<()>>,
}

/// 内核进程管理器句柄
///
/// 请求按 FIFO 顺序由后台任务逐个处理；所有句柄被丢弃后，后台任务停止内核进程并退出。
#[derive(Clone)]
pub struct CoreSupervisor {
    tx: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<CoreStatus>,
}

impl CoreSupervisor {
    /// 启动后台任务，需要在 tokio 运行时中调用
    pub fn spawn(launcher: Arc<dyn CoreLauncher>, options: SupervisorOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(CoreStatus::default());
        let actor = SupervisorActor {
            launcher,
            options,
            child: None,
            status_tx,
            version: None,
            started_at: None,
            queue: VecDeque::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx, status }
    }

    pub async fn start(&self, config: CoreConfigDocument) -> AppResult<()> {
        self.request(Op::Start(config)).await
    }

    pub async fn stop(&self) -> AppResult<()> {
        self.request(Op::Stop).await
    }

    /// 运行中：先检查新配置，再重启；未运行：等同于 start
    pub async fn apply_new_config(&self, config: CoreConfigDocument) -> AppResult<()> {
        self.request(Op::Apply(config)).await
    }

    /// 非阻塞读取当前状态
    pub fn query_status(&self) -> CoreStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoreStatus> {
        self.status.clone()
    }

    async fn request(&self, op: Op) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { op, reply })
            .map_err(|_| AppError::CoreUnavailable("supervisor is not running".to_string()))?;
        rx.await
            .map_err(|_| AppError::CoreUnavailable("supervisor dropped the request".to_string()))?
    }
}

struct SupervisorActor {
    launcher: Arc<dyn CoreLauncher>,
    options: SupervisorOptions,
    child: Option<Box<dyn CoreChild>>,
    status_tx: watch::Sender<CoreStatus>,
    version: Option<String>,
    started_at: Option<String>,
    queue: VecDeque<Request>,
}

impl SupervisorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        let mut ticker = tokio::time::interval(self.options.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        self.queue.push_back(request);
                        self.drain(&mut rx).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.check_liveness(),
            }
        }

        log::info!("Supervisor handle dropped, stopping V2Ray");
        self.stop_child().await;
    }

    fn pull_pending(&mut self, rx: &mut mpsc::UnboundedReceiver<Request>) {
        while let Ok(request) = rx.try_recv() {
            self.queue.push_back(request);
        }
    }

    async fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<Request>) {
        loop {
            self.pull_pending(rx);
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            match request.op {
                Op::Start(config) => {
                    let result = self.start(config).await;
                    let _ = request.reply.send(result);
                }
                Op::Stop => {
                    self.stop_child().await;
                    let _ = request.reply.send(Ok(()));
                }
                Op::Apply(mut config) => {
                    // 连续排队的 apply 只执行最后一个，所有调用方得到同一个结果
                    let mut replies = vec![request.reply];
                    while matches!(self.queue.front(), Some(Request { op: Op::Apply(_), .. })) {
                        if let Some(Request {
                            op: Op::Apply(next),
                            reply,
                        }) = self.queue.pop_front()
                        {
                            config = next;
                            replies.push(reply);
                        }
                    }
                    if replies.len() > 1 {
                        log::debug!("Collapsed {} pending config applies", replies.len());
                    }
                    let result = self.apply(config).await;
                    for reply in replies {
                        let _ = reply.send(result.clone());
                    }
                }
            }
        }
    }

    fn publish(&self, state: ProcessStatus, pid: Option<u32>) {
        let started_at = if state.is_running() {
            self.started_at.clone()
        } else {
            None
        };
        self.status_tx.send_replace(CoreStatus {
            state,
            pid,
            version: self.version.clone(),
            started_at,
        });
    }

    fn current_state(&self) -> ProcessStatus {
        self.status_tx.borrow().state.clone()
    }

    async fn start(&mut self, config: CoreConfigDocument) -> AppResult<()> {
        if self.child.is_some() && self.current_state().is_running() {
            log::info!("V2Ray is already running");
            return Ok(());
        }
        config.validate()?;
        self.stage_config(&config).await?;
        self.launch(&config).await
    }

    async fn apply(&mut self, config: CoreConfigDocument) -> AppResult<()> {
        if self.child.is_none() {
            return self.start(config).await;
        }
        config.validate()?;
        // 检查失败时旧进程保持不变
        self.stage_config(&config).await?;
        self.stop_child().await;
        self.launch(&config).await
    }

    /// 写入临时文件，`v2ray -test` 通过后替换正式配置
    async fn stage_config(&self, config: &CoreConfigDocument) -> AppResult<()> {
        let content = config.to_json_pretty()?;
        let config_path = self.options.config_path.clone();
        let launcher = self.launcher.clone();

        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let staging = config_path.with_extension("json.staging");
            let io_error = |e: std::io::Error| {
                AppError::CoreUnavailable(format!("failed to write {}: {}", staging.display(), e))
            };
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
            fs::write(&staging, content).map_err(io_error)?;

            let preflight = launcher.preflight(&staging);
            let result = match preflight {
                Ok(Preflight::Passed) => fs::rename(&staging, &config_path).map_err(io_error),
                Ok(Preflight::Rejected(reason)) => {
                    log::warn!("V2Ray rejected the new config: {}", reason);
                    Err(CompileError::synthesis(format!("core rejected config: {}", reason)).into())
                }
                Err(e) => Err(AppError::CoreUnavailable(format!("{:#}", e))),
            };
            if result.is_err() {
                let _ = fs::remove_file(&staging);
            }
            result
        })
        .await
        .map_err(|e| AppError::CoreUnavailable(format!("config staging task failed: {}", e)))?
    }

    async fn launch(&mut self, config: &CoreConfigDocument) -> AppResult<()> {
        let listener = config
            .primary_listener()
            .ok_or_else(|| CompileError::synthesis("config has no local listener"))?;

        self.publish(ProcessStatus::Starting, None);

        if self.version.is_none() {
            let launcher = self.launcher.clone();
            self.version = tokio::task::spawn_blocking(move || launcher.version())
                .await
                .ok()
                .flatten();
            if let Some(version) = &self.version {
                log::info!("V2Ray version: {}", version);
            }
        }

        self.cleanup_stale_process().await;

        let launcher = self.launcher.clone();
        let config_path = self.options.config_path.clone();
        let spawned = tokio::task::spawn_blocking(move || launcher.launch(&config_path))
            .await
            .map_err(|e| anyhow::anyhow!("launch task failed: {}", e))
            .and_then(|r| r);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to launch V2Ray: {:#}", e);
                self.publish(ProcessStatus::Stopped, None);
                return Err(AppError::CoreUnavailable(format!("{:#}", e)));
            }
        };
        let pid = child.id();
        log::info!("V2Ray launched with PID {}", pid);
        self.save_pid(pid);

        // 等待本地监听端口可连接
        let deadline = Instant::now() + self.options.startup_timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match child.try_wait() {
                Ok(Some(exit)) => {
                    log::error!("V2Ray exited during startup: {}", exit);
                    self.remove_pid_file();
                    self.publish(ProcessStatus::Stopped, None);
                    return Err(AppError::ProcessCrashed(exit));
                }
                Ok(None) => {}
                Err(e) => log::warn!("Failed to poll V2Ray process: {}", e),
            }

            let ready = matches!(
                timeout(Duration::from_millis(250), TcpStream::connect(listener)).await,
                Ok(Ok(_))
            );
            if ready {
                log::info!("V2Ray is ready on {} after {} attempts", listener, attempts);
                break;
            }

            if Instant::now() >= deadline {
                log::error!(
                    "V2Ray did not open {} within {:?}, killing it",
                    listener,
                    self.options.startup_timeout
                );
                child.kill();
                self.remove_pid_file();
                self.publish(ProcessStatus::Stopped, None);
                return Err(AppError::startup_timeout(self.options.startup_timeout));
            }
            log::debug!("Readiness check attempt {} failed, retrying...", attempts);
            sleep(Duration::from_millis(100)).await;
        }

        self.child = Some(child);
        self.started_at = Some(chrono::Local::now().to_rfc3339());
        self.publish(ProcessStatus::Running, Some(pid));
        Ok(())
    }

    /// 先请求退出，宽限期后强制结束；最终状态总是 Stopped
    async fn stop_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            if self.current_state() != ProcessStatus::Stopped {
                self.publish(ProcessStatus::Stopped, None);
            }
            return;
        };
        let pid = child.id();
        self.publish(ProcessStatus::Stopping, Some(pid));
        log::info!("Stopping V2Ray (PID {})", pid);

        child.terminate();
        let deadline = Instant::now() + self.options.stop_grace;
        loop {
            match child.try_wait() {
                Ok(Some(exit)) => {
                    log::info!("V2Ray exited: {}", exit);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Failed to poll V2Ray process: {}", e);
                    child.kill();
                    break;
                }
            }
            if Instant::now() >= deadline {
                log::warn!("V2Ray did not exit within {:?}, killing it", self.options.stop_grace);
                child.kill();
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        self.remove_pid_file();
        self.started_at = None;
        self.publish(ProcessStatus::Stopped, None);
    }

    fn check_liveness(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(exit)) => {
                log::error!("V2Ray exited unexpectedly: {}", exit);
                self.child = None;
                self.started_at = None;
                self.remove_pid_file();
                self.publish(ProcessStatus::CrashedWithError(exit), None);
            }
            Ok(None) => {}
            Err(e) => log::debug!("Liveness check failed: {}", e),
        }
    }

    fn save_pid(&self, pid: u32) {
        let Some(path) = &self.options.pid_path else {
            return;
        };
        if let Err(e) = fs::write(path, pid.to_string()) {
            log::warn!("Failed to save PID to {:?}: {}", path, e);
        }
    }

    fn load_pid(&self) -> Option<u32> {
        let path = self.options.pid_path.as_ref()?;
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn remove_pid_file(&self) {
        if let Some(path) = &self.options.pid_path {
            let _ = fs::remove_file(path);
        }
    }

    /// 清理上次会话遗留的内核进程
    async fn cleanup_stale_process(&self) {
        let Some(pid) = self.load_pid() else {
            return;
        };
        self.remove_pid_file();
        if self.child.as_ref().map(|c| c.id()) == Some(pid) || !is_pid_running(pid) {
            return;
        }
        log::info!("Found stale V2Ray process {}, killing it", pid);
        let _ = tokio::task::spawn_blocking(move || {
            kill_process_by_pid(pid, Duration::from_millis(500))
        })
        .await;
    }
}
