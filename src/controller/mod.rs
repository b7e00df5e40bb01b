mod actor;
mod merge;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{ConfigStore, LineFailure, ShareLink};
use crate::error::{AppError, AppResult};
use crate::latency::LatencyTransport;
use crate::models::{
    AppSettings, CoreStatus, LatencyResult, NetworkStatus, ProxyMode, ServerDescriptor,
    SubscriptionRecord, SystemProxyState,
};
use crate::pac::GfwListCache;
use crate::system::SystemProxyAdapter;
use crate::utils::Fetcher;
use crate::v2ray::CoreSupervisor;

use actor::ControllerActor;

/// 控制器依赖的外部组件
pub struct ControllerDeps {
    pub store: Arc<dyn ConfigStore>,
    pub adapter: Arc<dyn SystemProxyAdapter>,
    pub supervisor: CoreSupervisor,
    pub fetcher: Arc<dyn Fetcher>,
    pub transport: Arc<dyn LatencyTransport>,
    pub gfw_cache: GfwListCache,
    /// 内核 access/error 日志目录
    pub log_dir: Option<PathBuf>,
}

/// 供界面读取的状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSnapshot {
    pub servers: Vec<ServerDescriptor>,
    pub mode: ProxyMode,
    pub active_server: Option<String>,
    pub settings: AppSettings,
    pub subscriptions: Vec<SubscriptionRecord>,
    pub gfw_list_updated_at: Option<String>,
}

impl ControllerSnapshot {
    pub fn server(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// 模式切换结果，`warnings` 为部分失败的系统代理写操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeTransition {
    pub mode: ProxyMode,
    pub warnings: Vec<String>,
}

/// 批量导入结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub failures: Vec<LineFailure>,
}

/// 广播事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ControllerEvent {
    ModeChanged(ProxyMode),
    ServersChanged,
    ActiveServerChanged(Option<String>),
    CoreStatusChanged(CoreStatus),
    LatencyMeasured(LatencyResult),
    SubscriptionImported { url: String, added: usize, updated: usize, removed: usize },
    GfwListUpdated { rules: usize },
    Warning(String),
    /// 内核无法恢复，已强制切换到 Off
    PersistentFailure(String),
}

type Reply<T> = oneshot::Sender<AppResult<T>>;

enum Request {
    SetMode { mode: ProxyMode, reply: Reply<ModeTransition> },
    SetActiveServer { name: String, reply: Reply<()> },
    AddServer { server: ServerDescriptor, reply: Reply<()> },
    EditServer { name: String, server: ServerDescriptor, reply: Reply<()> },
    RemoveServer { name: String, reply: Reply<()> },
    AddShareLinks { text: String, reply: Reply<ImportReport> },
    AddConfigFile { path: PathBuf, reply: Reply<ImportReport> },
    ImportSubscription { url: String, reply: Reply<ImportReport> },
    ProbeLatency { names: Option<Vec<String>>, reply: Reply<mpsc::UnboundedReceiver<LatencyResult>> },
    UpdateGfwList { url: Option<String>, reply: Reply<usize> },
    UpdateSettings { settings: AppSettings, reply: Reply<ModeTransition> },
    NetworkStatus { reply: Reply<NetworkStatus> },
    SystemProxy { reply: Reply<SystemProxyState> },
    ResetSystemProxy { reply: Reply<()> },
    RestoreMode { reply: Reply<ModeTransition> },
    Shutdown { reply: Reply<()> },
}

/// 控制器句柄
///
/// 修改类操作发送到后台任务按顺序执行；查询类操作只读 watch 通道，不等待后台任务。
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<ControllerSnapshot>,
    core_status: watch::Receiver<CoreStatus>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    /// 读取配置并启动控制器；初始模式总是 Off，持久化的模式由 `restore_mode` 恢复
    pub fn spawn(deps: ControllerDeps) -> AppResult<Self> {
        let config = deps.store.load().map_err(|e| AppError::store(&e))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let core_status = deps.supervisor.subscribe();

        let (actor, snapshot) = ControllerActor::new(config, deps, events.clone());
        tokio::spawn(actor.run(rx));

        Ok(Self {
            tx,
            snapshot,
            core_status,
            events,
        })
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> AppResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| AppError::ControllerUnavailable)?;
        rx.await.map_err(|_| AppError::ControllerUnavailable)?
    }

    pub async fn set_mode(&self, mode: ProxyMode) -> AppResult<ModeTransition> {
        self.call(|reply| Request::SetMode { mode, reply }).await
    }

    pub async fn set_active_server(&self, name: impl Into<String>) -> AppResult<()> {
        let name = name.into();
        self.call(|reply| Request::SetActiveServer { name, reply }).await
    }

    pub async fn add_server(&self, server: ServerDescriptor) -> AppResult<()> {
        self.call(|reply| Request::AddServer { server, reply }).await
    }

    pub async fn edit_server(&self, name: impl Into<String>, server: ServerDescriptor) -> AppResult<()> {
        let name = name.into();
        self.call(|reply| Request::EditServer { name, server, reply }).await
    }

    pub async fn remove_server(&self, name: impl Into<String>) -> AppResult<()> {
        let name = name.into();
        self.call(|reply| Request::RemoveServer { name, reply }).await
    }

    /// 导入一行或多行分享链接（也接受 base64 编码的整段内容）
    pub async fn add_share_links(&self, text: impl Into<String>) -> AppResult<ImportReport> {
        let text = text.into();
        self.call(|reply| Request::AddShareLinks { text, reply }).await
    }

    /// 导入 v2ray 配置文件中的出站服务器
    pub async fn add_config_file(&self, path: impl Into<PathBuf>) -> AppResult<ImportReport> {
        let path = path.into();
        self.call(|reply| Request::AddConfigFile { path, reply }).await
    }

    pub async fn import_subscription(&self, url: impl Into<String>) -> AppResult<ImportReport> {
        let url = url.into();
        self.call(|reply| Request::ImportSubscription { url, reply }).await
    }

    /// 测速；`names` 为 None 时测全部服务器。结果按完成顺序到达
    pub async fn probe_latency(
        &self,
        names: Option<Vec<String>>,
    ) -> AppResult<mpsc::UnboundedReceiver<LatencyResult>> {
        self.call(|reply| Request::ProbeLatency { names, reply }).await
    }

    /// 强制重新下载 GFW 列表，返回规则数
    pub async fn update_gfw_list(&self, url: Option<String>) -> AppResult<usize> {
        self.call(|reply| Request::UpdateGfwList { url, reply }).await
    }

    pub async fn update_settings(&self, settings: AppSettings) -> AppResult<ModeTransition> {
        self.call(|reply| Request::UpdateSettings { settings, reply }).await
    }

    /// 检测设置中的地址是否可达；内核运行时经本地监听端口访问
    pub async fn network_status(&self) -> AppResult<NetworkStatus> {
        self.call(|reply| Request::NetworkStatus { reply }).await
    }

    pub async fn system_proxy(&self) -> AppResult<SystemProxyState> {
        self.call(|reply| Request::SystemProxy { reply }).await
    }

    pub async fn reset_system_proxy(&self) -> AppResult<()> {
        self.call(|reply| Request::ResetSystemProxy { reply }).await
    }

    /// 恢复上次保存的模式
    pub async fn restore_mode(&self) -> AppResult<ModeTransition> {
        self.call(|reply| Request::RestoreMode { reply }).await
    }

    /// 切换到 Off 并停止后台任务，保存的模式不变
    pub async fn shutdown(&self) -> AppResult<()> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn core_status(&self) -> CoreStatus {
        self.core_status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshot.clone()
    }

    pub fn share_link(&self, name: &str) -> AppResult<String> {
        let snapshot = self.snapshot.borrow();
        let server = snapshot
            .server(name)
            .ok_or_else(|| AppError::ServerNotFound(name.to_string()))?;
        Ok(ShareLink::to_link(server))
    }
}
