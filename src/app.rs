use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigManager, ConfigStore};
use crate::controller::{ControllerDeps, ControllerHandle};
use crate::latency::HttpTransport;
use crate::pac::GfwListCache;
use crate::system::{detect_adapter, SystemCommandRunner};
use crate::utils::{
    get_core_config_path, get_core_pid_path, get_gfw_list_path, get_logs_dir, resolve_core_binary,
    HttpFetcher,
};
use crate::v2ray::{CoreSupervisor, SupervisorOptions, V2RayLauncher};

/// 应用状态
pub struct AppState {
    pub controller: ControllerHandle,
    pub config_manager: Arc<ConfigManager>,
}

/// 全局应用状态
static APP_STATE: OnceCell<AppState> = OnceCell::new();

/// 获取应用状态
pub fn get_app_state() -> Result<&'static AppState> {
    APP_STATE
        .get()
        .ok_or_else(|| anyhow::anyhow!("App state not initialized"))
}

/// 初始化应用状态，需要在 tokio 运行时中调用
pub fn init_app_state() -> Result<&'static AppState> {
    let config_manager = Arc::new(ConfigManager::new()?);
    let config = config_manager.load()?;
    let settings = config.settings;
    log::info!("Loaded config from {:?}", config_manager.config_path());

    let runner = Arc::new(SystemCommandRunner::new(settings.command_timeout()));
    let adapter = detect_adapter(runner, settings.network_services.clone());

    let binary = resolve_core_binary(settings.core_path.as_deref());
    log::info!("Using V2Ray binary {:?}", binary);
    let launcher = Arc::new(V2RayLauncher::new(binary, settings.command_timeout()));
    let options = SupervisorOptions::new(get_core_config_path()?)
        .with_pid_path(get_core_pid_path()?)
        .with_settings(&settings);
    let supervisor = CoreSupervisor::spawn(launcher, options);

    let log_dir = match get_logs_dir() {
        Ok(dir) => Some(dir),
        Err(e) => {
            log::warn!("Core logs will go to stdout: {}", e);
            None
        }
    };

    let controller = ControllerHandle::spawn(ControllerDeps {
        store: config_manager.clone(),
        adapter,
        supervisor,
        fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(30))),
        transport: Arc::new(HttpTransport),
        gfw_cache: GfwListCache::new(get_gfw_list_path()?),
        log_dir,
    })
    .context("Failed to start controller")?;

    APP_STATE
        .set(AppState {
            controller,
            config_manager,
        })
        .map_err(|_| anyhow::anyhow!("State already initialized"))?;

    log::info!("App state initialized");
    get_app_state()
}
