use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};

use super::merge::{merge_subscription, unique_name};
use super::{
    ControllerDeps, ControllerEvent, ControllerSnapshot, ImportReport, ModeTransition, Reply,
    Request,
};
use crate::config::{
    import_config_file, parse_subscription, CompileOptions, Compiler, SubscriptionBatch,
};
use crate::error::{AppError, AppResult, CompileError};
use crate::latency::{LatencyProbe, ProbeTarget};
use crate::models::{
    validate_http_url, AppConfig, AppSettings, CoreConfigDocument, LatencyRecord, LatencyResult,
    LocalProtocol, NetworkStatus, ProcessStatus, ProxyMode, Reachability, ServerDescriptor,
    ServerOrigin, SubscriptionRecord, SystemProxyState, PROBE_INBOUND_TAG,
};
use crate::pac::{generate_pac, pac_proxy_string, GfwRules, PacServer};

/// 测速结果附带发起时的代次，代次变化后到达的结果丢弃
type LatencyMessage = (u64, LatencyResult);

/// 变更前的状态，失败时据此回滚
struct Checkpoint {
    mode: ProxyMode,
    config: AppConfig,
    doc: Option<CoreConfigDocument>,
    os: SystemProxyState,
}

pub(super) struct ControllerActor {
    config: AppConfig,
    /// 运行时模式；`config.proxy_mode` 是持久化的模式
    mode: ProxyMode,
    deps: ControllerDeps,
    pac: PacServer,
    pac_rules: Option<GfwRules>,
    applied: Option<CoreConfigDocument>,
    snapshot_tx: watch::Sender<ControllerSnapshot>,
    events: broadcast::Sender<ControllerEvent>,
    generation: u64,
    auto_restart_used: bool,
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

/// 这些模式下系统代理由控制器写入，离开时需要清除
fn owns_system_proxy(mode: ProxyMode) -> bool {
    matches!(mode, ProxyMode::Global | ProxyMode::Pac)
}

impl ControllerActor {
    pub(super) fn new(
        config: AppConfig,
        deps: ControllerDeps,
        events: broadcast::Sender<ControllerEvent>,
    ) -> (Self, watch::Receiver<ControllerSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(ControllerSnapshot::default());
        let actor = Self {
            config,
            mode: ProxyMode::Off,
            deps,
            pac: PacServer::new(),
            pac_rules: None,
            applied: None,
            snapshot_tx,
            events,
            generation: 0,
            auto_restart_used: false,
        };
        actor.publish();
        (actor, snapshot_rx)
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        let (latency_tx, mut latency_rx) = mpsc::unbounded_channel::<LatencyMessage>();
        let mut status_rx = self.deps.supervisor.subscribe();
        let mut status_open = true;

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        log::info!("Controller shutting down");
                        self.leave_to_off(false).await;
                        self.publish();
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    Some(request) => self.handle(request, &latency_tx).await,
                    None => break,
                },
                Some((generation, result)) = latency_rx.recv() => {
                    self.record_latency(generation, result);
                }
                changed = status_rx.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    self.emit(ControllerEvent::CoreStatusChanged(status.clone()));
                    if let ProcessStatus::CrashedWithError(reason) = status.state {
                        self.on_core_crashed(reason).await;
                    }
                }
            }
        }

        log::info!("All controller handles dropped, switching to Off");
        self.leave_to_off(false).await;
    }

    fn respond<T>(&self, reply: Reply<T>, result: AppResult<T>) {
        self.publish();
        let _ = reply.send(result);
    }

    async fn handle(&mut self, request: Request, latency_tx: &mpsc::UnboundedSender<LatencyMessage>) {
        match request {
            Request::SetMode { mode, reply } => {
                let result = self.set_mode(mode).await;
                self.respond(reply, result);
            }
            Request::SetActiveServer { name, reply } => {
                let result = self.set_active_server(name).await;
                self.respond(reply, result);
            }
            Request::AddServer { server, reply } => {
                let result = self.add_server(server);
                self.respond(reply, result);
            }
            Request::EditServer { name, server, reply } => {
                let result = self.edit_server(name, server).await;
                self.respond(reply, result);
            }
            Request::RemoveServer { name, reply } => {
                let result = self.remove_server(name).await;
                self.respond(reply, result);
            }
            Request::AddShareLinks { text, reply } => {
                let batch = parse_subscription(&text, &ServerOrigin::Manual);
                let result = if batch.servers.is_empty() && batch.failures.is_empty() {
                    Err(CompileError::parse_failure(&text, "no share links found").into())
                } else {
                    Ok(self.add_batch(batch))
                };
                self.respond(reply, result);
            }
            Request::AddConfigFile { path, reply } => {
                let result = match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => import_config_file(&contents)
                        .map(|batch| self.add_batch(batch))
                        .map_err(AppError::from),
                    Err(e) => Err(CompileError::parse_failure(
                        path.display().to_string(),
                        format!("failed to read file: {}", e),
                    )
                    .into()),
                };
                self.respond(reply, result);
            }
            Request::ImportSubscription { url, reply } => {
                let result = self.import_subscription(url).await;
                self.respond(reply, result);
            }
            Request::ProbeLatency { names, reply } => {
                let result = self.probe_latency(names, latency_tx).await;
                self.respond(reply, result);
            }
            Request::UpdateGfwList { url, reply } => {
                let result = self.update_gfw_list(url).await;
                self.respond(reply, result);
            }
            Request::UpdateSettings { settings, reply } => {
                let result = self.update_settings(settings).await;
                self.respond(reply, result);
            }
            Request::NetworkStatus { reply } => self.network_status(reply),
            Request::SystemProxy { reply } => {
                let result = Ok(self.read_system_proxy().await);
                self.respond(reply, result);
            }
            Request::ResetSystemProxy { reply } => {
                let result = self.write_system_proxy(None).await.map(|_| ());
                self.respond(reply, result);
            }
            Request::RestoreMode { reply } => {
                let persisted = self.config.proxy_mode;
                let result = if persisted.needs_core() {
                    log::info!("Restoring saved proxy mode {}", persisted);
                    self.set_mode(persisted).await
                } else {
                    Ok(ModeTransition {
                        mode: self.mode,
                        warnings: vec![],
                    })
                };
                self.respond(reply, result);
            }
            Request::Shutdown { reply } => {
                // run 中处理
                self.respond(reply, Ok(()));
            }
        }
    }

    // ---- 状态发布 ----

    fn publish(&self) {
        let snapshot = ControllerSnapshot {
            servers: self.config.servers.clone(),
            mode: self.mode,
            active_server: self.config.active_server.clone(),
            settings: self.config.settings.clone(),
            subscriptions: self.config.subscriptions.clone(),
            gfw_list_updated_at: self.config.gfw_list_updated_at.clone(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn emit(&self, event: ControllerEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    fn warn(&self, message: String) {
        log::warn!("{}", message);
        self.emit(ControllerEvent::Warning(message));
    }

    fn persist(&self) {
        if let Err(e) = self.deps.store.save(&self.config) {
            log::error!("Failed to save config: {:#}", e);
            self.emit(ControllerEvent::Warning(format!("failed to save config: {:#}", e)));
        }
    }

    fn select(&mut self, name: Option<String>) {
        self.config.active_server = name;
        self.config.normalize();
    }

    fn is_core_running(&self) -> bool {
        self.deps.supervisor.query_status().state.is_running()
    }

    /// 内核运行时，订阅与 GFW 列表通过本地监听端口下载
    fn local_proxy_url(&self) -> Option<String> {
        if !self.is_core_running() {
            return None;
        }
        let settings = &self.config.settings;
        let scheme = match settings.local_protocol {
            LocalProtocol::Socks => "socks5h",
            LocalProtocol::Http => "http",
        };
        Some(format!("{}://{}:{}", scheme, settings.local_host, settings.local_port))
    }

    // ---- 模式切换 ----

    async fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            mode: self.mode,
            config: self.config.clone(),
            doc: self.applied.clone(),
            os: self.read_system_proxy().await,
        }
    }

    async fn set_mode(&mut self, target: ProxyMode) -> AppResult<ModeTransition> {
        let checkpoint = self.checkpoint().await;
        self.generation += 1;
        self.auto_restart_used = false;
        self.transition(target, checkpoint).await
    }

    /// 进入 `target`；失败时回滚到 `checkpoint`
    async fn transition(&mut self, target: ProxyMode, checkpoint: Checkpoint) -> AppResult<ModeTransition> {
        let previous = checkpoint.mode;
        log::info!("Switching proxy mode {} -> {}", previous, target);

        match self.enter_mode(target).await {
            Ok(warnings) => {
                self.mode = target;
                self.config.proxy_mode = target;
                self.persist();
                if previous != target {
                    self.emit(ControllerEvent::ModeChanged(target));
                }
                Ok(ModeTransition {
                    mode: target,
                    warnings,
                })
            }
            Err(e) => {
                log::error!("Failed to switch to {} mode: {}", target, e);
                self.rollback(checkpoint).await;
                Err(e)
            }
        }
    }

    async fn enter_mode(&mut self, target: ProxyMode) -> AppResult<Vec<String>> {
        let desired = if target == ProxyMode::Off {
            self.stop_core().await?;
            self.pac.stop().await;
            None
        } else {
            let doc = self.compile_active()?;
            // 下载失败时不应留下任何副作用，先准备好 PAC 规则
            if target == ProxyMode::Pac {
                self.prepare_pac_rules(false).await?;
            }
            self.apply_core(doc).await?;

            let settings = self.config.settings.clone();
            if target == ProxyMode::Pac {
                self.start_pac_server(&settings).await?;
            } else {
                self.pac.stop().await;
            }
            match target {
                ProxyMode::Global => Some(match settings.local_protocol {
                    LocalProtocol::Socks => SystemProxyState::socks(&settings.local_host, settings.local_port),
                    LocalProtocol::Http => SystemProxyState::http(&settings.local_host, settings.local_port),
                }),
                ProxyMode::Pac => Some(SystemProxyState::pac(settings.pac_url())),
                _ => None,
            }
        };

        let current = self.read_system_proxy().await;
        let unchanged = match &desired {
            Some(state) => current == *state,
            None => current.is_disabled(),
        };
        if unchanged {
            log::debug!("System proxy already {}", current);
            return Ok(vec![]);
        }
        self.write_system_proxy(desired).await
    }

    async fn rollback(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            mode,
            config,
            doc,
            os,
        } = checkpoint;
        self.config = config;
        self.mode = mode;

        let restored: AppResult<()> = async {
            match doc {
                Some(doc) if mode.needs_core() => self.apply_core(doc).await?,
                _ => self.stop_core().await?,
            }
            if mode == ProxyMode::Pac {
                let settings = self.config.settings.clone();
                self.regenerate_pac_script(&settings);
                self.start_pac_server(&settings).await?;
            } else {
                self.pac.stop().await;
            }
            if self.read_system_proxy().await != os {
                log::info!("Restoring system proxy to {}", os);
                let state = (!os.is_disabled()).then_some(os);
                self.write_system_proxy(state).await?;
            }
            Ok(())
        }
        .await;

        match restored {
            Ok(()) => log::info!("Rolled back to {} mode", mode),
            Err(e) => {
                log::error!("Rollback to {} mode failed: {}, switching to Off", mode, e);
                self.force_off(format!("rollback failed: {}", e)).await;
            }
        }
    }

    /// 强制进入 Off 并持久化
    async fn force_off(&mut self, reason: String) {
        self.warn(format!("Switching to Off: {}", reason));
        let previous = self.mode;
        self.leave_to_off(true).await;
        if previous != ProxyMode::Off {
            self.emit(ControllerEvent::ModeChanged(ProxyMode::Off));
        }
    }

    /// 停止内核与 PAC 服务并清除系统代理；`persist` 为 false 时保留保存的模式
    async fn leave_to_off(&mut self, persist: bool) {
        let previous = self.mode;
        self.generation += 1;
        if let Err(e) = self.stop_core().await {
            log::error!("Failed to stop V2Ray: {}", e);
        }
        self.pac.stop().await;
        if owns_system_proxy(previous) {
            if let Err(e) = self.write_system_proxy(None).await {
                log::error!("Failed to reset system proxy: {}", e);
            }
        }
        self.mode = ProxyMode::Off;
        if persist {
            self.config.proxy_mode = ProxyMode::Off;
            self.persist();
        }
    }

    // ---- 内核 ----

    fn compile_active(&self) -> AppResult<CoreConfigDocument> {
        let active = self
            .config
            .active()
            .ok_or_else(|| CompileError::invalid_field("activeServer", "no server selected"))?;
        let mut options = CompileOptions::from_settings(&self.config.settings);
        if let Some(dir) = &self.deps.log_dir {
            options = options.with_log_dir(dir.clone());
        }
        Ok(Compiler::compile_with_probes(active, &self.config.servers, &options)?)
    }

    async fn apply_core(&mut self, doc: CoreConfigDocument) -> AppResult<()> {
        if self.applied.as_ref() == Some(&doc) && self.is_core_running() {
            log::debug!("V2Ray config unchanged, keeping the running process");
            return Ok(());
        }
        match self.deps.supervisor.apply_new_config(doc.clone()).await {
            Ok(()) => {
                self.applied = Some(doc);
                Ok(())
            }
            Err(e) => {
                if !self.is_core_running() {
                    self.applied = None;
                }
                Err(e)
            }
        }
    }

    async fn stop_core(&mut self) -> AppResult<()> {
        self.applied = None;
        self.deps.supervisor.stop().await
    }

    /// 重新编译并应用当前配置，失败时回滚
    async fn reconfigure(&mut self, checkpoint: Checkpoint) -> AppResult<()> {
        if !self.mode.needs_core() {
            return Ok(());
        }
        self.generation += 1;
        self.transition(self.mode, checkpoint).await.map(|_| ())
    }

    async fn on_core_crashed(&mut self, reason: String) {
        if !self.mode.needs_core() {
            return;
        }
        let last = self.applied.take();

        if !self.auto_restart_used {
            self.auto_restart_used = true;
            match last.map_or_else(|| self.compile_active(), Ok) {
                Ok(doc) => {
                    log::warn!("V2Ray crashed ({}), restarting once", reason);
                    match self.apply_core(doc).await {
                        Ok(()) => {
                            self.warn(format!("V2Ray crashed and was restarted: {}", reason));
                            return;
                        }
                        Err(e) => log::error!("Automatic restart failed: {}", e),
                    }
                }
                Err(e) => log::error!("Cannot restart V2Ray: {}", e),
            }
        }

        log::error!("V2Ray could not be recovered, giving up");
        self.force_off(format!("V2Ray crashed: {}", reason)).await;
        self.publish();
        self.emit(ControllerEvent::PersistentFailure(reason));
    }

    // ---- 系统代理 ----

    async fn read_system_proxy(&self) -> SystemProxyState {
        let adapter = self.deps.adapter.clone();
        match tokio::task::spawn_blocking(move || adapter.get_system_proxy()).await {
            Ok(state) => state,
            Err(e) => {
                log::error!("System proxy read task failed: {}", e);
                SystemProxyState::disabled()
            }
        }
    }

    /// 先清除再写入 `state`（为 None 时只清除）
    ///
    /// 全部子命令失败时返回错误；部分失败作为警告返回。
    async fn write_system_proxy(&self, state: Option<SystemProxyState>) -> AppResult<Vec<String>> {
        let adapter = self.deps.adapter.clone();
        log::info!(
            "Writing system proxy via {}: {}",
            adapter.name(),
            state.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "disabled".to_string())
        );
        let (reset, set) = tokio::task::spawn_blocking(move || {
            let reset = adapter.reset_system_proxy();
            let set = state.map(|state| {
                let report = adapter.set_system_proxy(&state);
                (state, report)
            });
            (reset, set)
        })
        .await
        .map_err(|e| AppError::OsSettingWriteFailed(format!("proxy task failed: {}", e)))?;

        let mut warnings = Vec::new();
        match set {
            Some((state, report)) => {
                if report.all_failed() {
                    return Err(AppError::OsSettingWriteFailed(format!(
                        "{}: {}",
                        state,
                        report.failures.join("; ")
                    )));
                }
                warnings.extend(reset.failures);
                warnings.extend(report.failures);
            }
            None => {
                if reset.all_failed() {
                    return Err(AppError::OsSettingWriteFailed(format!(
                        "reset: {}",
                        reset.failures.join("; ")
                    )));
                }
                warnings.extend(reset.failures);
            }
        }
        for warning in &warnings {
            self.warn(format!("System proxy write partially failed: {}", warning));
        }
        Ok(warnings)
    }

    // ---- PAC ----

    async fn prepare_pac_rules(&mut self, force: bool) -> AppResult<usize> {
        let settings = &self.config.settings;
        let refresh = std::time::Duration::from_secs(u64::from(settings.gfw_list_refresh_hours) * 3600);
        let url = settings.gfw_list_url.clone();
        self.load_gfw_list(&url, refresh, force).await
    }

    async fn load_gfw_list(&mut self, url: &str, refresh: std::time::Duration, force: bool) -> AppResult<usize> {
        let proxy = self.local_proxy_url();
        let list = self
            .deps
            .gfw_cache
            .load(self.deps.fetcher.as_ref(), url, refresh, force, proxy.as_deref())
            .await?;
        if list.stale {
            self.warn("GFW list download failed, using the cached copy".to_string());
        }
        if list.fetched {
            self.config.gfw_list_updated_at = Some(now());
            self.persist();
            self.emit(ControllerEvent::GfwListUpdated {
                rules: list.rules.len(),
            });
        }
        let count = list.rules.len();
        self.pac_rules = Some(list.rules);
        let settings = self.config.settings.clone();
        self.regenerate_pac_script(&settings);
        Ok(count)
    }

    fn regenerate_pac_script(&self, settings: &AppSettings) {
        let Some(rules) = &self.pac_rules else {
            return;
        };
        let proxy = pac_proxy_string(settings.local_protocol, &settings.local_host, settings.local_port);
        self.pac.set_script(generate_pac(rules, &proxy));
    }

    async fn start_pac_server(&mut self, settings: &AppSettings) -> AppResult<()> {
        let addr: SocketAddr = format!("{}:{}", settings.local_host, settings.pac_port)
            .parse()
            .map_err(|e| CompileError::invalid_field("localHost", format!("{}", e)))?;
        self.pac.start(addr).await?;
        Ok(())
    }

    async fn update_gfw_list(&mut self, url: Option<String>) -> AppResult<usize> {
        let url = url.unwrap_or_else(|| self.config.settings.gfw_list_url.clone());
        validate_http_url("gfwListUrl", &url)?;
        let refresh = std::time::Duration::ZERO;
        self.load_gfw_list(&url, refresh, true).await
    }

    // ---- 服务器 ----

    async fn set_active_server(&mut self, name: String) -> AppResult<()> {
        if self.config.server(&name).is_none() {
            return Err(AppError::ServerNotFound(name));
        }
        if self.config.active_server.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        let checkpoint = self.checkpoint().await;
        log::info!("Selecting server {}", name);
        self.select(Some(name.clone()));
        self.reconfigure(checkpoint).await?;
        self.persist();
        self.emit(ControllerEvent::ActiveServerChanged(Some(name)));
        Ok(())
    }

    fn ensure_unique(&self, name: &str, except: Option<usize>) -> AppResult<()> {
        let taken = self
            .config
            .position(name)
            .is_some_and(|index| Some(index) != except);
        if taken {
            return Err(CompileError::invalid_field("name", format!("server `{}` already exists", name)).into());
        }
        Ok(())
    }

    fn add_server(&mut self, mut server: ServerDescriptor) -> AppResult<()> {
        server.name = server.name.trim().to_string();
        if server.name.is_empty() {
            return Err(CompileError::invalid_field("name", "must not be empty").into());
        }
        Compiler::validate(&server)?;
        self.ensure_unique(&server.name, None)?;

        log::info!("Adding server {}", server.name);
        server.latency = None;
        server.connected = false;
        let name = server.name.clone();
        self.config.servers.push(server);
        if self.config.active_server.is_none() {
            self.select(Some(name.clone()));
            self.emit(ControllerEvent::ActiveServerChanged(Some(name)));
        }
        self.persist();
        self.emit(ControllerEvent::ServersChanged);
        Ok(())
    }

    async fn edit_server(&mut self, name: String, mut server: ServerDescriptor) -> AppResult<()> {
        let index = self
            .config
            .position(&name)
            .ok_or_else(|| AppError::ServerNotFound(name.clone()))?;
        server.name = server.name.trim().to_string();
        if server.name.is_empty() {
            return Err(CompileError::invalid_field("name", "must not be empty").into());
        }
        Compiler::validate(&server)?;
        self.ensure_unique(&server.name, Some(index))?;

        let checkpoint = self.checkpoint().await;
        let current = &self.config.servers[index];
        let latency = if current.same_endpoint(&server) {
            current.latency.clone()
        } else {
            None
        };
        let is_active = self.config.active_server.as_deref() == Some(name.as_str());
        server.origin = current.origin.clone();
        server.latency = latency;
        log::info!("Updating server {}", name);
        self.config.servers[index] = server;

        if is_active {
            let new_name = self.config.servers[index].name.clone();
            self.select(Some(new_name));
            self.reconfigure(checkpoint).await?;
        } else {
            self.config.normalize();
        }
        self.persist();
        self.emit(ControllerEvent::ServersChanged);
        Ok(())
    }

    async fn remove_server(&mut self, name: String) -> AppResult<()> {
        let index = self
            .config
            .position(&name)
            .ok_or_else(|| AppError::ServerNotFound(name.clone()))?;
        let was_active = self.config.active_server.as_deref() == Some(name.as_str());

        if was_active && self.mode.needs_core() {
            self.force_off(format!("active server {} was removed", name)).await;
        }
        log::info!("Removing server {}", name);
        self.config.servers.remove(index);
        if was_active {
            self.select(None);
            self.emit(ControllerEvent::ActiveServerChanged(None));
        }
        self.persist();
        self.emit(ControllerEvent::ServersChanged);
        Ok(())
    }

    /// 追加解析出的服务器，重名时加后缀
    fn add_batch(&mut self, batch: SubscriptionBatch) -> ImportReport {
        let mut report = ImportReport {
            failures: batch.failures,
            ..ImportReport::default()
        };
        for mut server in batch.servers {
            server.name = unique_name(&server.name, &self.config.servers);
            server.latency = None;
            server.connected = false;
            report.added.push(server.name.clone());
            self.config.servers.push(server);
        }

        if report.added.is_empty() {
            return report;
        }
        log::info!("Imported {} servers", report.added.len());
        if self.config.active_server.is_none() {
            let first = report.added[0].clone();
            self.select(Some(first.clone()));
            self.emit(ControllerEvent::ActiveServerChanged(Some(first)));
        }
        self.persist();
        self.emit(ControllerEvent::ServersChanged);
        report
    }

    async fn import_subscription(&mut self, url: String) -> AppResult<ImportReport> {
        let url = url.trim().to_string();
        validate_http_url("url", &url)?;

        let proxy = self.local_proxy_url();
        log::info!("Updating subscription {} (via {})", url, proxy.as_deref().unwrap_or("direct"));
        let payload = self
            .deps
            .fetcher
            .fetch(&url, proxy.as_deref())
            .await
            .map_err(|e| AppError::fetch_failed(&url, format!("{:#}", e)))?;

        let origin = ServerOrigin::Subscription { url: url.clone() };
        let batch = parse_subscription(&payload, &origin);
        let failures = batch.failures;
        let incoming = batch.servers;
        if incoming.is_empty() {
            return Err(AppError::fetch_failed(&url, "subscription contains no usable servers"));
        }

        let checkpoint = self.checkpoint().await;
        let had_active = self.config.active_server.clone();
        let mut servers = self.config.servers.clone();
        let outcome = merge_subscription(&mut servers, &url, incoming);

        let active_removed = had_active
            .as_ref()
            .is_some_and(|name| outcome.removed.contains(name));
        if active_removed && self.mode.needs_core() {
            self.force_off(format!("active server {} left the subscription", url)).await;
        }
        self.config.servers = servers;
        if active_removed {
            self.select(None);
            self.emit(ControllerEvent::ActiveServerChanged(None));
        } else if had_active.is_none() {
            if let Some(first) = outcome.added.first().cloned() {
                self.select(Some(first.clone()));
                self.emit(ControllerEvent::ActiveServerChanged(Some(first)));
            }
        } else {
            self.config.normalize();
            let active_updated = had_active
                .as_ref()
                .is_some_and(|name| outcome.updated.contains(name));
            if active_updated {
                self.reconfigure(checkpoint).await?;
            }
        }

        let server_count = outcome.added.len() + outcome.updated.len();
        let record = SubscriptionRecord {
            url: url.clone(),
            updated_at: now(),
            server_count,
        };
        match self.config.subscriptions.iter_mut().find(|s| s.url == url) {
            Some(existing) => *existing = record,
            None => self.config.subscriptions.push(record),
        }
        self.persist();

        log::info!(
            "Subscription {}: {} added, {} updated, {} removed",
            url,
            outcome.added.len(),
            outcome.updated.len(),
            outcome.removed.len()
        );
        self.emit(ControllerEvent::SubscriptionImported {
            url,
            added: outcome.added.len(),
            updated: outcome.updated.len(),
            removed: outcome.removed.len(),
        });
        self.emit(ControllerEvent::ServersChanged);

        Ok(ImportReport {
            added: outcome.added,
            updated: outcome.updated,
            removed: outcome.removed,
            failures,
        })
    }

    // ---- 设置 ----

    async fn update_settings(&mut self, settings: AppSettings) -> AppResult<ModeTransition> {
        settings.validate()?;
        let checkpoint = self.checkpoint().await;
        self.config.settings = settings;

        let mode = self.mode;
        if !mode.needs_core() {
            self.persist();
            return Ok(ModeTransition {
                mode,
                warnings: vec![],
            });
        }
        if mode == ProxyMode::Pac {
            let settings = self.config.settings.clone();
            self.regenerate_pac_script(&settings);
        }
        self.generation += 1;
        self.transition(mode, checkpoint).await
    }

    // ---- 连通性 ----

    /// 并发请求各检测地址，在后台任务中回复，不阻塞其他请求
    fn network_status(&self, reply: Reply<NetworkStatus>) {
        let proxy = self.local_proxy_url();
        let urls = self.config.settings.network_check_urls.clone();
        let fetcher = Arc::clone(&self.deps.fetcher);
        log::info!(
            "Checking network status for {} urls (via {})",
            urls.len(),
            proxy.as_deref().unwrap_or("direct")
        );
        tokio::spawn(async move {
            let checks = join_all(urls.into_iter().map(|url| {
                let request = fetcher.fetch(&url, proxy.as_deref());
                async move {
                    match request.await {
                        Ok(_) => Reachability {
                            url,
                            accessible: true,
                            error: None,
                        },
                        Err(e) => {
                            log::debug!("{} is not accessible: {:#}", url, e);
                            Reachability {
                                url,
                                accessible: false,
                                error: Some(format!("{:#}", e)),
                            }
                        }
                    }
                }
            }))
            .await;
            let _ = reply.send(Ok(NetworkStatus { proxy, checks }));
        });
    }

    // ---- 测速 ----

    async fn probe_latency(
        &mut self,
        names: Option<Vec<String>>,
        latency_tx: &mpsc::UnboundedSender<LatencyMessage>,
    ) -> AppResult<mpsc::UnboundedReceiver<LatencyResult>> {
        if self.applied.is_none() || !self.is_core_running() {
            return Err(AppError::NotConnected);
        }

        let names = match names {
            Some(names) => {
                if let Some(missing) = names.iter().find(|n| self.config.server(n).is_none()) {
                    return Err(AppError::ServerNotFound(missing.clone()));
                }
                names
            }
            None => self.config.servers.iter().map(|s| s.name.clone()).collect(),
        };

        // 运行中增删改过服务器时，测速出站已过期，先重新应用
        let current = self.compile_active()?;
        if self.applied.as_ref() != Some(&current) {
            log::info!("Server list changed since the last apply, reloading V2Ray before measuring");
            let checkpoint = self.checkpoint().await;
            self.reconfigure(checkpoint).await?;
        }
        let doc = match &self.applied {
            Some(doc) if self.is_core_running() => doc,
            _ => return Err(AppError::NotConnected),
        };

        let inbound = doc
            .inbound(PROBE_INBOUND_TAG)
            .map(|inbound| (probe_host(&inbound.listen), inbound.port));
        let mut measurable = HashSet::new();
        let targets: Vec<ProbeTarget> = names
            .iter()
            .map(|name| {
                let tag = format!("probe-{}", Compiler::probe_key(name));
                match (&inbound, doc.outbound(&tag)) {
                    (Some((host, port)), Some(_)) => {
                        measurable.insert(name.clone());
                        ProbeTarget::via_probe_inbound(name, host, *port)
                    }
                    _ => {
                        log::warn!("Server {} has no probe outbound, reporting it unreachable", name);
                        ProbeTarget::unreachable(name)
                    }
                }
            })
            .collect();

        self.generation += 1;
        log::info!("Measuring latency for {} servers", targets.len());
        let settings = &self.config.settings;
        let probe = LatencyProbe::new(
            Arc::clone(&self.deps.transport),
            settings.latency_target.clone(),
            settings.latency_timeout(),
        );
        let mut results = probe.measure(targets);

        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let internal = latency_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                // 没有测速出站的服务器未经实际测量，只告知调用方，不保存
                if measurable.contains(&result.name) {
                    let _ = internal.send((generation, result.clone()));
                }
                let _ = caller_tx.send(result);
            }
        });
        Ok(caller_rx)
    }

    fn record_latency(&mut self, generation: u64, result: LatencyResult) {
        if generation != self.generation {
            log::debug!("Discarding stale latency result for {}", result.name);
            return;
        }
        let Some(server) = self.config.server_mut(&result.name) else {
            return;
        };
        server.latency = Some(LatencyRecord {
            outcome: result.outcome,
            measured_at: now(),
        });
        self.persist();
        self.publish();
        self.emit(ControllerEvent::LatencyMeasured(result));
    }
}

/// 监听所有地址时通过回环地址连接
fn probe_host(listen: &str) -> String {
    match listen {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" => "::1".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_host() {
        assert_eq!(probe_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(probe_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(probe_host("::"), "::1");
    }

    #[test]
    fn test_owns_system_proxy() {
        assert!(owns_system_proxy(ProxyMode::Global));
        assert!(owns_system_proxy(ProxyMode::Pac));
        assert!(!owns_system_proxy(ProxyMode::Manual));
        assert!(!owns_system_proxy(ProxyMode::Off));
    }
}
