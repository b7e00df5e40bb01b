use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warp::Filter;

use crate::error::{AppError, AppResult};

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// 本地 PAC 服务：`GET /proxy.pac`
///
/// 脚本保存在共享锁中，更新后立即对新请求生效，无需重启监听。
pub struct PacServer {
    script: Arc<RwLock<String>>,
    running: Option<RunningServer>,
}

impl PacServer {
    pub fn new() -> Self {
        Self {
            script: Arc::new(RwLock::new(String::new())),
            running: None,
        }
    }

    pub fn set_script(&self, script: String) {
        match self.script.write() {
            Ok(mut guard) => *guard = script,
            Err(poisoned) => *poisoned.into_inner() = script,
        }
    }

    pub fn script(&self) -> String {
        self.script.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// 绑定并开始服务；已在同一地址运行时直接返回
    pub async fn start(&mut self, addr: SocketAddr) -> AppResult<SocketAddr> {
        if let Some(running) = &self.running {
            if running.addr == addr {
                return Ok(addr);
            }
            self.stop().await;
        }

        let script = self.script.clone();
        let pac = warp::path("proxy.pac")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let body = script.read().map(|s| s.clone()).unwrap_or_default();
                warp::http::Response::builder()
                    .header("content-type", PAC_CONTENT_TYPE)
                    .body(body)
            })
            .with(warp::log("v2ray-desktop::pac"));

        let (shutdown, rx) = oneshot::channel::<()>();
        let (bound, server) = warp::serve(pac)
            .try_bind_with_graceful_shutdown(addr, async {
                let _ = rx.await;
            })
            .map_err(|e| {
                log::error!("Failed to bind PAC server on {}: {}", addr, e);
                AppError::PacBindFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let task = tokio::spawn(server);
        log::info!("PAC server listening on http://{}/proxy.pac", bound);
        self.running = Some(RunningServer {
            addr: bound,
            shutdown,
            task,
        });
        Ok(bound)
    }

    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if tokio::time::timeout(std::time::Duration::from_secs(2), running.task)
            .await
            .is_err()
        {
            log::warn!("PAC server did not shut down in time");
        }
        log::info!("PAC server on {} stopped", running.addr);
    }
}

impl Default for PacServer {
    fn default() -> Self {
        Self::new()
    }
}
