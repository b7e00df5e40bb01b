use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::Duration;

use crate::system::{CommandRunner, SystemCommandRunner};
use crate::utils::{hidden_command, terminate_process};

/// `v2ray -test` 的检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Passed,
    Rejected(String),
}

/// 正在运行的内核进程
pub trait CoreChild: Send + Sync {
    fn id(&self) -> u32;
    /// 已退出时返回退出描述
    fn try_wait(&mut self) -> std::io::Result<Option<String>>;
    /// 请求退出（SIGTERM / 不带 /F 的 taskkill）
    fn terminate(&mut self);
    fn kill(&mut self);
}

/// 内核可执行文件的启动接口
pub trait CoreLauncher: Send + Sync {
    fn launch(&self, config_path: &Path) -> Result<Box<dyn CoreChild>>;
    fn preflight(&self, config_path: &Path) -> Result<Preflight>;
    fn version(&self) -> Option<String>;
}

/// 调用 v2ray 可执行文件
pub struct V2RayLauncher {
    binary: PathBuf,
    runner: SystemCommandRunner,
}

impl V2RayLauncher {
    pub fn new(binary: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            runner: SystemCommandRunner::new(command_timeout),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn binary_str(&self) -> String {
        self.binary.to_string_lossy().to_string()
    }
}

impl CoreLauncher for V2RayLauncher {
    fn launch(&self, config_path: &Path) -> Result<Box<dyn CoreChild>> {
        let config_str = config_path.to_string_lossy().to_string();
        let mut command = hidden_command(&self.binary_str());
        command.args(["-config", &config_str]);
        if let Some(dir) = config_path.parent() {
            command.current_dir(dir);
        }
        // 内核日志写到 log 块指定的文件，stdout/stderr 不读，必须丢弃以免管道写满阻塞
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", self.binary.display(), e))?;
        Ok(Box::new(ProcessChild(child)))
    }

    fn preflight(&self, config_path: &Path) -> Result<Preflight> {
        let config_str = config_path.to_string_lossy().to_string();
        let output = self
            .runner
            .run(&self.binary_str(), &["-test", "-config", &config_str])?;
        if output.success {
            return Ok(Preflight::Passed);
        }
        let text = if output.stderr.trim().is_empty() {
            output.stdout
        } else {
            output.stderr
        };
        let reason = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("configuration test failed")
            .to_string();
        Ok(Preflight::Rejected(reason))
    }

    fn version(&self) -> Option<String> {
        let output = self.runner.run(&self.binary_str(), &["-version"]).ok()?;
        if !output.success {
            return None;
        }
        output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}

struct ProcessChild(Child);

impl CoreChild for ProcessChild {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<String>> {
        Ok(self.0.try_wait()?.map(|status| status.to_string()))
    }

    fn terminate(&mut self) {
        terminate_process(self.0.id());
    }

    fn kill(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-v2ray");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_preflight_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(
            dir.path(),
            r#"case "$1" in
  -version) echo "V2Ray 4.45.2 (V2Fly, a community-driven edition of V2Ray.)"; echo "A unified platform";;
  -test) grep -q broken "$3" && { echo "Failed to start: invalid config" >&2; exit 23; }; echo "Configuration OK.";;
esac"#,
        );
        let launcher = V2RayLauncher::new(&binary, Duration::from_secs(5));
        assert_eq!(
            launcher.version().as_deref(),
            Some("V2Ray 4.45.2 (V2Fly, a community-driven edition of V2Ray.)")
        );

        let good = dir.path().join("good.json");
        std::fs::write(&good, "{}").unwrap();
        assert_eq!(launcher.preflight(&good).unwrap(), Preflight::Passed);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "broken").unwrap();
        assert_eq!(
            launcher.preflight(&bad).unwrap(),
            Preflight::Rejected("Failed to start: invalid config".to_string())
        );
    }

    #[test]
    fn test_missing_binary() {
        let launcher = V2RayLauncher::new("/nonexistent/v2ray", Duration::from_secs(1));
        assert!(launcher.version().is_none());
        assert!(launcher.preflight(Path::new("/tmp/config.json")).is_err());
        assert!(launcher.launch(Path::new("/tmp/config.json")).is_err());
    }

    #[test]
    fn test_launch_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "exec sleep 30");
        let launcher = V2RayLauncher::new(&binary, Duration::from_secs(5));
        let mut child = launcher.launch(&dir.path().join("config.json")).unwrap();
        assert!(child.try_wait().unwrap().is_none());
        child.terminate();
        let mut exited = None;
        for _ in 0..50 {
            exited = child.try_wait().unwrap();
            if exited.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(exited.is_some());
    }
}
