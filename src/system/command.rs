use anyhow::{anyhow, Result};
use std::process::Stdio;
use std::sync::mpsc;
use std::time::Duration;

use crate::utils::{hidden_command, kill_process_by_pid};

/// 外部命令的输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// 运行外部命令
///
/// 系统代理适配器只通过这个接口访问操作系统，测试中可以替换。
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// 真实进程实现，每次调用都有等待上限
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let child = hidden_command(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", program, e))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(output)) => Ok(CommandOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(anyhow!("Failed to wait for {}: {}", program, e)),
            Err(_) => {
                log::warn!("{} {:?} timed out after {:?}", program, args, self.timeout);
                kill_process_by_pid(pid, Duration::from_millis(100));
                Err(anyhow!("{} timed out after {:?}", program, self.timeout))
            }
        }
    }
}
