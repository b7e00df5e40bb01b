use std::process::Command;
use std::time::Duration;

#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

/// 创建不弹出控制台窗口的命令
pub fn hidden_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut command = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command
}

/// 请求进程退出（unix 发送 SIGTERM，Windows 使用不带 /F 的 taskkill）
pub fn terminate_process(pid: u32) -> bool {
    #[cfg(unix)]
    let sent = unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 };
    #[cfg(windows)]
    let sent = hidden_command("taskkill")
        .args(["/PID", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    sent
}

/// 通过 PID 杀死进程：先请求退出，等待后强制结束
pub fn kill_process_by_pid(pid: u32, grace: Duration) {
    if terminate_process(pid) {
        log::info!("Sent terminate signal to process {}", pid);
        std::thread::sleep(grace);
    }
    if !is_pid_running(pid) {
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    #[cfg(windows)]
    {
        let _ = hidden_command("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output();
    }
    log::info!("Force killed process {}", pid);
}

/// 判断 PID 是否存在
pub fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    let running = unsafe { libc::kill(pid as i32, 0) == 0 };
    #[cfg(windows)]
    let running = {
        const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
        const STILL_ACTIVE: u32 = 259;

        extern "system" {
            fn OpenProcess(
                dwDesiredAccess: u32,
                bInheritHandle: i32,
                dwProcessId: u32,
            ) -> *mut std::ffi::c_void;
            fn GetExitCodeProcess(hProcess: *mut std::ffi::c_void, lpExitCode: *mut u32) -> i32;
            fn CloseHandle(hObject: *mut std::ffi::c_void) -> i32;
        }

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            let mut exit_code: u32 = 0;
            let result = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);
            result != 0 && exit_code == STILL_ACTIVE
        }
    };
    running
}
