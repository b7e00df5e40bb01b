use anyhow::Result;
use std::path::PathBuf;

const APP_DIR_NAME: &str = "V2Ray Desktop";

/// 获取应用数据目录
pub fn get_app_data_dir() -> Result<PathBuf> {
    let path = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot find data directory"))?
        .join(APP_DIR_NAME);

    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// 获取应用配置目录
pub fn get_app_config_dir() -> Result<PathBuf> {
    let path = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot find config directory"))?
        .join(APP_DIR_NAME);

    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// 获取应用配置文件路径
pub fn get_app_config_path() -> Result<PathBuf> {
    Ok(get_app_config_dir()?.join("config.json"))
}

/// 获取内核配置文件路径
pub fn get_core_config_path() -> Result<PathBuf> {
    let dir = get_app_data_dir()?.join("v2ray");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("config.json"))
}

/// 内核 PID 文件
pub fn get_core_pid_path() -> Result<PathBuf> {
    Ok(get_app_data_dir()?.join("v2ray.pid"))
}

/// GFW 列表缓存
pub fn get_gfw_list_path() -> Result<PathBuf> {
    Ok(get_app_data_dir()?.join("gfwlist.txt"))
}

/// 获取日志目录
pub fn get_logs_dir() -> Result<PathBuf> {
    let logs_dir = get_app_data_dir()?.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    Ok(logs_dir)
}

pub fn get_core_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "v2ray.exe"
    } else {
        "v2ray"
    }
}

/// 查找内核可执行文件
///
/// 优先使用配置中的路径，其次是数据目录下的 `core/`，最后交给 PATH 查找。
pub fn resolve_core_binary(configured: Option<&str>) -> PathBuf {
    if let Some(path) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Ok(data_dir) = get_app_data_dir() {
        let bundled = data_dir.join("core").join(get_core_binary_name());
        if bundled.exists() {
            return bundled;
        }
    }
    PathBuf::from(get_core_binary_name())
}
